use std::sync::Arc;

use async_trait::async_trait;
use enclave_protocol::{EventChannelPort, EventSink, PortResult, SessionId, UnifiedStreamEvent};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session_id: SessionId,
    #[serde(flatten)]
    pub kind: SessionEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEventKind {
    Stream { event: UnifiedStreamEvent },
    Error { message: String },
    Done,
}

/// In-process fan-out of live session events.
///
/// Publishing never blocks: a subscriber that falls more than `buffer`
/// events behind observes a lag instead of throttling the publisher.
#[derive(Clone, Debug)]
pub struct BroadcastEventChannel {
    sender: broadcast::Sender<SessionEvent>,
}

impl BroadcastEventChannel {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    pub fn subscribe_stream(&self) -> BroadcastStream<SessionEvent> {
        BroadcastStream::new(self.sender.subscribe())
    }

    fn publish(&self, event: SessionEvent) {
        trace!(session_id = %event.session_id, "publishing session event");
        let _ = self.sender.send(event);
    }
}

impl Default for BroadcastEventChannel {
    fn default() -> Self {
        Self::new(1024)
    }
}

struct BroadcastSink {
    session_id: SessionId,
    channel: BroadcastEventChannel,
}

#[async_trait]
impl EventSink for BroadcastSink {
    async fn append(&self, event: &UnifiedStreamEvent) -> PortResult<()> {
        self.channel.publish(SessionEvent {
            session_id: self.session_id.clone(),
            kind: SessionEventKind::Stream {
                event: event.clone(),
            },
        });
        Ok(())
    }

    async fn error(&self, message: &str) -> PortResult<()> {
        self.channel.publish(SessionEvent {
            session_id: self.session_id.clone(),
            kind: SessionEventKind::Error {
                message: message.to_owned(),
            },
        });
        Ok(())
    }

    async fn done(&self) -> PortResult<()> {
        self.channel.publish(SessionEvent {
            session_id: self.session_id.clone(),
            kind: SessionEventKind::Done,
        });
        Ok(())
    }
}

#[async_trait]
impl EventChannelPort for BroadcastEventChannel {
    async fn open(&self, session_id: &SessionId) -> PortResult<Arc<dyn EventSink>> {
        Ok(Arc::new(BroadcastSink {
            session_id: session_id.clone(),
            channel: self.clone(),
        }))
    }
}
