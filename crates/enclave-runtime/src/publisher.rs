use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use enclave_protocol::{EventSink, PortResult, UnifiedStreamEvent};
use tracing::{debug, warn};

/// Event sink for one run, shared by the loopback handler and the executor.
///
/// Whichever side terminates the run publishes `done`; the latch makes every
/// later call a no-op.
#[derive(Clone)]
pub struct SessionPublisher {
    sink: Arc<dyn EventSink>,
    done: Arc<AtomicBool>,
}

impl SessionPublisher {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink,
            done: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn append(&self, event: &UnifiedStreamEvent) -> PortResult<()> {
        self.sink.append(event).await
    }

    /// Publish an error. Delivery failures are logged, never propagated.
    pub async fn error(&self, message: &str) {
        if self.is_done() {
            debug!(message, "run already done, dropping error event");
            return;
        }
        if let Err(error) = self.sink.error(message).await {
            warn!(error = %error, "failed publishing error event");
        }
    }

    /// Publish `done` unless it was already published. Returns whether this
    /// call published it.
    pub async fn done(&self) -> bool {
        if self.done.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Err(error) = self.sink.done().await {
            warn!(error = %error, "failed publishing done event");
        }
        true
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;

    /// Sink that records everything it is asked to publish.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) events: Mutex<Vec<UnifiedStreamEvent>>,
        pub(crate) errors: Mutex<Vec<String>>,
        pub(crate) done_calls: std::sync::atomic::AtomicUsize,
    }

    impl RecordingSink {
        pub(crate) fn done_count(&self) -> usize {
            self.done_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn append(&self, event: &UnifiedStreamEvent) -> PortResult<()> {
            self.events.lock().push(event.clone());
            Ok(())
        }

        async fn error(&self, message: &str) -> PortResult<()> {
            self.errors.lock().push(message.to_owned());
            Ok(())
        }

        async fn done(&self) -> PortResult<()> {
            self.done_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingSink;
    use super::*;

    #[tokio::test]
    async fn done_is_published_once_across_clones() {
        let sink = Arc::new(RecordingSink::default());
        let publisher = SessionPublisher::new(sink.clone());
        let other = publisher.clone();

        assert!(publisher.done().await);
        assert!(!other.done().await);
        other.error("late").await;

        assert_eq!(sink.done_count(), 1);
        assert!(sink.errors.lock().is_empty());
    }
}
