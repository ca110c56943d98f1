//! Typed endpoint over the control socket.
//!
//! Both sides share one type: the orchestrator calls `send_init` then loops
//! on `recv_envelope`; the runtime calls `recv_init` then `send_envelope`.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::envelope::RuntimeEventEnvelope;
use crate::error::ProtocolResult;
use crate::frame::{MessageType, read_frame, write_frame};
use crate::init::RuntimeInitPayload;

#[derive(Debug)]
pub struct ControlChannel<S> {
    stream: S,
}

impl<S> ControlChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub async fn send_init(&mut self, init: &RuntimeInitPayload) -> ProtocolResult<()> {
        let payload = init.to_payload()?;
        write_frame(&mut self.stream, MessageType::Init, &payload).await
    }

    pub async fn recv_init(&mut self) -> ProtocolResult<RuntimeInitPayload> {
        let frame = read_frame(&mut self.stream, Some(MessageType::Init)).await?;
        RuntimeInitPayload::from_payload(&frame.payload)
    }

    pub async fn send_envelope(&mut self, envelope: &RuntimeEventEnvelope) -> ProtocolResult<()> {
        let payload = envelope.to_payload()?;
        write_frame(&mut self.stream, MessageType::Event, &payload).await
    }

    /// Next envelope from the runtime. A clean close between frames surfaces
    /// as `Disconnected { received: 0, .. }`.
    pub async fn recv_envelope(&mut self) -> ProtocolResult<RuntimeEventEnvelope> {
        let frame = read_frame(&mut self.stream, Some(MessageType::Event)).await?;
        RuntimeEventEnvelope::from_payload(&frame.payload)
    }

    pub async fn shutdown(&mut self) -> ProtocolResult<()> {
        self.stream.shutdown().await?;
        Ok(())
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}
