//! Orchestrator end of the control socket.
//!
//! ```text
//! connected ─▶ init_sent ─▶ streaming ─┬─▶ done
//!                                      ├─▶ errored
//!                                      └─▶ disconnected
//! ```
//!
//! The handler delivers one INIT frame, then consumes envelopes until the
//! runtime reports `done` or `error` or goes away. Live events are forwarded
//! and awaited before the next frame is read, so a slow observer throttles
//! the runtime through socket back-pressure. Whatever the exit, `done` is
//! published exactly once.

use std::sync::Arc;

use enclave_protocol::{
    AppendOutcome, ControlChannel, LogLevel, PortError, ProtocolError, RuntimeEventEnvelope,
    RuntimeInitPayload, RuntimeResult, SessionEntry, SessionId, SessionStorePort, StreamEventType,
    ToolCallContent, UnifiedStreamEvent,
};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, instrument, warn};

use crate::publisher::SessionPublisher;

#[derive(Debug, Error)]
pub enum LoopbackError {
    #[error("runtime went away before the init payload was delivered: {0}")]
    InitNotDelivered(#[source] ProtocolError),
    #[error("runtime disconnected mid-stream: {0}")]
    Disconnected(#[source] ProtocolError),
    #[error("control protocol violation: {0}")]
    Protocol(#[source] ProtocolError),
    #[error("runtime reported an error: {0}")]
    Runtime(String),
    #[error("failed persisting session state: {0}")]
    Persistence(#[source] PortError),
}

impl LoopbackError {
    fn from_read(error: ProtocolError) -> Self {
        match error {
            ProtocolError::Disconnected { .. } | ProtocolError::Io(_) => Self::Disconnected(error),
            other => Self::Protocol(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopbackPhase {
    Connected,
    InitSent,
    Streaming,
    Done,
    Errored,
    Disconnected,
}

/// What a completed loopback collected from the runtime.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoopbackOutcome {
    pub approval_requested: bool,
    pub approval_items: Vec<ToolCallContent>,
    pub result: Option<RuntimeResult>,
    pub messages: Vec<Value>,
    /// Latest internal session id the runtime reported.
    pub sdk_session_id: Option<String>,
    pub persisted_lines: usize,
    pub duplicate_lines: usize,
}

pub struct LoopbackHandler<S> {
    session_id: SessionId,
    channel: ControlChannel<S>,
    publisher: SessionPublisher,
    store: Arc<dyn SessionStorePort>,
    phase: LoopbackPhase,
}

impl<S> LoopbackHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        session_id: SessionId,
        stream: S,
        publisher: SessionPublisher,
        store: Arc<dyn SessionStorePort>,
    ) -> Self {
        Self {
            session_id,
            channel: ControlChannel::new(stream),
            publisher,
            store,
            phase: LoopbackPhase::Connected,
        }
    }

    pub fn phase(&self) -> LoopbackPhase {
        self.phase
    }

    #[instrument(skip_all, fields(session_id = %self.session_id))]
    pub async fn run(mut self, init: &RuntimeInitPayload) -> Result<LoopbackOutcome, LoopbackError> {
        let mut outcome = LoopbackOutcome::default();
        let result = self.drive(init, &mut outcome).await;

        match &result {
            Ok(()) => self.phase = LoopbackPhase::Done,
            Err(LoopbackError::InitNotDelivered(_) | LoopbackError::Disconnected(_)) => {
                self.phase = LoopbackPhase::Disconnected;
            }
            Err(_) => self.phase = LoopbackPhase::Errored,
        }
        if let Err(error) = &result
            && !matches!(error, LoopbackError::Runtime(_))
        {
            self.publisher.error(&error.to_string()).await;
        }
        self.publisher.done().await;
        if let Err(error) = self.channel.shutdown().await {
            debug!(error = %error, "control socket already closed");
        }

        info!(
            phase = ?self.phase,
            persisted = outcome.persisted_lines,
            duplicates = outcome.duplicate_lines,
            approval_requested = outcome.approval_requested,
            "loopback finished"
        );
        result.map(|()| outcome)
    }

    async fn drive(
        &mut self,
        init: &RuntimeInitPayload,
        outcome: &mut LoopbackOutcome,
    ) -> Result<(), LoopbackError> {
        self.channel
            .send_init(init)
            .await
            .map_err(LoopbackError::InitNotDelivered)?;
        self.phase = LoopbackPhase::InitSent;
        debug!("init delivered");

        loop {
            let envelope = self
                .channel
                .recv_envelope()
                .await
                .map_err(LoopbackError::from_read)?;
            self.phase = LoopbackPhase::Streaming;

            match envelope {
                RuntimeEventEnvelope::StreamEvent { event } => {
                    if event.event_type == StreamEventType::ApprovalRequest {
                        self.record_approval(&event, outcome).await?;
                    }
                    self.forward(&event).await;
                    if event.event_type == StreamEventType::Error {
                        let message = event
                            .error
                            .unwrap_or_else(|| "runtime stream error".to_owned());
                        self.publisher.error(&message).await;
                        return Err(LoopbackError::Runtime(message));
                    }
                }
                RuntimeEventEnvelope::Message { message } => outcome.messages.push(message),
                RuntimeEventEnvelope::SessionLine {
                    sdk_session_id,
                    line,
                    internal,
                } => {
                    self.tag_runtime_session(&sdk_session_id, outcome).await?;
                    self.persist_line(&line, internal, outcome).await?;
                }
                RuntimeEventEnvelope::SessionUpdate { sdk_session_id } => {
                    self.tag_runtime_session(&sdk_session_id, outcome).await?;
                }
                RuntimeEventEnvelope::Result(result) => {
                    if let Some(sdk_session_id) = &result.sdk_session_id {
                        self.tag_runtime_session(sdk_session_id, outcome).await?;
                    }
                    outcome.result = Some(result);
                }
                RuntimeEventEnvelope::Error { error } => {
                    self.publisher.error(&error).await;
                    return Err(LoopbackError::Runtime(error));
                }
                RuntimeEventEnvelope::Done => return Ok(()),
                RuntimeEventEnvelope::Log {
                    level,
                    message,
                    extra,
                } => emit_runtime_log(level, &message, extra.as_ref()),
            }
        }
    }

    async fn forward(&self, event: &UnifiedStreamEvent) {
        if let Err(error) = self.publisher.append(event).await {
            warn!(error = %error, event_type = ?event.event_type, "failed forwarding stream event");
        }
    }

    async fn record_approval(
        &self,
        event: &UnifiedStreamEvent,
        outcome: &mut LoopbackOutcome,
    ) -> Result<(), LoopbackError> {
        let items = event.approval_items.clone().unwrap_or_default();
        info!(items = items.len(), "runtime requested approval");
        outcome.approval_requested = true;
        for item in items {
            if outcome.approval_items.iter().any(|known| known.id == item.id) {
                continue;
            }
            self.store
                .append(&self.session_id, SessionEntry::pending_tool(item.clone()))
                .await
                .map_err(LoopbackError::Persistence)?;
            outcome.approval_items.push(item);
        }
        Ok(())
    }

    async fn persist_line(
        &self,
        line: &str,
        internal: bool,
        outcome: &mut LoopbackOutcome,
    ) -> Result<(), LoopbackError> {
        let entry = match SessionEntry::transcript(line, internal) {
            Ok(entry) => entry,
            Err(error) => {
                warn!(error = %error, "skipping unparseable session line");
                return Ok(());
            }
        };
        let line_id = entry.line_id.clone();
        match self
            .store
            .append(&self.session_id, entry)
            .await
            .map_err(LoopbackError::Persistence)?
        {
            AppendOutcome::Appended => outcome.persisted_lines += 1,
            AppendOutcome::Duplicate => {
                debug!(line_id = %line_id, "duplicate session line");
                outcome.duplicate_lines += 1;
            }
        }
        Ok(())
    }

    async fn tag_runtime_session(
        &self,
        sdk_session_id: &str,
        outcome: &mut LoopbackOutcome,
    ) -> Result<(), LoopbackError> {
        if sdk_session_id.is_empty() || outcome.sdk_session_id.as_deref() == Some(sdk_session_id) {
            return Ok(());
        }
        let changed = self
            .store
            .set_runtime_session_id(&self.session_id, sdk_session_id)
            .await
            .map_err(LoopbackError::Persistence)?;
        if changed {
            info!(sdk_session_id, "runtime session id recorded");
        }
        outcome.sdk_session_id = Some(sdk_session_id.to_owned());
        Ok(())
    }
}

fn emit_runtime_log(level: LogLevel, message: &str, extra: Option<&Value>) {
    let extra = extra.map(Value::to_string).unwrap_or_default();
    match level {
        LogLevel::Debug => tracing::debug!(target: "enclave::runtime", extra = %extra, "{message}"),
        LogLevel::Info => tracing::info!(target: "enclave::runtime", extra = %extra, "{message}"),
        LogLevel::Warning => tracing::warn!(target: "enclave::runtime", extra = %extra, "{message}"),
        LogLevel::Error => tracing::error!(target: "enclave::runtime", extra = %extra, "{message}"),
    }
}
