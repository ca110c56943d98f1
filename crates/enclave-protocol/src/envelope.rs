//! Envelopes sent by the runtime over the control socket.
//!
//! The envelope is a closed enum: each `type` carries exactly its own payload,
//! and every consumer matches it exhaustively.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolResult;
use crate::stream::UnifiedStreamEvent;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeEventEnvelope {
    /// A live event, forwarded verbatim to observers.
    StreamEvent { event: UnifiedStreamEvent },
    /// A complete harness message (kept for the run result, not persisted).
    Message { message: Value },
    /// One raw transcript line; the unit of durable persistence.
    SessionLine {
        sdk_session_id: String,
        line: String,
        /// Internal lines are stored but hidden from the user timeline.
        #[serde(default)]
        internal: bool,
    },
    /// The runtime switched to a new internal session id.
    SessionUpdate { sdk_session_id: String },
    Result(RuntimeResult),
    Error { error: String },
    Done,
    Log {
        level: LogLevel,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        extra: Option<Value>,
    },
}

impl RuntimeEventEnvelope {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StreamEvent { .. } => "stream_event",
            Self::Message { .. } => "message",
            Self::SessionLine { .. } => "session_line",
            Self::SessionUpdate { .. } => "session_update",
            Self::Result(_) => "result",
            Self::Error { .. } => "error",
            Self::Done => "done",
            Self::Log { .. } => "log",
        }
    }

    pub fn to_payload(&self) -> ProtocolResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_payload(payload: &[u8]) -> ProtocolResult<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Final accounting reported by the runtime at the end of a turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_turns: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk_session_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    #[serde(alias = "warn")]
    Warning,
    Error,
}
