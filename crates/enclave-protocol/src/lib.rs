//! # enclave-protocol: contract between orchestrator and sandboxed runtime
//!
//! This crate defines everything both sides of the sandbox boundary must agree
//! on: the byte-level framing, the typed init payload and event envelopes, the
//! capability claims carried inside tokens, and the narrow ports through which
//! the core talks to its external collaborators.
//!
//! It only depends on tokio's I/O traits so the runtime side can link it
//! without pulling in the orchestrator stack.
//!
//! ## Module Overview
//!
//! - [`ids`]: Typed ID wrappers (SessionId, JobId, LineId, ...)
//! - [`frame`]: Length-prefixed frame encoding/decoding
//! - [`channel`]: Typed control-socket endpoint for both sides
//! - [`init`]: RuntimeInitPayload and agent config
//! - [`envelope`]: RuntimeEventEnvelope (closed tagged enum)
//! - [`stream`]: UnifiedStreamEvent, ToolCallContent
//! - [`claims`]: Tool-execution and LLM-access token claims
//! - [`session`]: Persisted session entries and line-id derivation
//! - [`ports`]: Collaborator ports (session store, actions, events, heartbeat)
//! - [`error`]: ProtocolError, PortError

pub mod channel;
pub mod claims;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod ids;
pub mod init;
pub mod ports;
pub mod session;
pub mod stream;

pub use channel::ControlChannel;
pub use claims::{LlmAccessClaims, RegisteredClaims, ToolExecutionClaims, UserMcpServerConfig};
pub use envelope::{LogLevel, RuntimeEventEnvelope, RuntimeResult, TokenUsage};
pub use error::{PortError, PortResult, ProtocolError, ProtocolResult};
pub use frame::{Frame, MAX_PAYLOAD_SIZE, MessageType, encode_frame, read_frame, write_frame};
pub use ids::{JobId, LineId, OrganizationId, SessionId, ToolCallId, UserId, WorkspaceId};
pub use init::{ResumeState, RuntimeInitPayload, SandboxAgentConfig, StdioServerSpec, ToolDefinition};
pub use ports::{
    ActionLock, ActionResolverPort, AppendOutcome, EventChannelPort, EventSink, HeartbeatDetails,
    HeartbeatPort, NoopHeartbeat, SessionStorePort,
};
pub use session::{SessionEntry, SessionEntryKind, ToolResultEntry, line_id_for};
pub use stream::{StreamEventType, ToolCallContent, UnifiedStreamEvent};
