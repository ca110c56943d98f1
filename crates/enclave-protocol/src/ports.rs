//! Collaborator ports.
//!
//! These traits are the only boundary between the execution core and the
//! systems it does not own: session persistence, action resolution, the live
//! event channel and the supervisor that expects heartbeats.
//!
//! Object-safety note:
//! - Traits use `async-trait` for async dyn-dispatch.
//! - The event channel hands out shared `Arc<dyn EventSink>` handles.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::claims::ToolExecutionClaims;
use crate::error::PortResult;
use crate::ids::SessionId;
use crate::session::{SessionEntry, ToolResultEntry};
use crate::stream::UnifiedStreamEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppendOutcome {
    Appended,
    /// An entry with the same line id already existed; nothing was written.
    Duplicate,
}

#[async_trait]
pub trait SessionStorePort: Send + Sync {
    async fn append(&self, session_id: &SessionId, entry: SessionEntry) -> PortResult<AppendOutcome>;

    /// All entries of a session in insertion order.
    async fn list(&self, session_id: &SessionId) -> PortResult<Vec<SessionEntry>>;

    /// Atomically swap pending-tool markers for their results. Markers with
    /// no matching result are left in place. A result always lands after the
    /// line proposing its call, taking the place of the runtime's interrupted
    /// placeholder when there is one. Returns how many were replaced.
    async fn replace_pending_with_results(
        &self,
        session_id: &SessionId,
        results: Vec<ToolResultEntry>,
    ) -> PortResult<usize>;

    /// Record the runtime's internal session id. Returns `true` when the id
    /// changed.
    async fn set_runtime_session_id(
        &self,
        session_id: &SessionId,
        sdk_session_id: &str,
    ) -> PortResult<bool>;

    async fn runtime_session_id(&self, session_id: &SessionId) -> PortResult<Option<String>>;
}

/// Names bound to fixed implementation versions for the duration of one call.
///
/// The binding is produced by the resolver and only ever handed back to it;
/// the core never inspects versions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionLock {
    bindings: BTreeMap<String, String>,
}

impl ActionLock {
    pub fn new(bindings: BTreeMap<String, String>) -> Self {
        Self { bindings }
    }

    pub fn contains(&self, action_name: &str) -> bool {
        self.bindings.contains_key(action_name)
    }

    pub fn version_of(&self, action_name: &str) -> Option<&str> {
        self.bindings.get(action_name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

#[async_trait]
pub trait ActionResolverPort: Send + Sync {
    async fn resolve(&self, action_names: &[String]) -> PortResult<ActionLock>;

    async fn execute(
        &self,
        action_name: &str,
        args: Value,
        claims: &ToolExecutionClaims,
        lock: &ActionLock,
    ) -> PortResult<Value>;
}

/// One live stream for one session.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn append(&self, event: &UnifiedStreamEvent) -> PortResult<()>;
    async fn error(&self, message: &str) -> PortResult<()>;
    async fn done(&self) -> PortResult<()>;
}

#[async_trait]
pub trait EventChannelPort: Send + Sync {
    async fn open(&self, session_id: &SessionId) -> PortResult<Arc<dyn EventSink>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatDetails {
    pub session_id: SessionId,
    pub phase: String,
    pub elapsed_ms: u64,
}

/// The calling supervisor. Heartbeats must be cheap and never block.
pub trait HeartbeatPort: Send + Sync {
    fn heartbeat(&self, details: HeartbeatDetails);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHeartbeat;

impl HeartbeatPort for NoopHeartbeat {
    fn heartbeat(&self, _details: HeartbeatDetails) {}
}
