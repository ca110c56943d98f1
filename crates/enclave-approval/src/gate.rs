//! Runtime-side approval gate.
//!
//! The harness calls [`PreToolUseGate::check`] before every tool call. Calls
//! that need a human are held back and, once the model turn ends, reported in
//! a single `approval_request` stream event.

use std::collections::BTreeMap;

use enclave_protocol::{RuntimeEventEnvelope, SandboxAgentConfig, ToolCallContent, UnifiedStreamEvent};
use tracing::debug;

use crate::names::classify_tool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    RequireApproval,
}

#[derive(Debug, Clone, Default)]
pub struct PreToolUseGate {
    tool_approvals: BTreeMap<String, bool>,
    held: Vec<ToolCallContent>,
}

impl PreToolUseGate {
    /// Keys are tool names or action names; a trailing `*` matches any suffix.
    pub fn new(tool_approvals: BTreeMap<String, bool>) -> Self {
        Self {
            tool_approvals,
            held: Vec::new(),
        }
    }

    pub fn from_config(config: &SandboxAgentConfig) -> Self {
        Self::new(config.tool_approvals.clone())
    }

    /// Whether `tool_name` needs approval. An exact key wins over wildcards,
    /// and the longest wildcard prefix wins among several.
    pub fn requires_approval(&self, tool_name: &str) -> bool {
        let action = classify_tool(tool_name);
        let candidates = [tool_name, action.name()];

        for candidate in candidates {
            if let Some(required) = self.tool_approvals.get(candidate) {
                return *required;
            }
        }

        self.tool_approvals
            .iter()
            .filter(|(pattern, _)| pattern.ends_with('*'))
            .filter(|(pattern, _)| candidates.iter().any(|c| matches(pattern, c)))
            .max_by_key(|(pattern, _)| pattern.len())
            .is_some_and(|(_, required)| *required)
    }

    pub fn check(&mut self, call: &ToolCallContent) -> GateDecision {
        if !self.requires_approval(&call.name) {
            return GateDecision::Allow;
        }
        if !self.held.iter().any(|held| held.id == call.id) {
            debug!(tool_call_id = %call.id, tool_name = %call.name, "holding tool call for approval");
            self.held.push(call.clone());
        }
        GateDecision::RequireApproval
    }

    pub fn has_held_calls(&self) -> bool {
        !self.held.is_empty()
    }

    /// Drain held calls into one `approval_request` envelope.
    pub fn take_approval_request(&mut self) -> Option<RuntimeEventEnvelope> {
        if self.held.is_empty() {
            return None;
        }
        let items = std::mem::take(&mut self.held);
        Some(RuntimeEventEnvelope::StreamEvent {
            event: UnifiedStreamEvent::approval_request(items),
        })
    }
}

fn matches(pattern: &str, actual: &str) -> bool {
    if pattern.ends_with('*') {
        let prefix = pattern.trim_end_matches('*');
        prefix.is_empty() || actual.starts_with(prefix)
    } else {
        pattern == actual
    }
}
