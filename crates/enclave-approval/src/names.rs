//! Tool names as the model sees them versus action names as the registry
//! knows them.
//!
//! The harness exposes registry actions as tools whose names use `__` in
//! place of `.` (`core__http_request` is `core.http_request`), optionally
//! behind an `mcp__<server>__` namespace. Tools prefixed with `internal__`
//! are platform tools that bypass the action registry.

use enclave_protocol::ToolExecutionClaims;

pub const INTERNAL_TOOL_PREFIX: &str = "internal__";

const MCP_PREFIX: &str = "mcp__";
const SEGMENT_SEPARATOR: &str = "__";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolTarget {
    /// A registry action, e.g. `core.http_request`.
    Action(String),
    /// A platform tool, named without its `internal__` prefix.
    Internal(String),
}

impl ToolTarget {
    pub fn name(&self) -> &str {
        match self {
            Self::Action(name) | Self::Internal(name) => name,
        }
    }

    /// Whether the tool-execution claims grant this target.
    pub fn is_allowed_by(&self, claims: &ToolExecutionClaims) -> bool {
        match self {
            Self::Action(name) => claims.allows_action(name),
            Self::Internal(name) => claims.allows_internal_tool(name),
        }
    }
}

/// Map a model-facing tool name to what it executes.
pub fn classify_tool(tool_name: &str) -> ToolTarget {
    let local = strip_mcp_namespace(tool_name);
    match local.strip_prefix(INTERNAL_TOOL_PREFIX) {
        Some(internal) => ToolTarget::Internal(internal.to_owned()),
        None => ToolTarget::Action(local.replace(SEGMENT_SEPARATOR, ".")),
    }
}

pub fn action_to_tool_name(action_name: &str) -> String {
    action_name.replace('.', SEGMENT_SEPARATOR)
}

fn strip_mcp_namespace(tool_name: &str) -> &str {
    tool_name
        .strip_prefix(MCP_PREFIX)
        .and_then(|rest| rest.split_once(SEGMENT_SEPARATOR))
        .map_or(tool_name, |(_server, local)| local)
}
