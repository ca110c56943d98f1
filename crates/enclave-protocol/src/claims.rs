//! Claims carried inside capability tokens.
//!
//! The runtime never decodes these; it only forwards the opaque token. They
//! live here so the tool server and LLM gateway can share the types with the
//! minting side.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{OrganizationId, SessionId, UserId, WorkspaceId};

/// Standard JWT claims present in every capability token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredClaims {
    pub iss: String,
    pub aud: String,
    pub sub: String,
    /// Issued-at, seconds since UNIX epoch.
    pub iat: u64,
    /// Expiry, seconds since UNIX epoch.
    pub exp: u64,
    pub jti: String,
}

/// A user-defined tool server the tool-execution token may reach.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMcpServerConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExecutionClaims {
    pub workspace_id: WorkspaceId,
    pub organization_id: OrganizationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    pub session_id: SessionId,
    #[serde(default)]
    pub allowed_actions: BTreeSet<String>,
    #[serde(default)]
    pub allowed_internal_tools: BTreeSet<String>,
    #[serde(default)]
    pub user_mcp_servers: Vec<UserMcpServerConfig>,
    #[serde(default)]
    pub internal_tool_context: Value,
}

impl ToolExecutionClaims {
    pub fn allows_action(&self, action_name: &str) -> bool {
        self.allowed_actions.contains(action_name)
    }

    pub fn allows_internal_tool(&self, tool_name: &str) -> bool {
        self.allowed_internal_tools.contains(tool_name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmAccessClaims {
    pub workspace_id: WorkspaceId,
    pub organization_id: OrganizationId,
    pub session_id: SessionId,
    pub model: String,
    pub provider: String,
    #[serde(default)]
    pub model_settings: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_type: Option<Value>,
    /// Which credential set the gateway may use for this call.
    pub credential_scope: String,
}
