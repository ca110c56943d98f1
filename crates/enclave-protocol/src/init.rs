//! The one-shot payload the orchestrator sends when the runtime connects.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolResult;
use crate::ids::SessionId;

/// Agent configuration as seen from inside the sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxAgentConfig {
    pub model_name: String,
    pub model_provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    /// Tool name → whether calling it requires human approval.
    #[serde(default)]
    pub tool_approvals: BTreeMap<String, bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_type: Option<Value>,
    #[serde(default)]
    pub enable_internet_access: bool,
    #[serde(default)]
    pub model_settings: Value,
}

impl SandboxAgentConfig {
    pub fn new(model_name: impl Into<String>, model_provider: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            model_provider: model_provider.into(),
            instructions: None,
            tool_approvals: BTreeMap::new(),
            output_type: None,
            enable_internet_access: false,
            model_settings: Value::Null,
        }
    }
}

/// A resolved tool the model may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_json_schema: Value,
}

/// A command-based (stdio) tool server the runtime should start itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StdioServerSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Transcript state for resuming a previous runtime session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeState {
    pub sdk_session_id: String,
    /// Raw JSONL transcript, one session line per row.
    pub sdk_session_data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeInitPayload {
    pub session_id: SessionId,
    pub mcp_auth_token: String,
    pub llm_auth_token: String,
    pub config: SandboxAgentConfig,
    /// Tool name → definition.
    #[serde(default)]
    pub allowed_actions: BTreeMap<String, ToolDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk_session_data: Option<String>,
    #[serde(default)]
    pub is_approval_continuation: bool,
    #[serde(default)]
    pub is_fork: bool,
    #[serde(default)]
    pub mcp_servers: Vec<StdioServerSpec>,
    /// Base URL the runtime must use for LLM traffic (served by the proxy socket).
    pub llm_base_url: String,
}

impl RuntimeInitPayload {
    pub fn resume_state(&self) -> Option<ResumeState> {
        match (&self.sdk_session_id, &self.sdk_session_data) {
            (Some(id), Some(data)) => Some(ResumeState {
                sdk_session_id: id.clone(),
                sdk_session_data: data.clone(),
            }),
            _ => None,
        }
    }

    pub fn with_resume(mut self, resume: Option<ResumeState>) -> Self {
        match resume {
            Some(resume) => {
                self.sdk_session_id = Some(resume.sdk_session_id);
                self.sdk_session_data = Some(resume.sdk_session_data);
            }
            None => {
                self.sdk_session_id = None;
                self.sdk_session_data = None;
            }
        }
        self
    }

    pub fn to_payload(&self) -> ProtocolResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_payload(payload: &[u8]) -> ProtocolResult<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}
