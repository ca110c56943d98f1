use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use enclave_kernel::{ActionRegistry, RunScope};
use enclave_protocol::{SandboxAgentConfig, SessionId};
use enclave_runtime::ExecutorConfig;
use serde::{Deserialize, Serialize};

/// Daemon configuration, read from TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub root: PathBuf,
    pub workspace_id: String,
    pub organization_id: String,
    /// Action names from the built-in catalog the agent may call.
    pub actions: Vec<String>,
    pub agent: SandboxAgentConfig,
    pub executor: ExecutorConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".enclave"),
            workspace_id: "local".to_owned(),
            organization_id: "local".to_owned(),
            actions: vec!["core.echo".to_owned()],
            agent: SandboxAgentConfig::new("echo", "local"),
            executor: ExecutorConfig::default(),
        }
    }
}

impl DaemonConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading config {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("failed parsing TOML")
    }

    pub fn scope(&self, registry: &ActionRegistry, session_id: SessionId) -> RunScope {
        RunScope::new(
            session_id,
            self.workspace_id.as_str(),
            self.organization_id.as_str(),
            self.agent.clone(),
        )
        .with_tools(registry.tool_definitions(self.actions.iter().map(String::as_str)))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn toml_overrides_keep_unset_defaults() {
        let config = DaemonConfig::parse(
            r#"
            root = "/var/lib/enclave"
            actions = ["core.echo", "current_time"]

            [agent]
            model_name = "claude-sonnet"
            model_provider = "anthropic"
            enable_internet_access = true

            [agent.tool_approvals]
            core__echo = true

            [executor]
            timeout_secs = 120
            jobs_root = "/run/enclave"

            [executor.launcher]
            command = "/usr/bin/agent-runtime"
            isolation_wrapper = ["unshare", "--net", "--"]
            "#,
        )
        .unwrap();

        assert_eq!(config.root, PathBuf::from("/var/lib/enclave"));
        assert_eq!(config.workspace_id, "local");
        assert!(config.agent.enable_internet_access);
        assert_eq!(config.agent.tool_approvals.get("core__echo"), Some(&true));
        assert_eq!(config.executor.timeout(), Duration::from_secs(120));
        assert_eq!(config.executor.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.executor.launcher.command, "/usr/bin/agent-runtime");
        assert_eq!(config.executor.launcher.stderr_tail_bytes, 8 * 1024);

        let scope = config.scope(&ActionRegistry::with_core_actions(), SessionId::from("s-1"));
        assert!(scope.tools.contains_key("core__echo"));
        assert!(scope.tools.contains_key("internal__current_time"));
    }

    #[test]
    fn mistyped_sections_are_rejected() {
        assert!(DaemonConfig::parse("executor = 3").is_err());
    }
}
