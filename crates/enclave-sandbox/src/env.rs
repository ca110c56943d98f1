//! Environment variables set on the runtime process.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::{SandboxError, SandboxResult};

pub const SOCKET_DIR_VAR: &str = "ENCLAVE_SOCKET_DIR";
pub const CONTROL_SOCKET_VAR: &str = "ENCLAVE_CONTROL_SOCKET";
pub const LLM_SOCKET_VAR: &str = "ENCLAVE_LLM_SOCKET";
pub const ALLOW_NETWORK_VAR: &str = "ENCLAVE_ALLOW_NETWORK";

/// What the runtime learns about its surroundings at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEnv {
    pub socket_dir: PathBuf,
    pub control_socket: PathBuf,
    pub llm_socket: PathBuf,
    pub allow_network: bool,
}

impl RuntimeEnv {
    pub fn to_vars(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (SOCKET_DIR_VAR.to_owned(), self.socket_dir.display().to_string()),
            (CONTROL_SOCKET_VAR.to_owned(), self.control_socket.display().to_string()),
            (LLM_SOCKET_VAR.to_owned(), self.llm_socket.display().to_string()),
            (
                ALLOW_NETWORK_VAR.to_owned(),
                if self.allow_network { "1" } else { "0" }.to_owned(),
            ),
        ])
    }

    /// Read the contract back inside the runtime.
    pub fn from_env() -> SandboxResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> SandboxResult<Self> {
        let required = |name: &str| {
            lookup(name).ok_or_else(|| SandboxError::Validation(format!("{name} is not set")))
        };
        let socket_dir = PathBuf::from(required(SOCKET_DIR_VAR)?);
        let control_socket = lookup(CONTROL_SOCKET_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| socket_dir.join("control.sock"));
        let llm_socket = lookup(LLM_SOCKET_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| socket_dir.join("llm.sock"));
        let allow_network = matches!(lookup(ALLOW_NETWORK_VAR).as_deref(), Some("1" | "true"));
        Ok(Self {
            socket_dir,
            control_socket,
            llm_socket,
            allow_network,
        })
    }
}
