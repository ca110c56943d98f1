use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
    /// Rejected before touching the filesystem.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to bind {}: {source}", path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to signal process {pid}: {message}")]
    Signal { pid: u32, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<enclave_protocol::ProtocolError> for SandboxError {
    fn from(error: enclave_protocol::ProtocolError) -> Self {
        Self::Validation(error.to_string())
    }
}

pub type SandboxResult<T> = Result<T, SandboxError>;
