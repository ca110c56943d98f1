//! Per-run job directory.
//!
//! ```text
//! <base>/<job_id>/          0700
//!   sockets/                0700
//!     control.sock          0600
//!     llm.sock              0600
//! ```
//!
//! The directory lives exactly as long as one executor run.

use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use enclave_protocol::JobId;
use tracing::{debug, warn};

use crate::error::SandboxResult;
use crate::socket::validate_socket_path;

pub const CONTROL_SOCKET_NAME: &str = "control.sock";
pub const LLM_SOCKET_NAME: &str = "llm.sock";

#[derive(Debug, Clone)]
pub struct JobDirectory {
    job_id: JobId,
    root: PathBuf,
    sockets: PathBuf,
}

impl JobDirectory {
    /// Create `<base>/<job_id>/sockets`, both private to the owner.
    pub fn create(base: &Path, job_id: JobId) -> SandboxResult<Self> {
        job_id.validate()?;
        let root = base.join(job_id.as_str());
        let sockets = root.join("sockets");
        validate_socket_path(&sockets.join(CONTROL_SOCKET_NAME))?;

        std::fs::create_dir_all(base)?;
        let mut builder = std::fs::DirBuilder::new();
        builder.mode(0o700);
        builder.create(&root)?;
        builder.create(&sockets)?;
        debug!(job_id = %job_id, root = %root.display(), "created job directory");

        Ok(Self {
            job_id,
            root,
            sockets,
        })
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn socket_dir(&self) -> &Path {
        &self.sockets
    }

    pub fn control_socket(&self) -> PathBuf {
        self.sockets.join(CONTROL_SOCKET_NAME)
    }

    pub fn llm_socket(&self) -> PathBuf {
        self.sockets.join(LLM_SOCKET_NAME)
    }

    /// Recursively delete the job directory. Already gone is not an error.
    pub async fn remove(&self) -> SandboxResult<()> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => {
                debug!(job_id = %self.job_id, "removed job directory");
                Ok(())
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    /// Synchronous variant for drop paths. Failures are logged.
    pub fn remove_blocking(&self) {
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => debug!(job_id = %self.job_id, "removed job directory"),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => {
                warn!(job_id = %self.job_id, error = %error, "failed to remove job directory")
            }
        }
    }
}
