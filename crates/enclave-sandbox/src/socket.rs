//! Owner-only Unix socket binding.
//!
//! The file mode is fixed by the process umask at `bind(2)` time, so the
//! socket never exists with wider permissions. umask is process-wide; binds
//! in this process are serialized behind [`UMASK_LOCK`].

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use nix::sys::stat::{Mode, umask};
use parking_lot::Mutex;
use tokio::net::UnixListener;
use tracing::debug;

use crate::error::{SandboxError, SandboxResult};

/// `sun_path` holds 108 bytes including the trailing NUL.
pub const MAX_SOCKET_PATH_LEN: usize = 107;

static UMASK_LOCK: Mutex<()> = Mutex::new(());

pub fn validate_socket_path(path: &Path) -> SandboxResult<()> {
    let len = path.as_os_str().len();
    if len > MAX_SOCKET_PATH_LEN {
        return Err(SandboxError::Validation(format!(
            "socket path is {len} bytes, limit is {MAX_SOCKET_PATH_LEN}: {}",
            path.display()
        )));
    }
    Ok(())
}

/// Bind a listener whose socket file is created 0600.
///
/// A stale file at `path` is removed first. Must be called inside a tokio
/// runtime.
pub fn bind_private_listener(path: &Path) -> SandboxResult<UnixListener> {
    validate_socket_path(path)?;

    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed stale socket"),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => return Err(error.into()),
    }

    let listener = {
        let _guard = UMASK_LOCK.lock();
        let previous = umask(Mode::from_bits_truncate(0o177));
        let bound = UnixListener::bind(path);
        umask(previous);
        bound
    }
    .map_err(|source| SandboxError::Bind {
        path: path.to_path_buf(),
        source,
    })?;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    debug!(path = %path.display(), "bound private socket");
    Ok(listener)
}
