//! # enclave-sandbox: the orchestrator's side of process isolation
//!
//! - [`jobdir`]: per-run private directory holding the two sockets
//! - [`socket`]: owner-only Unix socket binding
//! - [`launcher`]: spawning, watching and terminating the runtime process
//! - [`env`]: the environment contract between launcher and runtime

pub mod env;
pub mod error;
pub mod jobdir;
pub mod launcher;
pub mod socket;

pub use env::RuntimeEnv;
pub use error::{SandboxError, SandboxResult};
pub use jobdir::JobDirectory;
pub use launcher::{
    LaunchSpec, LauncherConfig, LocalRuntimeLauncher, RuntimeExit, RuntimeHandle, RuntimeLauncher,
};
pub use socket::{MAX_SOCKET_PATH_LEN, bind_private_listener};
