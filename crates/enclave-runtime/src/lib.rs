//! # enclave-runtime: one sandboxed agent run, start to finish
//!
//! - [`executor`]: job directory, proxy, launch, the supervision race and
//!   guaranteed cleanup
//! - [`loopback`]: the control-socket conversation with a connected runtime
//! - [`publisher`]: the run's event sink with an exactly-once `done`
//! - [`resume`]: rebuilding the transcript a resumed run starts from

pub mod executor;
pub mod loopback;
pub mod publisher;
pub mod resume;

pub use executor::{AgentExecutor, ExecutorConfig, ExecutorResult, RunOutcome};
pub use loopback::{LoopbackError, LoopbackHandler, LoopbackOutcome};
pub use publisher::SessionPublisher;
pub use resume::load_resume_state;
