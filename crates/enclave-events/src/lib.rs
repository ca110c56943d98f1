//! Reference implementations of the session-persistence and event-channel
//! ports: JSONL files on local disk and an in-process broadcast hub.

mod channel;
mod store;

pub use channel::{BroadcastEventChannel, SessionEvent, SessionEventKind};
pub use store::FileSessionStore;
