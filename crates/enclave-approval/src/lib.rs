//! # enclave-approval: pausing tool calls for a human decision
//!
//! - [`gate`]: runtime side: decides whether a proposed tool call may run
//!   now or must pause, and builds the `approval_request` envelope.
//! - [`ledger`]: orchestrator side: the per-call decision state machine
//!   `pending_approval → {approved_queued | denied}`, `approved_queued → executed`.
//! - [`names`]: mapping between model-facing tool names and action names.

pub mod gate;
pub mod ledger;
pub mod names;

pub use gate::{GateDecision, PreToolUseGate};
pub use ledger::{
    ApprovalDecision, ApprovalError, ApprovalLedger, ApprovalRecord, ApprovalResult, ApprovalState,
    Decision,
};
pub use names::{INTERNAL_TOOL_PREFIX, ToolTarget, action_to_tool_name, classify_tool};
