//! Per-tool-call approval decisions.
//!
//! ```text
//! pending_approval ──approve──▶ approved_queued ──▶ executed
//!        │
//!        └────deny───▶ denied
//! ```
//!
//! Every other transition is rejected, so a call can be executed at most once
//! and a denied call can never be executed.

use std::fmt;

use chrono::{DateTime, Utc};
use enclave_protocol::{ToolCallContent, ToolCallId};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    PendingApproval,
    ApprovedQueued,
    Denied,
    Executed,
}

impl ApprovalState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PendingApproval => "pending_approval",
            Self::ApprovedQueued => "approved_queued",
            Self::Denied => "denied",
            Self::Executed => "executed",
        }
    }

    fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::PendingApproval, Self::ApprovedQueued)
                | (Self::PendingApproval, Self::Denied)
                | (Self::ApprovedQueued, Self::Executed)
        )
    }
}

impl fmt::Display for ApprovalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApprovalError {
    #[error("no pending approval for tool call {0}")]
    UnknownToolCall(ToolCallId),
    #[error("tool call {tool_call_id}: illegal transition {from} -> {to}")]
    IllegalTransition {
        tool_call_id: ToolCallId,
        from: ApprovalState,
        to: ApprovalState,
    },
}

pub type ApprovalResult<T> = Result<T, ApprovalError>;

/// A human decision on one pending tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Decision {
    Approve {
        /// Replaces the model's proposed arguments when present.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        override_args: Option<Value>,
    },
    Deny {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl Decision {
    fn target_state(&self) -> ApprovalState {
        match self {
            Self::Approve { .. } => ApprovalState::ApprovedQueued,
            Self::Deny { .. } => ApprovalState::Denied,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub tool_call_id: ToolCallId,
    #[serde(flatten)]
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

impl ApprovalDecision {
    pub fn approve(tool_call_id: impl Into<ToolCallId>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            decision: Decision::Approve {
                override_args: None,
            },
            actor: None,
        }
    }

    pub fn deny(tool_call_id: impl Into<ToolCallId>, reason: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            decision: Decision::Deny {
                reason: Some(reason.into()),
            },
            actor: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalRecord {
    pub tool_call: ToolCallContent,
    pub state: ApprovalState,
    pub decision: Option<Decision>,
    pub actor: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ApprovalRecord {
    /// Arguments to execute with: the reviewer's override, else the proposal.
    pub fn effective_input(&self) -> &Value {
        match &self.decision {
            Some(Decision::Approve {
                override_args: Some(args),
            }) => args,
            _ => &self.tool_call.input,
        }
    }

    pub fn denial_reason(&self) -> Option<&str> {
        match &self.decision {
            Some(Decision::Deny { reason }) => reason.as_deref(),
            _ => None,
        }
    }
}

/// Decision state for the tool calls of one approval round, in request order.
#[derive(Debug, Default, Clone)]
pub struct ApprovalLedger {
    records: IndexMap<ToolCallId, ApprovalRecord>,
}

impl ApprovalLedger {
    pub fn from_pending(calls: impl IntoIterator<Item = ToolCallContent>) -> Self {
        let mut ledger = Self::default();
        for call in calls {
            ledger.request(call);
        }
        ledger
    }

    /// Record a call awaiting approval. Returns false if the id is already
    /// known, in which case its state is left untouched.
    pub fn request(&mut self, tool_call: ToolCallContent) -> bool {
        if self.records.contains_key(&tool_call.id) {
            return false;
        }
        self.records.insert(
            tool_call.id.clone(),
            ApprovalRecord {
                tool_call,
                state: ApprovalState::PendingApproval,
                decision: None,
                actor: None,
                updated_at: Utc::now(),
            },
        );
        true
    }

    pub fn decide(&mut self, decision: ApprovalDecision) -> ApprovalResult<&ApprovalRecord> {
        let ApprovalDecision {
            tool_call_id,
            decision,
            actor,
        } = decision;
        let next = decision.target_state();
        let record = self.transition(&tool_call_id, next)?;
        record.decision = Some(decision);
        record.actor = actor;
        Ok(&*record)
    }

    /// Deny every call still awaiting a decision.
    pub fn deny_undecided(&mut self, reason: &str) -> usize {
        let undecided: Vec<ToolCallId> = self
            .in_state(ApprovalState::PendingApproval)
            .map(|record| record.tool_call.id.clone())
            .collect();
        for tool_call_id in &undecided {
            // Pending records always accept a denial.
            let _ = self.decide(ApprovalDecision::deny(tool_call_id.clone(), reason));
        }
        undecided.len()
    }

    pub fn mark_executed(&mut self, tool_call_id: &ToolCallId) -> ApprovalResult<()> {
        self.transition(tool_call_id, ApprovalState::Executed)?;
        Ok(())
    }

    pub fn get(&self, tool_call_id: &ToolCallId) -> Option<&ApprovalRecord> {
        self.records.get(tool_call_id)
    }

    pub fn records(&self) -> impl Iterator<Item = &ApprovalRecord> {
        self.records.values()
    }

    pub fn in_state(&self, state: ApprovalState) -> impl Iterator<Item = &ApprovalRecord> {
        self.records
            .values()
            .filter(move |record| record.state == state)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn transition(
        &mut self,
        tool_call_id: &ToolCallId,
        next: ApprovalState,
    ) -> ApprovalResult<&mut ApprovalRecord> {
        let record = self
            .records
            .get_mut(tool_call_id)
            .ok_or_else(|| ApprovalError::UnknownToolCall(tool_call_id.clone()))?;
        if !record.state.can_transition_to(next) {
            return Err(ApprovalError::IllegalTransition {
                tool_call_id: tool_call_id.clone(),
                from: record.state,
                to: next,
            });
        }
        debug!(tool_call_id = %tool_call_id, from = %record.state, to = %next, "approval transition");
        record.state = next;
        record.updated_at = Utc::now();
        Ok(record)
    }
}
