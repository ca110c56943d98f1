//! Harness-agnostic stream events forwarded to live observers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::ToolCallId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventType {
    TextStart,
    TextDelta,
    TextStop,
    ThinkingStart,
    ThinkingDelta,
    ThinkingStop,
    ToolCallStart,
    ToolCallDelta,
    ToolCallStop,
    ToolResult,
    MessageStart,
    MessageStop,
    ApprovalRequest,
    Error,
    Done,
}

/// A tool call as exchanged during approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallContent {
    pub id: ToolCallId,
    pub name: String,
    #[serde(default)]
    pub input: Value,
}

/// One partial or complete event from the agent loop.
///
/// `part_id` correlates a start/delta/stop triple. The payload fields are
/// flat and optional; which ones are set depends on `event_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedStreamEvent {
    #[serde(rename = "type")]
    pub event_type: StreamEventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<ToolCallId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_items: Option<Vec<ToolCallContent>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UnifiedStreamEvent {
    pub fn new(event_type: StreamEventType) -> Self {
        Self {
            event_type,
            part_id: None,
            text: None,
            thinking: None,
            tool_call_id: None,
            tool_name: None,
            tool_input: None,
            tool_output: None,
            is_error: None,
            approval_items: None,
            error: None,
        }
    }

    pub fn text_delta(part_id: u32, text: impl Into<String>) -> Self {
        Self {
            part_id: Some(part_id),
            text: Some(text.into()),
            ..Self::new(StreamEventType::TextDelta)
        }
    }

    pub fn approval_request(items: Vec<ToolCallContent>) -> Self {
        Self {
            approval_items: Some(items),
            ..Self::new(StreamEventType::ApprovalRequest)
        }
    }

    pub fn tool_result(
        tool_call_id: ToolCallId,
        tool_name: impl Into<String>,
        output: Value,
        is_error: bool,
    ) -> Self {
        Self {
            tool_call_id: Some(tool_call_id),
            tool_name: Some(tool_name.into()),
            tool_output: Some(output),
            is_error: Some(is_error),
            ..Self::new(StreamEventType::ToolResult)
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::new(StreamEventType::Error)
        }
    }
}
