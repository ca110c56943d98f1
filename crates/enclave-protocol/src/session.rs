//! Persisted session entries.
//!
//! Transcript lines come from the runtime verbatim; pending-tool markers and
//! tool results are written by the orchestrator around an approval pause.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::error::{ProtocolError, ProtocolResult};
use crate::ids::{LineId, ToolCallId};
use crate::stream::ToolCallContent;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEntryKind {
    Transcript,
    /// Tool call paused for a human decision.
    PendingTool { tool_call: ToolCallContent },
    ToolResult { tool_call_id: ToolCallId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEntry {
    pub line_id: LineId,
    pub kind: SessionEntryKind,
    #[serde(default)]
    pub internal: bool,
    pub content: Value,
    pub recorded_at: DateTime<Utc>,
}

/// Outcome of executing (or denying) one paused tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultEntry {
    pub tool_call_id: ToolCallId,
    pub tool_name: String,
    pub output: Value,
    pub is_error: bool,
}

/// Derive the dedup key of a transcript line: its embedded `uuid`, or the
/// SHA-256 of the raw bytes when the harness did not stamp one.
pub fn line_id_for(parsed: &Value, raw: &str) -> LineId {
    match parsed.get("uuid").and_then(Value::as_str) {
        Some(uuid) if !uuid.is_empty() => LineId::from_string(uuid),
        _ => LineId::from_string(format!("sha256:{}", hex::encode(Sha256::digest(raw.as_bytes())))),
    }
}

impl SessionEntry {
    pub fn transcript(raw_line: &str, internal: bool) -> ProtocolResult<Self> {
        let content: Value = serde_json::from_str(raw_line)
            .map_err(|error| ProtocolError::InvalidPayload(format!("session line is not JSON: {error}")))?;
        Ok(Self {
            line_id: line_id_for(&content, raw_line),
            kind: SessionEntryKind::Transcript,
            internal,
            content,
            recorded_at: Utc::now(),
        })
    }

    pub fn pending_tool(tool_call: ToolCallContent) -> Self {
        Self {
            line_id: LineId::from_string(format!("pending:{}", tool_call.id)),
            content: json!({
                "id": tool_call.id,
                "name": tool_call.name,
                "input": tool_call.input,
            }),
            kind: SessionEntryKind::PendingTool { tool_call },
            internal: true,
            recorded_at: Utc::now(),
        }
    }

    /// Build the transcript line that answers a paused tool call.
    pub fn tool_result(result: &ToolResultEntry, sdk_session_id: Option<&str>) -> Self {
        let rendered = match &result.output {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        let content = json!({
            "type": "user",
            "uuid": uuid::Uuid::new_v4().to_string(),
            "sessionId": sdk_session_id,
            "message": {
                "role": "user",
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": result.tool_call_id,
                    "content": rendered,
                    "is_error": result.is_error,
                }],
            },
        });
        Self {
            line_id: LineId::from_string(format!("tool-result:{}", result.tool_call_id)),
            kind: SessionEntryKind::ToolResult {
                tool_call_id: result.tool_call_id.clone(),
            },
            internal: false,
            content,
            recorded_at: Utc::now(),
        }
    }

    pub fn pending_tool_call(&self) -> Option<&ToolCallContent> {
        match &self.kind {
            SessionEntryKind::PendingTool { tool_call } => Some(tool_call),
            _ => None,
        }
    }

    /// The JSONL row handed back to the runtime on resume. Pending markers
    /// are orchestrator bookkeeping and never part of the transcript.
    pub fn transcript_line(&self) -> Option<String> {
        match self.kind {
            SessionEntryKind::Transcript | SessionEntryKind::ToolResult { .. } => {
                Some(self.content.to_string())
            }
            SessionEntryKind::PendingTool { .. } => None,
        }
    }

    /// `tool_use_id`s answered by `tool_result` blocks inside this line.
    pub fn answered_tool_call_ids(&self) -> Vec<&str> {
        self.content_block_field("tool_result", "tool_use_id")
    }

    /// Ids of the `tool_use` blocks this line proposes.
    pub fn proposed_tool_call_ids(&self) -> Vec<&str> {
        self.content_block_field("tool_use", "id")
    }

    fn content_block_field(&self, block_type: &str, field: &str) -> Vec<&str> {
        self.content
            .pointer("/message/content")
            .and_then(Value::as_array)
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|block| block.get("type").and_then(Value::as_str) == Some(block_type))
                    .filter_map(|block| block.get(field).and_then(Value::as_str))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_ids_prefer_embedded_uuid_then_hash() {
        let raw = r#"{"uuid":"abc-123","type":"assistant"}"#;
        let entry = SessionEntry::transcript(raw, false).unwrap();
        assert_eq!(entry.line_id.as_str(), "abc-123");

        let raw = r#"{"type":"summary","summary":"x"}"#;
        let first = SessionEntry::transcript(raw, true).unwrap();
        let second = SessionEntry::transcript(raw, true).unwrap();
        assert!(first.line_id.as_str().starts_with("sha256:"));
        assert_eq!(first.line_id, second.line_id);

        assert!(SessionEntry::transcript("{not json", false).is_err());
    }

    #[test]
    fn tool_result_line_answers_its_call() {
        let result = ToolResultEntry {
            tool_call_id: ToolCallId::from("toolu_9"),
            tool_name: "core__http_request".to_owned(),
            output: json!({"status": 200}),
            is_error: false,
        };
        let entry = SessionEntry::tool_result(&result, Some("sdk-1"));
        assert_eq!(entry.answered_tool_call_ids(), vec!["toolu_9"]);
        assert_eq!(entry.content["sessionId"], "sdk-1");
        assert!(entry.transcript_line().is_some());

        let pending = SessionEntry::pending_tool(ToolCallContent {
            id: ToolCallId::from("toolu_9"),
            name: "core__http_request".to_owned(),
            input: json!({}),
        });
        assert!(pending.transcript_line().is_none());
        assert!(pending.proposed_tool_call_ids().is_empty());

        let assistant = SessionEntry::transcript(
            &json!({"uuid": "a1", "message": {"content": [
                {"type": "text", "text": "calling"},
                {"type": "tool_use", "id": "toolu_9", "name": "core__http_request", "input": {}}
            ]}})
            .to_string(),
            false,
        )
        .unwrap();
        assert_eq!(assistant.proposed_tool_call_ids(), vec!["toolu_9"]);
        assert!(assistant.answered_tool_call_ids().is_empty());
        assert_eq!(pending.pending_tool_call().unwrap().id.as_str(), "toolu_9");
    }
}
