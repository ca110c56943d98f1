//! Reference runtime that speaks the control protocol without a model.
//!
//! It echoes the prompt back. A prompt naming one of the allowed tools
//! (e.g. `core__echo`) proposes a call to it, which pauses for approval when
//! the agent's tool-approval map requires it. A continuation run reports the
//! tool results it was resumed with.

use std::process::ExitCode;

use anyhow::{Context, Result};
use enclave_approval::{GateDecision, PreToolUseGate};
use enclave_protocol::{
    ControlChannel, LogLevel, RuntimeEventEnvelope, RuntimeInitPayload, RuntimeResult,
    StreamEventType, ToolCallContent, ToolCallId, UnifiedStreamEvent,
};
use enclave_sandbox::RuntimeEnv;
use serde_json::{Value, json};
use tokio::net::UnixStream;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .compact()
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("enclave-echo-runtime: {error:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let env = RuntimeEnv::from_env().context("runtime environment is incomplete")?;
    let stream = UnixStream::connect(&env.control_socket)
        .await
        .with_context(|| format!("failed connecting to {}", env.control_socket.display()))?;
    let mut channel = ControlChannel::new(stream);
    let init = channel
        .recv_init()
        .await
        .context("failed receiving init payload")?;
    info!(session_id = %init.session_id, resumed = init.sdk_session_data.is_some(), "init received");

    for envelope in EchoTurn::new(&init).envelopes() {
        debug!(kind = envelope.kind(), "sending envelope");
        channel
            .send_envelope(&envelope)
            .await
            .context("failed sending envelope")?;
    }
    channel.shutdown().await.context("failed closing control socket")?;
    Ok(())
}

/// Everything one echo turn emits, in order.
struct EchoTurn<'a> {
    init: &'a RuntimeInitPayload,
    sdk_session_id: String,
    next_line: usize,
    out: Vec<RuntimeEventEnvelope>,
}

impl<'a> EchoTurn<'a> {
    fn new(init: &'a RuntimeInitPayload) -> Self {
        let sdk_session_id = init
            .sdk_session_id
            .clone()
            .unwrap_or_else(|| format!("echo-{}", init.session_id));
        let next_line = init
            .sdk_session_data
            .as_deref()
            .map_or(0, |data| data.lines().count());
        Self {
            init,
            sdk_session_id,
            next_line,
            out: Vec::new(),
        }
    }

    fn envelopes(mut self) -> Vec<RuntimeEventEnvelope> {
        self.out.push(RuntimeEventEnvelope::Log {
            level: LogLevel::Info,
            message: "echo runtime started".to_owned(),
            extra: Some(json!({
                "resumed_lines": self.next_line,
                "tools": self.init.allowed_actions.len(),
            })),
        });
        self.out.push(RuntimeEventEnvelope::SessionUpdate {
            sdk_session_id: self.sdk_session_id.clone(),
        });

        let text = if self.init.is_approval_continuation {
            self.continuation_text()
        } else {
            let prompt = self.init.user_prompt.clone().unwrap_or_default();
            self.line(json!({
                "type": "user",
                "message": {"role": "user", "content": prompt},
            }));
            let calls = self.proposed_calls(&prompt);
            let text = format!("echo: {prompt}");
            if self.answer(&text, &calls) {
                return self.out;
            }
            text
        };

        if self.init.is_approval_continuation {
            self.answer(&text, &[]);
        }
        self.out.push(RuntimeEventEnvelope::Result(RuntimeResult {
            num_turns: Some(1),
            output: Some(Value::String(text)),
            sdk_session_id: Some(self.sdk_session_id.clone()),
            ..RuntimeResult::default()
        }));
        self.out.push(RuntimeEventEnvelope::Done);
        self.out
    }

    /// Stream `text`, persist the assistant line, and pause if any call
    /// needs approval. Returns whether the turn paused.
    fn answer(&mut self, text: &str, calls: &[ToolCallContent]) -> bool {
        self.out.push(stream(UnifiedStreamEvent {
            part_id: Some(0),
            ..UnifiedStreamEvent::new(StreamEventType::TextStart)
        }));
        self.out.push(stream(UnifiedStreamEvent::text_delta(0, text)));
        self.out.push(stream(UnifiedStreamEvent {
            part_id: Some(0),
            ..UnifiedStreamEvent::new(StreamEventType::TextStop)
        }));

        let mut content = vec![json!({"type": "text", "text": text})];
        content.extend(calls.iter().map(|call| {
            json!({"type": "tool_use", "id": call.id, "name": call.name, "input": call.input})
        }));
        let message = json!({"role": "assistant", "content": content});
        self.out.push(RuntimeEventEnvelope::Message {
            message: message.clone(),
        });
        self.line(json!({"type": "assistant", "message": message}));

        let mut gate = PreToolUseGate::from_config(&self.init.config);
        let mut unattended = Vec::new();
        for call in calls {
            if gate.check(call) == GateDecision::Allow {
                unattended.push(call);
            }
        }
        if let Some(request) = gate.take_approval_request() {
            self.out.push(request);
            self.out.push(RuntimeEventEnvelope::Done);
            return true;
        }
        for call in unattended {
            let output = json!("the echo runtime does not execute tools");
            self.out.push(stream(UnifiedStreamEvent::tool_result(
                call.id.clone(),
                call.name.clone(),
                output.clone(),
                true,
            )));
            self.line(json!({
                "type": "user",
                "message": {"role": "user", "content": [{
                    "type": "tool_result",
                    "tool_use_id": call.id,
                    "content": output,
                    "is_error": true,
                }]},
            }));
        }
        false
    }

    fn proposed_calls(&self, prompt: &str) -> Vec<ToolCallContent> {
        self.init
            .allowed_actions
            .keys()
            .filter(|tool_name| prompt.contains(tool_name.as_str()))
            .enumerate()
            .map(|(index, tool_name)| ToolCallContent {
                id: ToolCallId::from(format!("toolu_{}_{index}", self.next_line)),
                name: tool_name.clone(),
                input: json!({"prompt": prompt}),
            })
            .collect()
    }

    fn continuation_text(&self) -> String {
        let results: Vec<String> = self
            .init
            .sdk_session_data
            .as_deref()
            .unwrap_or_default()
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|line| line.pointer("/message/content").and_then(Value::as_array).cloned())
            .flatten()
            .filter(|block| block.get("type").and_then(Value::as_str) == Some("tool_result"))
            .map(|block| {
                let id = block.get("tool_use_id").and_then(Value::as_str).unwrap_or("?");
                let content = match block.get("content") {
                    Some(Value::String(text)) => text.clone(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                format!("{id} => {content}")
            })
            .collect();
        if results.is_empty() {
            "no tool results to report".to_owned()
        } else {
            format!("tool results: {}", results.join("; "))
        }
    }

    fn line(&mut self, mut value: Value) {
        if let Value::Object(map) = &mut value {
            map.insert(
                "uuid".to_owned(),
                Value::String(format!("{}-{}", self.sdk_session_id, self.next_line)),
            );
            map.insert(
                "sessionId".to_owned(),
                Value::String(self.sdk_session_id.clone()),
            );
        }
        self.next_line += 1;
        self.out.push(RuntimeEventEnvelope::SessionLine {
            sdk_session_id: self.sdk_session_id.clone(),
            line: value.to_string(),
            internal: false,
        });
    }
}

fn stream(event: UnifiedStreamEvent) -> RuntimeEventEnvelope {
    RuntimeEventEnvelope::StreamEvent { event }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use enclave_protocol::{SandboxAgentConfig, SessionId, ToolDefinition};

    use super::*;

    fn init(prompt: &str, approvals: &[(&str, bool)]) -> RuntimeInitPayload {
        let mut config = SandboxAgentConfig::new("echo", "local");
        config.tool_approvals = approvals
            .iter()
            .map(|(name, required)| ((*name).to_owned(), *required))
            .collect();
        RuntimeInitPayload {
            session_id: SessionId::from("s-echo"),
            mcp_auth_token: String::new(),
            llm_auth_token: String::new(),
            config,
            allowed_actions: BTreeMap::from([(
                "core__echo".to_owned(),
                ToolDefinition {
                    name: "core__echo".to_owned(),
                    description: String::new(),
                    parameters_json_schema: json!({}),
                },
            )]),
            user_prompt: Some(prompt.to_owned()),
            sdk_session_id: None,
            sdk_session_data: None,
            is_approval_continuation: false,
            is_fork: false,
            mcp_servers: Vec::new(),
            llm_base_url: String::new(),
        }
    }

    fn kinds(envelopes: &[RuntimeEventEnvelope]) -> Vec<&'static str> {
        envelopes.iter().map(RuntimeEventEnvelope::kind).collect()
    }

    #[test]
    fn plain_prompt_echoes_and_finishes() {
        let init = init("hello", &[]);
        let envelopes = EchoTurn::new(&init).envelopes();
        assert_eq!(envelopes.last(), Some(&RuntimeEventEnvelope::Done));
        assert!(kinds(&envelopes).contains(&"result"));
        let lines = envelopes
            .iter()
            .filter(|envelope| matches!(envelope, RuntimeEventEnvelope::SessionLine { .. }))
            .count();
        assert_eq!(lines, 2);
    }

    #[test]
    fn gated_tool_pauses_the_turn() {
        let init = init("please use core__echo", &[("core.*", true)]);
        let envelopes = EchoTurn::new(&init).envelopes();
        let request = envelopes.iter().find_map(|envelope| match envelope {
            RuntimeEventEnvelope::StreamEvent { event } => event.approval_items.clone(),
            _ => None,
        });
        let items = request.expect("approval request");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "core__echo");
        assert!(!kinds(&envelopes).contains(&"result"));
        assert_eq!(envelopes.last(), Some(&RuntimeEventEnvelope::Done));
    }

    #[test]
    fn continuation_reports_tool_results() {
        let mut init = init("", &[]);
        init.is_approval_continuation = true;
        init.sdk_session_id = Some("echo-s".to_owned());
        init.sdk_session_data = Some(
            json!({"type": "user", "message": {"content": [
                {"type": "tool_result", "tool_use_id": "toolu_1_0", "content": "{\"ok\":true}"}
            ]}})
            .to_string(),
        );
        let envelopes = EchoTurn::new(&init).envelopes();
        let output = envelopes.iter().find_map(|envelope| match envelope {
            RuntimeEventEnvelope::Result(result) => result.output.clone(),
            _ => None,
        });
        assert_eq!(
            output,
            Some(json!("tool results: toolu_1_0 => {\"ok\":true}"))
        );
        let uuid = envelopes.iter().find_map(|envelope| match envelope {
            RuntimeEventEnvelope::SessionLine { line, .. } => Some(line.clone()),
            _ => None,
        });
        assert!(uuid.unwrap_or_default().contains("echo-s-1"));
    }
}
