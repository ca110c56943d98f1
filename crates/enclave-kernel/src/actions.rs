//! In-process action catalog used when the host has no external action
//! system.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use enclave_approval::{INTERNAL_TOOL_PREFIX, action_to_tool_name};
use enclave_protocol::{
    ActionLock, ActionResolverPort, PortError, PortResult, ToolDefinition, ToolExecutionClaims,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Echo,
    Sha256,
    CurrentTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDefinition {
    /// Dotted action name, e.g. `core.echo`. Internal tools use their bare
    /// name.
    pub name: String,
    pub description: String,
    pub version: String,
    /// Internal tools are authorized by `allowed_internal_tools` and never
    /// go through resolution.
    pub internal: bool,
    pub parameters: Value,
    pub kind: ActionKind,
}

impl ActionDefinition {
    /// The name the model sees for this action.
    pub fn tool_name(&self) -> String {
        if self.internal {
            format!("{INTERNAL_TOOL_PREFIX}{}", self.name)
        } else {
            action_to_tool_name(&self.name)
        }
    }

    pub fn tool_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.tool_name(),
            description: self.description.clone(),
            parameters_json_schema: self.parameters.clone(),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ActionRegistry {
    actions: HashMap<String, ActionDefinition>,
}

impl ActionRegistry {
    pub fn register(&mut self, definition: ActionDefinition) {
        self.actions.insert(definition.name.clone(), definition);
    }

    pub fn get(&self, name: &str) -> Option<&ActionDefinition> {
        self.actions.get(name)
    }

    pub fn definitions(&self) -> impl Iterator<Item = &ActionDefinition> {
        self.actions.values()
    }

    /// Tool definitions keyed by tool name, in the shape the init payload
    /// carries.
    pub fn tool_definitions<'a>(
        &self,
        names: impl IntoIterator<Item = &'a str>,
    ) -> BTreeMap<String, ToolDefinition> {
        names
            .into_iter()
            .filter_map(|name| self.get(name))
            .map(|action| (action.tool_name(), action.tool_definition()))
            .collect()
    }

    pub fn with_core_actions() -> Self {
        let mut registry = Self::default();

        registry.register(ActionDefinition {
            name: "core.echo".to_owned(),
            description: "Return the arguments unchanged".to_owned(),
            version: "1".to_owned(),
            internal: false,
            parameters: json!({"type": "object"}),
            kind: ActionKind::Echo,
        });

        registry.register(ActionDefinition {
            name: "core.sha256".to_owned(),
            description: "SHA-256 digest of a UTF-8 string, hex encoded".to_owned(),
            version: "1".to_owned(),
            internal: false,
            parameters: json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            }),
            kind: ActionKind::Sha256,
        });

        registry.register(ActionDefinition {
            name: "current_time".to_owned(),
            description: "Current UTC time in RFC 3339 format".to_owned(),
            version: "1".to_owned(),
            internal: true,
            parameters: json!({"type": "object"}),
            kind: ActionKind::CurrentTime,
        });

        registry
    }
}

#[async_trait]
impl ActionResolverPort for ActionRegistry {
    async fn resolve(&self, action_names: &[String]) -> PortResult<ActionLock> {
        let mut bindings = BTreeMap::new();
        for name in action_names {
            let action = self
                .get(name)
                .filter(|action| !action.internal)
                .ok_or_else(|| PortError::NotFound(format!("action {name}")))?;
            bindings.insert(name.clone(), action.version.clone());
        }
        debug!(actions = bindings.len(), "resolved action lock");
        Ok(ActionLock::new(bindings))
    }

    #[instrument(skip(self, args, claims, lock), fields(action = action_name))]
    async fn execute(
        &self,
        action_name: &str,
        args: Value,
        claims: &ToolExecutionClaims,
        lock: &ActionLock,
    ) -> PortResult<Value> {
        let action = self
            .get(action_name)
            .ok_or_else(|| PortError::NotFound(format!("action {action_name}")))?;
        if action.internal {
            if !claims.allows_internal_tool(action_name) {
                return Err(PortError::Denied(format!("internal tool {action_name}")));
            }
        } else if lock.version_of(action_name) != Some(action.version.as_str()) {
            return Err(PortError::InvalidState(format!(
                "action {action_name} is not bound in the lock"
            )));
        }

        match action.kind {
            ActionKind::Echo => Ok(args),
            ActionKind::Sha256 => {
                let text = args
                    .get("text")
                    .and_then(Value::as_str)
                    .ok_or_else(|| PortError::Validation("missing string field `text`".to_owned()))?;
                let digest = Sha256::digest(text.as_bytes());
                Ok(json!({ "sha256": hex::encode(digest) }))
            }
            ActionKind::CurrentTime => Ok(json!({ "now": Utc::now().to_rfc3339() })),
        }
    }
}
