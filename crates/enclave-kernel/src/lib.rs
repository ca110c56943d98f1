//! # enclave-kernel: the execution core behind one facade
//!
//! [`KernelBuilder`] wires the file-backed session store, the broadcast event
//! channel, the local launcher, the token authority, the executor and the
//! approved-tool runner. [`EnclaveKernel`] turns a [`RunScope`] into signed
//! tokens and an init payload, and drives runs and approval continuations.

pub mod actions;

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use enclave_approval::{ApprovalDecision, ToolTarget, classify_tool};
use enclave_events::{BroadcastEventChannel, FileSessionStore, SessionEvent};
use enclave_protocol::{
    ActionResolverPort, HeartbeatPort, LlmAccessClaims, NoopHeartbeat, OrganizationId,
    RuntimeInitPayload, SandboxAgentConfig, SessionEntry, SessionId, SessionStorePort,
    StdioServerSpec, ToolDefinition, ToolExecutionClaims, UserId, UserMcpServerConfig,
    WorkspaceId,
};
use enclave_runtime::{AgentExecutor, ExecutorConfig, ExecutorResult, load_resume_state};
use enclave_sandbox::{LocalRuntimeLauncher, RuntimeLauncher};
use enclave_tokens::TokenAuthority;
use enclave_tools::{ApprovedToolRunner, ToolExecutionReport, ToolRunnerConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

pub use actions::{ActionDefinition, ActionKind, ActionRegistry};

/// Placeholder until the executor substitutes the job's proxy socket.
const UNBOUND_LLM_BASE_URL: &str = "http://localhost";

fn default_credential_scope() -> String {
    "workspace".to_owned()
}

/// Who a run acts for and what it may reach. Both capability tokens are
/// derived from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunScope {
    pub session_id: SessionId,
    pub workspace_id: WorkspaceId,
    pub organization_id: OrganizationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    pub agent: SandboxAgentConfig,
    /// Tool name → definition, as the model will see them.
    #[serde(default)]
    pub tools: BTreeMap<String, ToolDefinition>,
    #[serde(default)]
    pub mcp_servers: Vec<StdioServerSpec>,
    #[serde(default)]
    pub user_mcp_servers: Vec<UserMcpServerConfig>,
    #[serde(default)]
    pub internal_tool_context: Value,
    #[serde(default = "default_credential_scope")]
    pub credential_scope: String,
}

impl RunScope {
    pub fn new(
        session_id: impl Into<SessionId>,
        workspace_id: impl Into<WorkspaceId>,
        organization_id: impl Into<OrganizationId>,
        agent: SandboxAgentConfig,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            workspace_id: workspace_id.into(),
            organization_id: organization_id.into(),
            user_id: None,
            agent,
            tools: BTreeMap::new(),
            mcp_servers: Vec::new(),
            user_mcp_servers: Vec::new(),
            internal_tool_context: Value::Null,
            credential_scope: default_credential_scope(),
        }
    }

    pub fn with_tools(mut self, tools: BTreeMap<String, ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn tool_claims(&self) -> ToolExecutionClaims {
        let mut allowed_actions = BTreeSet::new();
        let mut allowed_internal_tools = BTreeSet::new();
        for tool_name in self.tools.keys() {
            match classify_tool(tool_name) {
                ToolTarget::Action(name) => allowed_actions.insert(name),
                ToolTarget::Internal(name) => allowed_internal_tools.insert(name),
            };
        }
        ToolExecutionClaims {
            workspace_id: self.workspace_id.clone(),
            organization_id: self.organization_id.clone(),
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
            allowed_actions,
            allowed_internal_tools,
            user_mcp_servers: self.user_mcp_servers.clone(),
            internal_tool_context: self.internal_tool_context.clone(),
        }
    }

    pub fn llm_claims(&self) -> LlmAccessClaims {
        LlmAccessClaims {
            workspace_id: self.workspace_id.clone(),
            organization_id: self.organization_id.clone(),
            session_id: self.session_id.clone(),
            model: self.agent.model_name.clone(),
            provider: self.agent.model_provider.clone(),
            model_settings: self.agent.model_settings.clone(),
            output_type: self.agent.output_type.clone(),
            credential_scope: self.credential_scope.clone(),
        }
    }
}

/// Result of applying approval decisions and resuming the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalContinuation {
    pub report: ToolExecutionReport,
    /// `None` when nothing was pending, e.g. a re-delivered decision.
    pub run: Option<ExecutorResult>,
}

#[derive(Clone)]
pub struct KernelBuilder {
    root: PathBuf,
    config: ExecutorConfig,
    signing_key: Option<Vec<u8>>,
    launcher: Option<Arc<dyn RuntimeLauncher>>,
    resolver: Option<Arc<dyn ActionResolverPort>>,
    heartbeat: Arc<dyn HeartbeatPort>,
    event_buffer: usize,
}

impl KernelBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            config: ExecutorConfig::default(),
            signing_key: None,
            launcher: None,
            resolver: None,
            heartbeat: Arc::new(NoopHeartbeat),
            event_buffer: 1024,
        }
    }

    pub fn config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Signing secret for both token kinds. Without one, `build` reads
    /// `ENCLAVE_SIGNING_KEY`.
    pub fn signing_key(mut self, secret: impl Into<Vec<u8>>) -> Self {
        self.signing_key = Some(secret.into());
        self
    }

    pub fn launcher(mut self, launcher: Arc<dyn RuntimeLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn ActionResolverPort>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn heartbeat(mut self, heartbeat: Arc<dyn HeartbeatPort>) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn event_buffer(mut self, event_buffer: usize) -> Self {
        self.event_buffer = event_buffer;
        self
    }

    pub fn build(self) -> Result<EnclaveKernel> {
        let tokens = match &self.signing_key {
            Some(secret) => TokenAuthority::from_secret(secret),
            None => TokenAuthority::from_env(),
        }
        .context("failed loading token signing key")?;
        let tokens = Arc::new(tokens);

        let store: Arc<dyn SessionStorePort> =
            Arc::new(FileSessionStore::new(self.root.join("sessions")));
        let events = BroadcastEventChannel::new(self.event_buffer);
        let launcher = self
            .launcher
            .unwrap_or_else(|| Arc::new(LocalRuntimeLauncher::new(self.config.launcher.clone())));
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(ActionRegistry::with_core_actions()));

        let runner = ApprovedToolRunner::new(
            Arc::clone(&store),
            resolver,
            Arc::new(events.clone()),
            Arc::clone(&self.heartbeat),
            Arc::clone(&tokens),
            ToolRunnerConfig {
                token_ttl: self.config.tool_token_ttl(),
                heartbeat_interval: self.config.heartbeat_interval(),
            },
        );
        let executor = AgentExecutor::new(
            self.config,
            launcher,
            Arc::clone(&store),
            Arc::new(events.clone()),
            self.heartbeat,
        );

        Ok(EnclaveKernel {
            executor,
            runner,
            store,
            events,
            tokens,
        })
    }
}

#[derive(Clone)]
pub struct EnclaveKernel {
    executor: AgentExecutor,
    runner: ApprovedToolRunner,
    store: Arc<dyn SessionStorePort>,
    events: BroadcastEventChannel,
    tokens: Arc<TokenAuthority>,
}

impl EnclaveKernel {
    /// Run the agent for one turn, resuming the session's transcript if it
    /// has one.
    #[instrument(skip(self, scope, prompt, cancel), fields(session_id = %scope.session_id))]
    pub async fn run(
        &self,
        scope: &RunScope,
        prompt: Option<String>,
        cancel: CancellationToken,
    ) -> Result<ExecutorResult> {
        let init = self.init_payload(scope, prompt, false).await?;
        Ok(self.executor.run(init, cancel).await)
    }

    /// Execute or deny the session's paused tool calls without resuming.
    #[instrument(skip(self, scope, decisions), fields(session_id = %scope.session_id))]
    pub async fn approve(
        &self,
        scope: &RunScope,
        decisions: Vec<ApprovalDecision>,
    ) -> Result<ToolExecutionReport> {
        self.runner
            .execute(&scope.session_id, &scope.tool_claims(), decisions)
            .await
    }

    /// Apply approval decisions, then resume the run so the agent sees the
    /// tool results.
    #[instrument(skip(self, scope, decisions, cancel), fields(session_id = %scope.session_id))]
    pub async fn continue_after_approval(
        &self,
        scope: &RunScope,
        decisions: Vec<ApprovalDecision>,
        cancel: CancellationToken,
    ) -> Result<ApprovalContinuation> {
        let report = self.approve(scope, decisions).await?;
        if report.results.is_empty() {
            info!("nothing was awaiting approval, not resuming");
            return Ok(ApprovalContinuation { report, run: None });
        }
        let init = self.init_payload(scope, None, true).await?;
        let run = self.executor.run(init, cancel).await;
        Ok(ApprovalContinuation {
            report,
            run: Some(run),
        })
    }

    /// Build the init payload: fresh tokens plus any resumable transcript.
    pub async fn init_payload(
        &self,
        scope: &RunScope,
        prompt: Option<String>,
        is_approval_continuation: bool,
    ) -> Result<RuntimeInitPayload> {
        let config = self.executor.config();
        let mcp_auth_token = self
            .tokens
            .mint_tool_token(&scope.tool_claims(), config.tool_token_ttl())
            .context("failed minting tool-execution token")?;
        let llm_auth_token = self
            .tokens
            .mint_llm_token(&scope.llm_claims(), config.llm_token_ttl())
            .context("failed minting LLM-access token")?;
        let resume = load_resume_state(self.store.as_ref(), &scope.session_id).await?;

        Ok(RuntimeInitPayload {
            session_id: scope.session_id.clone(),
            mcp_auth_token,
            llm_auth_token,
            config: scope.agent.clone(),
            allowed_actions: scope.tools.clone(),
            user_prompt: prompt,
            sdk_session_id: resume.as_ref().map(|state| state.sdk_session_id.clone()),
            sdk_session_data: resume.map(|state| state.sdk_session_data),
            is_approval_continuation,
            is_fork: false,
            mcp_servers: scope.mcp_servers.clone(),
            llm_base_url: UNBOUND_LLM_BASE_URL.to_owned(),
        })
    }

    pub async fn session_entries(&self, session_id: &SessionId) -> Result<Vec<SessionEntry>> {
        self.store
            .list(session_id)
            .await
            .context("failed listing session entries")
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn tokens(&self) -> &TokenAuthority {
        &self.tokens
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use anyhow::Result;
    use async_trait::async_trait;
    use enclave_events::SessionEventKind;
    use enclave_protocol::{
        ControlChannel, RuntimeEventEnvelope, RuntimeResult, StreamEventType, ToolCallContent,
        ToolCallId, UnifiedStreamEvent,
    };
    use enclave_runtime::RunOutcome;
    use enclave_sandbox::{LaunchSpec, RuntimeExit, RuntimeHandle, SandboxResult};
    use parking_lot::Mutex;
    use serde_json::json;
    use tokio::net::UnixStream;
    use tokio::task::JoinHandle;

    use super::*;

    const SECRET: &[u8] = b"kernel-test-secret-kernel-test-secret";

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    type Script = Box<dyn FnOnce(&RuntimeInitPayload) -> Vec<RuntimeEventEnvelope> + Send>;

    /// Plays one script per launch and records every init it received.
    #[derive(Default)]
    struct ScriptedLauncher {
        scripts: Mutex<VecDeque<Script>>,
        inits: Arc<Mutex<Vec<RuntimeInitPayload>>>,
    }

    struct ScriptedHandle {
        task: JoinHandle<()>,
        exit: Option<RuntimeExit>,
    }

    #[async_trait]
    impl RuntimeLauncher for ScriptedLauncher {
        async fn launch(&self, spec: LaunchSpec) -> SandboxResult<Box<dyn RuntimeHandle>> {
            let script = self.scripts.lock().pop_front();
            let inits = Arc::clone(&self.inits);
            let task = tokio::spawn(async move {
                let Ok(stream) = UnixStream::connect(&spec.env.control_socket).await else {
                    return;
                };
                let mut channel = ControlChannel::new(stream);
                let Ok(init) = channel.recv_init().await else {
                    return;
                };
                let envelopes = script.map(|script| script(&init)).unwrap_or_default();
                inits.lock().push(init);
                for envelope in envelopes {
                    if channel.send_envelope(&envelope).await.is_err() {
                        return;
                    }
                }
            });
            Ok(Box::new(ScriptedHandle { task, exit: None }))
        }
    }

    #[async_trait]
    impl RuntimeHandle for ScriptedHandle {
        fn id(&self) -> Option<u32> {
            None
        }

        async fn wait(&mut self) -> SandboxResult<RuntimeExit> {
            if let Some(exit) = self.exit {
                return Ok(exit);
            }
            let _ = (&mut self.task).await;
            let exit = RuntimeExit {
                code: Some(0),
                signal: None,
            };
            self.exit = Some(exit);
            Ok(exit)
        }

        async fn terminate(&mut self, _grace: Duration) -> SandboxResult<()> {
            self.kill_now();
            Ok(())
        }

        fn kill_now(&mut self) {
            self.task.abort();
        }

        fn stderr_tail(&self) -> String {
            String::new()
        }
    }

    fn kernel(root: &std::path::Path, launcher: Arc<ScriptedLauncher>) -> Result<EnclaveKernel> {
        KernelBuilder::new(root)
            .config(ExecutorConfig {
                jobs_root: root.join("jobs"),
                terminate_grace_secs: 0.2,
                ..ExecutorConfig::default()
            })
            .signing_key(SECRET)
            .launcher(launcher)
            .build()
    }

    fn scope() -> RunScope {
        let mut agent = SandboxAgentConfig::new("claude-test", "anthropic");
        agent.tool_approvals.insert("core__echo".to_owned(), true);
        let registry = ActionRegistry::with_core_actions();
        RunScope::new("s-kernel", "ws-1", "org-1", agent)
            .with_tools(registry.tool_definitions(["core.echo", "current_time"]))
    }

    fn line(uuid: &str, kind: &str) -> RuntimeEventEnvelope {
        RuntimeEventEnvelope::SessionLine {
            sdk_session_id: "sdk-1".to_owned(),
            line: json!({"type": kind, "uuid": uuid}).to_string(),
            internal: false,
        }
    }

    #[test]
    fn scope_splits_actions_from_internal_tools() {
        let claims = scope().tool_claims();
        assert!(claims.allows_action("core.echo"));
        assert!(claims.allows_internal_tool("current_time"));
        assert!(!claims.allows_action("current_time"));

        let llm = scope().llm_claims();
        assert_eq!(llm.model, "claude-test");
        assert_eq!(llm.credential_scope, "workspace");
    }

    #[test]
    fn build_rejects_a_short_signing_key() {
        let result = KernelBuilder::new(unique_test_root("kernel-weak"))
            .signing_key(b"short".to_vec())
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn approval_round_trip_resumes_with_tool_results() -> Result<()> {
        let root = unique_test_root("kernel-approval");
        let launcher = Arc::new(ScriptedLauncher::default());
        let call = ToolCallContent {
            id: ToolCallId::from("toolu_1"),
            name: "core__echo".to_owned(),
            input: json!({"message": "hello"}),
        };
        let paused = call.clone();
        launcher.scripts.lock().push_back(Box::new(move |_init| {
            vec![
                line("u-1", "user"),
                line("u-2", "assistant"),
                RuntimeEventEnvelope::StreamEvent {
                    event: UnifiedStreamEvent::approval_request(vec![paused]),
                },
                RuntimeEventEnvelope::Done,
            ]
        }));
        launcher.scripts.lock().push_back(Box::new(|_init| {
            vec![
                line("u-4", "assistant"),
                RuntimeEventEnvelope::Result(RuntimeResult {
                    num_turns: Some(2),
                    ..RuntimeResult::default()
                }),
                RuntimeEventEnvelope::Done,
            ]
        }));

        let kernel = kernel(&root, Arc::clone(&launcher))?;
        let mut events = kernel.subscribe_events();
        let scope = scope();

        let first = kernel
            .run(&scope, Some("say hello".to_owned()), CancellationToken::new())
            .await?;
        assert!(first.approval_requested, "{first:?}");
        assert_eq!(first.outcome, RunOutcome::ApprovalRequested);
        assert_eq!(first.approval_items, vec![call.clone()]);
        let entries = kernel.session_entries(&scope.session_id).await?;
        assert_eq!(
            entries
                .iter()
                .filter(|entry| entry.pending_tool_call().is_some())
                .count(),
            1
        );

        let continued = kernel
            .continue_after_approval(
                &scope,
                vec![ApprovalDecision::approve(ToolCallId::from("toolu_1"))],
                CancellationToken::new(),
            )
            .await?;
        assert_eq!(continued.report.executed, 1);
        assert_eq!(continued.report.results[0].output, json!({"message": "hello"}));
        let run = continued.run.expect("resumed run");
        assert!(run.success);
        assert_eq!(run.outcome, RunOutcome::Completed);

        let inits = launcher.inits.lock().clone();
        assert_eq!(inits.len(), 2);
        assert_eq!(inits[0].user_prompt.as_deref(), Some("say hello"));
        assert!(inits[0].sdk_session_data.is_none());
        assert!(inits[0].llm_base_url.ends_with("sockets/llm.sock"));
        let verified = kernel.tokens().verify_tool_token(&inits[0].mcp_auth_token)?;
        assert!(verified.claims.allows_action("core.echo"));
        kernel.tokens().verify_llm_token(&inits[0].llm_auth_token)?;

        assert!(inits[1].is_approval_continuation);
        assert_eq!(inits[1].sdk_session_id.as_deref(), Some("sdk-1"));
        let resumed = inits[1].sdk_session_data.clone().unwrap_or_default();
        assert_eq!(resumed.lines().count(), 3);
        assert!(resumed.contains("toolu_1"));

        let again = kernel
            .continue_after_approval(
                &scope,
                vec![ApprovalDecision::approve(ToolCallId::from("toolu_1"))],
                CancellationToken::new(),
            )
            .await?;
        assert!(again.run.is_none());
        assert_eq!(again.report.skipped, vec![ToolCallId::from("toolu_1")]);

        let mut saw_approval = false;
        let mut saw_tool_result = false;
        let mut done = 0;
        while let Ok(event) = events.try_recv() {
            match event.kind {
                SessionEventKind::Stream { event } => match event.event_type {
                    StreamEventType::ApprovalRequest => saw_approval = true,
                    StreamEventType::ToolResult => saw_tool_result = true,
                    _ => {}
                },
                SessionEventKind::Done => done += 1,
                SessionEventKind::Error { .. } => {}
            }
        }
        assert!(saw_approval && saw_tool_result);
        assert_eq!(done, 2);

        let _ = tokio::fs::remove_dir_all(root).await;
        Ok(())
    }
}
