//! Lifecycle of one sandboxed agent run.
//!
//! 1. create a private job directory
//! 2. start the LLM proxy on `sockets/llm.sock`
//! 3. bind `sockets/control.sock` owner-only
//! 4. launch the runtime process
//! 5. race the loopback against proxy failure, early exit, timeout,
//!    cancellation and protocol violations, heartbeating throughout
//! 6. terminate the process, stop the proxy, remove the job directory
//!
//! Step 6 always runs. If the run future itself is dropped, [`RunGuard`]
//! kills the process and removes the directory synchronously.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use enclave_protocol::{
    EventChannelPort, HeartbeatDetails, HeartbeatPort, JobId, RuntimeInitPayload, RuntimeResult,
    SessionId, SessionStorePort, ToolCallContent,
};
use enclave_proxy::{FatalCallback, FatalProxyError, LlmProxy, ProxyConfig};
use enclave_sandbox::{
    JobDirectory, LaunchSpec, LauncherConfig, RuntimeEnv, RuntimeExit, RuntimeHandle,
    RuntimeLauncher, SandboxResult, bind_private_listener,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::UnixListener;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::loopback::{LoopbackError, LoopbackHandler, LoopbackOutcome};
use crate::publisher::SessionPublisher;

const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Parent of the per-run job directories. Keep it short: socket paths
    /// beneath it must fit in 107 bytes.
    pub jobs_root: PathBuf,
    pub timeout_secs: f64,
    pub heartbeat_interval_secs: f64,
    /// Time between SIGTERM and SIGKILL during cleanup.
    pub terminate_grace_secs: f64,
    pub tool_token_ttl_secs: u64,
    pub llm_token_ttl_secs: u64,
    pub launcher: LauncherConfig,
    pub proxy: ProxyConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            jobs_root: std::env::temp_dir().join("enclave-jobs"),
            timeout_secs: 600.0,
            heartbeat_interval_secs: 30.0,
            terminate_grace_secs: 5.0,
            tool_token_ttl_secs: 15 * 60,
            llm_token_ttl_secs: 30 * 60,
            launcher: LauncherConfig::default(),
            proxy: ProxyConfig::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn timeout(&self) -> Duration {
        secs(self.timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        secs(self.heartbeat_interval_secs).max(MIN_HEARTBEAT_INTERVAL)
    }

    pub fn terminate_grace(&self) -> Duration {
        secs(self.terminate_grace_secs)
    }

    pub fn tool_token_ttl(&self) -> Duration {
        Duration::from_secs(self.tool_token_ttl_secs)
    }

    pub fn llm_token_ttl(&self) -> Duration {
        Duration::from_secs(self.llm_token_ttl_secs)
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    ApprovalRequested,
    RuntimeError,
    Disconnected,
    ProtocolViolation,
    PersistenceFailed,
    Crashed,
    ProxyFatal,
    TimedOut,
    Cancelled,
    SetupFailed,
}

/// The single result every terminal path converges on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub approval_requested: bool,
    #[serde(default)]
    pub approval_items: Vec<ToolCallContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<RuntimeResult>,
    pub outcome: RunOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Value>,
    pub duration_ms: u64,
}

impl ExecutorResult {
    fn completed(loopback: LoopbackOutcome) -> Self {
        let outcome = if loopback.approval_requested {
            RunOutcome::ApprovalRequested
        } else {
            RunOutcome::Completed
        };
        Self {
            success: true,
            error: None,
            approval_requested: loopback.approval_requested,
            approval_items: loopback.approval_items,
            result: loopback.result,
            outcome,
            sdk_session_id: loopback.sdk_session_id,
            messages: loopback.messages,
            duration_ms: 0,
        }
    }

    fn failed(outcome: RunOutcome, error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            approval_requested: false,
            approval_items: Vec::new(),
            result: None,
            outcome,
            sdk_session_id: None,
            messages: Vec::new(),
            duration_ms: 0,
        }
    }
}

/// Latched by the proxy's fatal callback.
#[derive(Default)]
struct FatalSignal {
    notify: Notify,
    detail: Mutex<Option<FatalProxyError>>,
}

impl FatalSignal {
    fn callback(self: &Arc<Self>) -> FatalCallback {
        let signal = Arc::clone(self);
        Arc::new(move |fatal| {
            *signal.detail.lock() = Some(fatal);
            signal.notify.notify_one();
        })
    }

    fn take(&self) -> Option<FatalProxyError> {
        self.detail.lock().take()
    }
}

/// Synchronous last-resort cleanup for a run future dropped mid-flight.
struct RunGuard {
    job: Option<JobDirectory>,
    handle: Option<Box<dyn RuntimeHandle>>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.as_mut() {
            warn!(pid = handle.id(), "run dropped before cleanup, killing runtime");
            handle.kill_now();
        }
        if let Some(job) = self.job.take() {
            job.remove_blocking();
        }
    }
}

enum RaceOutcome {
    Loopback(Result<LoopbackOutcome, LoopbackError>),
    ProxyFatal,
    ExitedBeforeConnect(SandboxResult<RuntimeExit>),
    TimedOut,
    Cancelled,
    SecondConnection,
    AcceptFailed(std::io::Error),
}

type LoopbackRun<'a> =
    Pin<Box<dyn Future<Output = Result<LoopbackOutcome, LoopbackError>> + Send + 'a>>;

#[derive(Clone)]
pub struct AgentExecutor {
    config: ExecutorConfig,
    launcher: Arc<dyn RuntimeLauncher>,
    store: Arc<dyn SessionStorePort>,
    events: Arc<dyn EventChannelPort>,
    heartbeat: Arc<dyn HeartbeatPort>,
}

impl AgentExecutor {
    pub fn new(
        config: ExecutorConfig,
        launcher: Arc<dyn RuntimeLauncher>,
        store: Arc<dyn SessionStorePort>,
        events: Arc<dyn EventChannelPort>,
        heartbeat: Arc<dyn HeartbeatPort>,
    ) -> Self {
        Self {
            config,
            launcher,
            store,
            events,
            heartbeat,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    #[instrument(skip_all, fields(session_id = %init.session_id))]
    pub async fn run(&self, mut init: RuntimeInitPayload, cancel: CancellationToken) -> ExecutorResult {
        let started = Instant::now();
        let publisher = match self.events.open(&init.session_id).await {
            Ok(sink) => SessionPublisher::new(sink),
            Err(error) => {
                warn!(error = %error, "failed opening event channel");
                return ExecutorResult::failed(
                    RunOutcome::SetupFailed,
                    format!("failed opening event channel: {error}"),
                );
            }
        };

        let job = match JobDirectory::create(&self.config.jobs_root, JobId::short()) {
            Ok(job) => job,
            Err(error) => {
                let message = format!("failed creating job directory: {error}");
                publisher.error(&message).await;
                publisher.done().await;
                return ExecutorResult::failed(RunOutcome::SetupFailed, message);
            }
        };
        let mut guard = RunGuard {
            job: Some(job.clone()),
            handle: None,
        };
        init.llm_base_url = job.llm_socket().display().to_string();

        let fatal = Arc::new(FatalSignal::default());
        let proxy = LlmProxy::new(job.llm_socket(), self.config.proxy.clone(), fatal.callback());

        let mut result = match self
            .supervise(&init, &job, &proxy, &mut guard, &fatal, &publisher, &cancel, started)
            .await
        {
            Ok(result) => result,
            Err(error) => {
                let message = format!("{error:#}");
                warn!(error = %message, "run setup failed");
                publisher.error(&message).await;
                ExecutorResult::failed(RunOutcome::SetupFailed, message)
            }
        };
        publisher.done().await;

        self.cleanup(&mut guard, &proxy).await;
        result.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            job_id = %job.job_id(),
            outcome = ?result.outcome,
            success = result.success,
            duration_ms = result.duration_ms,
            "run finished"
        );
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn supervise(
        &self,
        init: &RuntimeInitPayload,
        job: &JobDirectory,
        proxy: &LlmProxy,
        guard: &mut RunGuard,
        fatal: &FatalSignal,
        publisher: &SessionPublisher,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<ExecutorResult> {
        proxy.start().context("failed starting LLM proxy")?;
        let listener = bind_private_listener(&job.control_socket())
            .context("failed binding control socket")?;

        let spec = LaunchSpec {
            env: RuntimeEnv {
                socket_dir: job.socket_dir().to_path_buf(),
                control_socket: job.control_socket(),
                llm_socket: job.llm_socket(),
                allow_network: init.config.enable_internet_access,
            },
            extra_env: BTreeMap::new(),
        };
        let handle = self
            .launcher
            .launch(spec)
            .await
            .context("failed launching runtime")?;
        info!(pid = handle.id(), job_id = %job.job_id(), "runtime launched");
        guard.handle = Some(handle);

        let race = self
            .race(init, &listener, &mut guard.handle, fatal, publisher, cancel, started)
            .await;
        Ok(self.conclude(race, guard, fatal, publisher).await)
    }

    #[allow(clippy::too_many_arguments)]
    async fn race(
        &self,
        init: &RuntimeInitPayload,
        listener: &UnixListener,
        handle: &mut Option<Box<dyn RuntimeHandle>>,
        fatal: &FatalSignal,
        publisher: &SessionPublisher,
        cancel: &CancellationToken,
        started: Instant,
    ) -> RaceOutcome {
        let deadline = tokio::time::sleep(self.config.timeout());
        tokio::pin!(deadline);
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut loopback: Option<LoopbackRun<'_>> = None;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return RaceOutcome::Cancelled,
                () = fatal.notify.notified() => return RaceOutcome::ProxyFatal,
                () = &mut deadline => return RaceOutcome::TimedOut,
                _ = heartbeat.tick() => {
                    let phase = if loopback.is_some() { "streaming" } else { "awaiting_connection" };
                    self.beat(&init.session_id, phase, started);
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) if loopback.is_none() => {
                        debug!("runtime connected to control socket");
                        let handler = LoopbackHandler::new(
                            init.session_id.clone(),
                            stream,
                            publisher.clone(),
                            Arc::clone(&self.store),
                        );
                        loopback = Some(Box::pin(handler.run(init)));
                    }
                    Ok(_) => return RaceOutcome::SecondConnection,
                    Err(error) => return RaceOutcome::AcceptFailed(error),
                },
                exit = wait_for_exit(handle), if loopback.is_none() => {
                    return RaceOutcome::ExitedBeforeConnect(exit);
                }
                result = drive_loopback(&mut loopback), if loopback.is_some() => {
                    return RaceOutcome::Loopback(result);
                }
            }
        }
    }

    async fn conclude(
        &self,
        race: RaceOutcome,
        guard: &mut RunGuard,
        fatal: &FatalSignal,
        publisher: &SessionPublisher,
    ) -> ExecutorResult {
        let grace = self.config.terminate_grace();
        match race {
            RaceOutcome::Loopback(Ok(outcome)) => {
                if let Some(handle) = guard.handle.as_mut() {
                    match tokio::time::timeout(grace, handle.wait()).await {
                        Ok(Ok(exit)) if !exit.success() => {
                            warn!(%exit, "runtime exited abnormally after done");
                        }
                        Ok(_) => {}
                        Err(_) => debug!("runtime still running after done"),
                    }
                }
                ExecutorResult::completed(outcome)
            }
            RaceOutcome::Loopback(Err(error)) => {
                // The loopback already published the error.
                let outcome = match &error {
                    LoopbackError::Runtime(_) => RunOutcome::RuntimeError,
                    LoopbackError::InitNotDelivered(_) | LoopbackError::Disconnected(_) => {
                        RunOutcome::Disconnected
                    }
                    LoopbackError::Protocol(_) => RunOutcome::ProtocolViolation,
                    LoopbackError::Persistence(_) => RunOutcome::PersistenceFailed,
                };
                let mut message = error.to_string();
                if outcome == RunOutcome::Disconnected
                    && let Some(handle) = guard.handle.as_mut()
                {
                    let _ = tokio::time::timeout(grace, handle.wait()).await;
                    let tail = handle.stderr_tail();
                    if !tail.is_empty() {
                        message = format!("{message}; runtime stderr: {tail}");
                    }
                }
                warn!(error = %message, outcome = ?outcome, "run failed");
                ExecutorResult::failed(outcome, message)
            }
            RaceOutcome::ProxyFatal => {
                if let Some(handle) = guard.handle.as_mut() {
                    handle.kill_now();
                }
                let detail = fatal
                    .take()
                    .map(|fatal| fatal.to_string())
                    .unwrap_or_else(|| "LLM gateway failure".to_owned());
                self.fail(publisher, RunOutcome::ProxyFatal, detail).await
            }
            RaceOutcome::ExitedBeforeConnect(exit) => {
                let status = match exit {
                    Ok(exit) => exit.to_string(),
                    Err(error) => format!("wait failed: {error}"),
                };
                let tail = guard
                    .handle
                    .as_ref()
                    .map(|handle| handle.stderr_tail())
                    .unwrap_or_default();
                let message = if tail.is_empty() {
                    format!("runtime exited before connecting ({status})")
                } else {
                    format!("runtime exited before connecting ({status}): {tail}")
                };
                self.fail(publisher, RunOutcome::Crashed, message).await
            }
            RaceOutcome::TimedOut => {
                let message = format!(
                    "run timed out after {:.1}s",
                    self.config.timeout().as_secs_f64()
                );
                self.fail(publisher, RunOutcome::TimedOut, message).await
            }
            RaceOutcome::Cancelled => {
                self.fail(publisher, RunOutcome::Cancelled, "run cancelled")
                    .await
            }
            RaceOutcome::SecondConnection => {
                self.fail(
                    publisher,
                    RunOutcome::ProtocolViolation,
                    "protocol violation: runtime opened a second control connection",
                )
                .await
            }
            RaceOutcome::AcceptFailed(error) => {
                let message = format!("control socket accept failed: {error}");
                self.fail(publisher, RunOutcome::SetupFailed, message).await
            }
        }
    }

    async fn fail(
        &self,
        publisher: &SessionPublisher,
        outcome: RunOutcome,
        message: impl Into<String>,
    ) -> ExecutorResult {
        let message = message.into();
        warn!(error = %message, outcome = ?outcome, "run failed");
        publisher.error(&message).await;
        ExecutorResult::failed(outcome, message)
    }

    async fn cleanup(&self, guard: &mut RunGuard, proxy: &LlmProxy) {
        if let Some(mut handle) = guard.handle.take()
            && let Err(error) = handle.terminate(self.config.terminate_grace()).await
        {
            warn!(error = %error, "failed terminating runtime, killing");
            handle.kill_now();
        }
        proxy.stop().await;
        if let Some(job) = guard.job.take()
            && let Err(error) = job.remove().await
        {
            warn!(job_id = %job.job_id(), error = %error, "failed removing job directory");
        }
    }

    fn beat(&self, session_id: &SessionId, phase: &str, started: Instant) {
        debug!(phase, "heartbeat");
        self.heartbeat.heartbeat(HeartbeatDetails {
            session_id: session_id.clone(),
            phase: phase.to_owned(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        });
    }
}

async fn wait_for_exit(handle: &mut Option<Box<dyn RuntimeHandle>>) -> SandboxResult<RuntimeExit> {
    match handle {
        Some(handle) => handle.wait().await,
        None => std::future::pending().await,
    }
}

async fn drive_loopback(
    loopback: &mut Option<LoopbackRun<'_>>,
) -> Result<LoopbackOutcome, LoopbackError> {
    match loopback {
        Some(run) => run.await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    use async_trait::async_trait;
    use enclave_events::FileSessionStore;
    use enclave_protocol::{
        ControlChannel, EventSink, PortResult, RuntimeEventEnvelope, SandboxAgentConfig,
        ToolCallId, UnifiedStreamEvent,
    };
    use enclave_sandbox::LocalRuntimeLauncher;
    use serde_json::json;
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixStream;
    use tokio::task::JoinHandle;

    use super::*;
    use crate::publisher::testing::RecordingSink;

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    #[derive(Clone)]
    enum Script {
        Envelopes(Vec<RuntimeEventEnvelope>),
        Hang,
        ConnectTwice,
        CallLlm,
    }

    struct FakeLauncher {
        script: Script,
        env: Mutex<Option<RuntimeEnv>>,
        killed: Arc<AtomicBool>,
    }

    impl FakeLauncher {
        fn new(script: Script) -> Self {
            Self {
                script,
                env: Mutex::new(None),
                killed: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    struct FakeHandle {
        task: JoinHandle<()>,
        exit: Option<RuntimeExit>,
        killed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl RuntimeLauncher for FakeLauncher {
        async fn launch(&self, spec: LaunchSpec) -> SandboxResult<Box<dyn RuntimeHandle>> {
            *self.env.lock() = Some(spec.env.clone());
            let task = tokio::spawn(fake_runtime(self.script.clone(), spec.env));
            Ok(Box::new(FakeHandle {
                task,
                exit: None,
                killed: Arc::clone(&self.killed),
            }))
        }
    }

    #[async_trait]
    impl RuntimeHandle for FakeHandle {
        fn id(&self) -> Option<u32> {
            None
        }

        async fn wait(&mut self) -> SandboxResult<RuntimeExit> {
            if let Some(exit) = self.exit {
                return Ok(exit);
            }
            let code = if (&mut self.task).await.is_ok() { 0 } else { 1 };
            let exit = RuntimeExit {
                code: Some(code),
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
            if self.exit.is_none() {
                self.killed.store(true, Ordering::SeqCst);
                self.task.abort();
                self.exit = Some(RuntimeExit {
                    code: None,
                    signal: Some(9),
                });
            }
        }

        fn stderr_tail(&self) -> String {
            String::new()
        }
    }

    async fn fake_runtime(script: Script, env: RuntimeEnv) {
        let Ok(stream) = UnixStream::connect(&env.control_socket).await else {
            return;
        };
        let mut channel = ControlChannel::new(stream);
        if channel.recv_init().await.is_err() {
            return;
        }
        match script {
            Script::Envelopes(envelopes) => {
                for envelope in envelopes {
                    if channel.send_envelope(&envelope).await.is_err() {
                        return;
                    }
                }
            }
            Script::Hang => std::future::pending::<()>().await,
            Script::ConnectTwice => {
                let _second = UnixStream::connect(&env.control_socket).await;
                std::future::pending::<()>().await;
            }
            Script::CallLlm => {
                if let Ok(mut llm) = UnixStream::connect(&env.llm_socket).await {
                    let request = "POST /v1/messages HTTP/1.1\r\nhost: gateway\r\ncontent-length: 2\r\n\r\n{}";
                    let _ = llm.write_all(request.as_bytes()).await;
                    std::future::pending::<()>().await;
                }
            }
        }
    }

    struct FixedChannel(Arc<RecordingSink>);

    #[async_trait]
    impl EventChannelPort for FixedChannel {
        async fn open(&self, _session_id: &SessionId) -> PortResult<Arc<dyn EventSink>> {
            let sink: Arc<dyn EventSink> = self.0.clone();
            Ok(sink)
        }
    }

    #[derive(Default)]
    struct RecordingHeartbeat(Mutex<Vec<(Instant, HeartbeatDetails)>>);

    impl HeartbeatPort for RecordingHeartbeat {
        fn heartbeat(&self, details: HeartbeatDetails) {
            self.0.lock().push((Instant::now(), details));
        }
    }

    struct Fixture {
        root: PathBuf,
        config: ExecutorConfig,
        sink: Arc<RecordingSink>,
        heartbeat: Arc<RecordingHeartbeat>,
        store: Arc<FileSessionStore>,
    }

    impl Fixture {
        fn new(name: &str) -> Self {
            let root = unique_test_root(name);
            let config = ExecutorConfig {
                jobs_root: root.join("jobs"),
                timeout_secs: 10.0,
                heartbeat_interval_secs: 1.0,
                terminate_grace_secs: 0.5,
                proxy: ProxyConfig {
                    upstream_base_url: "http://127.0.0.1:9".to_owned(),
                    connect_timeout_secs: 2,
                    ..ProxyConfig::default()
                },
                ..ExecutorConfig::default()
            };
            Self {
                store: Arc::new(FileSessionStore::new(root.join("store"))),
                root,
                config,
                sink: Arc::new(RecordingSink::default()),
                heartbeat: Arc::new(RecordingHeartbeat::default()),
            }
        }

        fn executor(&self, launcher: Arc<dyn RuntimeLauncher>) -> AgentExecutor {
            AgentExecutor::new(
                self.config.clone(),
                launcher,
                self.store.clone(),
                Arc::new(FixedChannel(self.sink.clone())),
                self.heartbeat.clone(),
            )
        }

        fn job_dirs_left(&self) -> usize {
            std::fs::read_dir(&self.config.jobs_root)
                .map(|entries| entries.count())
                .unwrap_or(0)
        }

        async fn finish(self) {
            let _ = tokio::fs::remove_dir_all(&self.root).await;
        }
    }

    fn init() -> RuntimeInitPayload {
        RuntimeInitPayload {
            session_id: SessionId::from("s-exec"),
            mcp_auth_token: "mcp".to_owned(),
            llm_auth_token: "llm".to_owned(),
            config: SandboxAgentConfig::new("model", "provider"),
            allowed_actions: Default::default(),
            user_prompt: Some("hi".to_owned()),
            sdk_session_id: None,
            sdk_session_data: None,
            is_approval_continuation: false,
            is_fork: false,
            mcp_servers: Vec::new(),
            llm_base_url: "http://enclave-llm".to_owned(),
        }
    }

    #[tokio::test]
    async fn completed_run_persists_and_cleans_up() {
        let fx = Fixture::new("exec-ok");
        let launcher = Arc::new(FakeLauncher::new(Script::Envelopes(vec![
            RuntimeEventEnvelope::SessionLine {
                sdk_session_id: "sdk-1".to_owned(),
                line: json!({"type": "assistant", "uuid": "u-1"}).to_string(),
                internal: false,
            },
            RuntimeEventEnvelope::Result(RuntimeResult {
                num_turns: Some(1),
                ..RuntimeResult::default()
            }),
            RuntimeEventEnvelope::Done,
        ])));

        let result = fx
            .executor(launcher.clone())
            .run(init(), CancellationToken::new())
            .await;

        assert!(result.success, "{result:?}");
        assert_eq!(result.outcome, RunOutcome::Completed);
        assert_eq!(result.sdk_session_id.as_deref(), Some("sdk-1"));
        assert_eq!(fx.store.list(&SessionId::from("s-exec")).await.unwrap().len(), 1);
        assert_eq!(fx.sink.done_count(), 1);
        assert_eq!(fx.job_dirs_left(), 0);

        let env = launcher.env.lock().clone().unwrap();
        assert!(!env.allow_network);
        assert!(env.control_socket.ends_with("sockets/control.sock"));
        fx.finish().await;
    }

    #[tokio::test]
    async fn approval_runs_succeed_with_items() {
        let fx = Fixture::new("exec-approval");
        let item = ToolCallContent {
            id: ToolCallId::from("toolu_1"),
            name: "core__http_request".to_owned(),
            input: json!({"a": 1}),
        };
        let launcher = Arc::new(FakeLauncher::new(Script::Envelopes(vec![
            RuntimeEventEnvelope::StreamEvent {
                event: UnifiedStreamEvent::approval_request(vec![item.clone()]),
            },
            RuntimeEventEnvelope::Done,
        ])));

        let result = fx.executor(launcher).run(init(), CancellationToken::new()).await;
        assert!(result.success);
        assert_eq!(result.outcome, RunOutcome::ApprovalRequested);
        assert!(result.approval_requested);
        assert_eq!(result.approval_items, vec![item]);
        assert_eq!(fx.sink.done_count(), 1);
        fx.finish().await;
    }

    #[tokio::test]
    async fn crash_before_connect_reports_stderr_and_removes_job_dir() {
        let fx = Fixture::new("exec-crash");
        let launcher = Arc::new(LocalRuntimeLauncher::new(LauncherConfig {
            command: "/bin/sh".to_owned(),
            args: vec![
                "-c".to_owned(),
                "echo 'fatal: missing model config' >&2; exit 1".to_owned(),
            ],
            ..LauncherConfig::default()
        }));

        let result = fx.executor(launcher).run(init(), CancellationToken::new()).await;

        assert!(!result.success);
        assert_eq!(result.outcome, RunOutcome::Crashed);
        let error = result.error.unwrap_or_default();
        assert!(error.contains("exit code 1"), "{error}");
        assert!(error.contains("fatal: missing model config"), "{error}");
        assert_eq!(fx.job_dirs_left(), 0);
        assert_eq!(fx.sink.errors.lock().len(), 1);
        assert_eq!(fx.sink.done_count(), 1);
        fx.finish().await;
    }

    #[tokio::test]
    async fn heartbeats_keep_cadence_until_timeout() {
        let mut fx = Fixture::new("exec-timeout");
        fx.config.timeout_secs = 0.5;
        fx.config.heartbeat_interval_secs = 0.1;
        let launcher = Arc::new(FakeLauncher::new(Script::Hang));

        let started = Instant::now();
        let result = fx
            .executor(launcher.clone())
            .run(init(), CancellationToken::new())
            .await;

        assert_eq!(result.outcome, RunOutcome::TimedOut);
        assert!(launcher.killed.load(Ordering::SeqCst));
        assert_eq!(fx.job_dirs_left(), 0);

        let beats = fx.heartbeat.0.lock();
        assert!(beats.len() >= 4, "only {} heartbeats", beats.len());
        for pair in beats.windows(2) {
            let gap = pair[1].0.duration_since(pair[0].0);
            assert!(gap < Duration::from_millis(250), "heartbeat gap {gap:?}");
        }
        assert_eq!(beats.last().map(|(_, d)| d.phase.as_str()), Some("streaming"));
        let last_beat = beats.last().map(|(at, _)| at.duration_since(started));
        assert!(last_beat < Some(Duration::from_millis(600)));
        assert!(started.elapsed() < Duration::from_secs(3));
        drop(beats);
        fx.finish().await;
    }

    #[tokio::test]
    async fn cancellation_runs_full_cleanup() {
        let fx = Fixture::new("exec-cancel");
        let launcher = Arc::new(FakeLauncher::new(Script::Hang));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            trigger.cancel();
        });

        let result = fx.executor(launcher.clone()).run(init(), cancel).await;
        assert_eq!(result.outcome, RunOutcome::Cancelled);
        assert!(launcher.killed.load(Ordering::SeqCst));
        assert_eq!(fx.job_dirs_left(), 0);
        assert_eq!(fx.sink.done_count(), 1);
        fx.finish().await;
    }

    #[tokio::test]
    async fn second_control_connection_is_a_protocol_violation() {
        let fx = Fixture::new("exec-second");
        let launcher = Arc::new(FakeLauncher::new(Script::ConnectTwice));
        let result = fx.executor(launcher).run(init(), CancellationToken::new()).await;
        assert_eq!(result.outcome, RunOutcome::ProtocolViolation);
        assert_eq!(fx.sink.done_count(), 1);
        assert_eq!(fx.job_dirs_left(), 0);
        fx.finish().await;
    }

    #[tokio::test]
    async fn unreachable_llm_gateway_is_fatal() {
        let fx = Fixture::new("exec-fatal");
        let launcher = Arc::new(FakeLauncher::new(Script::CallLlm));
        let result = fx
            .executor(launcher.clone())
            .run(init(), CancellationToken::new())
            .await;
        assert_eq!(result.outcome, RunOutcome::ProxyFatal);
        assert!(result.error.unwrap_or_default().contains("/v1/messages"));
        assert!(launcher.killed.load(Ordering::SeqCst));
        assert_eq!(fx.sink.done_count(), 1);
        fx.finish().await;
    }

    #[tokio::test]
    async fn dropping_the_run_future_still_removes_the_job_dir() {
        let fx = Fixture::new("exec-drop");
        let launcher = Arc::new(FakeLauncher::new(Script::Hang));
        let executor = fx.executor(launcher.clone());

        let dropped = tokio::time::timeout(
            Duration::from_millis(200),
            executor.run(init(), CancellationToken::new()),
        )
        .await;
        assert!(dropped.is_err());
        assert!(launcher.killed.load(Ordering::SeqCst));
        assert_eq!(fx.job_dirs_left(), 0);
        fx.finish().await;
    }

    #[test]
    fn config_defaults_and_toml_overrides() {
        let config = ExecutorConfig::default();
        assert_eq!(config.timeout(), Duration::from_secs(600));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.terminate_grace(), Duration::from_secs(5));
        assert_eq!(config.tool_token_ttl(), Duration::from_secs(900));
        assert_eq!(config.llm_token_ttl(), Duration::from_secs(1800));
        assert_eq!(config.launcher.stderr_tail_bytes, 8 * 1024);

        let parsed: ExecutorConfig = serde_json::from_value(json!({
            "timeout_secs": 30,
            "heartbeat_interval_secs": 0,
            "proxy": {"upstream_base_url": "http://gateway:4000"}
        }))
        .unwrap();
        assert_eq!(parsed.timeout(), Duration::from_secs(30));
        assert_eq!(parsed.heartbeat_interval(), MIN_HEARTBEAT_INTERVAL);
        assert_eq!(parsed.proxy.upstream_base_url, "http://gateway:4000");
        assert_eq!(parsed.proxy.max_body_bytes, 10 * 1024 * 1024);
    }
}
