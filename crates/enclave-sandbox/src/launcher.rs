//! Launching the runtime process.
//!
//! [`RuntimeLauncher`] is the seam between the executor and whatever actually
//! isolates the process. [`LocalRuntimeLauncher`] spawns a local child with a
//! scrubbed environment, optionally behind a network-isolation wrapper
//! command.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::env::RuntimeEnv;
use crate::error::{SandboxError, SandboxResult};

/// How the local launcher starts the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    pub command: String,
    pub args: Vec<String>,
    /// Variables copied from the orchestrator's environment. Everything else
    /// is cleared.
    pub pass_env: Vec<String>,
    /// Prefix used when the run has no internet access, e.g.
    /// `["unshare", "--net", "--map-root-user", "--"]`.
    pub isolation_wrapper: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub stderr_tail_bytes: usize,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            command: "enclave-echo-runtime".to_owned(),
            args: Vec::new(),
            pass_env: vec!["PATH".to_owned(), "RUST_LOG".to_owned()],
            isolation_wrapper: Vec::new(),
            working_dir: None,
            stderr_tail_bytes: 8 * 1024,
        }
    }
}

/// Per-run launch parameters.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub env: RuntimeEnv,
    pub extra_env: BTreeMap<String, String>,
}

/// How the runtime process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl RuntimeExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    fn from_status(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl fmt::Display for RuntimeExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown exit"),
        }
    }
}

#[async_trait]
pub trait RuntimeLauncher: Send + Sync {
    async fn launch(&self, spec: LaunchSpec) -> SandboxResult<Box<dyn RuntimeHandle>>;
}

/// A running runtime process.
#[async_trait]
pub trait RuntimeHandle: Send {
    fn id(&self) -> Option<u32>;

    /// Wait for the process to exit. Cancel-safe.
    async fn wait(&mut self) -> SandboxResult<RuntimeExit>;

    /// SIGTERM, then SIGKILL once `grace` elapses. No-op if already exited.
    async fn terminate(&mut self, grace: Duration) -> SandboxResult<()>;

    /// Fire-and-forget kill for synchronous drop paths.
    fn kill_now(&mut self);

    /// Last bytes the process wrote to stderr.
    fn stderr_tail(&self) -> String;
}

#[derive(Debug, Clone, Default)]
pub struct LocalRuntimeLauncher {
    config: LauncherConfig,
}

impl LocalRuntimeLauncher {
    pub fn new(config: LauncherConfig) -> Self {
        Self { config }
    }

    fn command_line(&self, allow_network: bool) -> (String, Vec<String>) {
        let wrap = !allow_network && !self.config.isolation_wrapper.is_empty();
        if !wrap {
            return (self.config.command.clone(), self.config.args.clone());
        }
        let mut parts = self.config.isolation_wrapper.iter().cloned();
        let program = parts.next().unwrap_or_default();
        let mut args: Vec<String> = parts.collect();
        args.push(self.config.command.clone());
        args.extend(self.config.args.iter().cloned());
        (program, args)
    }
}

#[async_trait]
impl RuntimeLauncher for LocalRuntimeLauncher {
    #[instrument(skip(self, spec), fields(command = %self.config.command, allow_network = spec.env.allow_network))]
    async fn launch(&self, spec: LaunchSpec) -> SandboxResult<Box<dyn RuntimeHandle>> {
        let (program, args) = self.command_line(spec.env.allow_network);

        let mut command = Command::new(&program);
        command.args(&args);
        command.env_clear();
        for name in &self.config.pass_env {
            if let Ok(value) = std::env::var(name) {
                command.env(name, value);
            }
        }
        command.envs(&spec.extra_env);
        command.envs(spec.env.to_vars());
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| SandboxError::Spawn {
            program: program.clone(),
            source,
        })?;
        let pid = child.id();
        info!(pid, program = %program, "runtime process started");

        let tail = Arc::new(Mutex::new(StderrTail::new(self.config.stderr_tail_bytes)));
        let stdout_task = child.stdout.take().map(|stdout| tokio::spawn(drain_lines(stdout, None)));
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(drain_lines(stderr, Some(Arc::clone(&tail)))));

        Ok(Box::new(LocalRuntimeHandle {
            child,
            pid,
            exit: None,
            tail,
            output_tasks: stdout_task.into_iter().chain(stderr_task).collect(),
        }))
    }
}

/// Bounded ring of the most recent stderr bytes.
#[derive(Debug)]
struct StderrTail {
    bytes: VecDeque<u8>,
    capacity: usize,
}

impl StderrTail {
    fn new(capacity: usize) -> Self {
        Self {
            bytes: VecDeque::with_capacity(capacity.min(64 * 1024)),
            capacity,
        }
    }

    fn push_line(&mut self, line: &[u8]) {
        self.bytes.extend(line);
        self.bytes.push_back(b'\n');
        while self.bytes.len() > self.capacity {
            self.bytes.pop_front();
        }
    }

    fn render(&self) -> String {
        let (front, back) = self.bytes.as_slices();
        let mut joined = Vec::with_capacity(front.len() + back.len());
        joined.extend_from_slice(front);
        joined.extend_from_slice(back);
        String::from_utf8_lossy(&joined).trim_end().to_owned()
    }
}

async fn drain_lines<R>(reader: R, tail: Option<Arc<Mutex<StderrTail>>>)
where
    R: AsyncRead + Unpin,
{
    // Raw bytes: a runtime may print anything, and the pipe must stay open
    // until EOF or its next write dies with SIGPIPE.
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let raw = buf.strip_suffix(b"\n").unwrap_or(&buf);
                let line = String::from_utf8_lossy(raw);
                match &tail {
                    Some(tail) => {
                        debug!(target: "enclave::runtime::stderr", "{line}");
                        tail.lock().push_line(raw);
                    }
                    None => debug!(target: "enclave::runtime::stdout", "{line}"),
                }
            }
            Err(error) => {
                debug!(error = %error, "runtime output stream closed");
                break;
            }
        }
    }
}

struct LocalRuntimeHandle {
    child: Child,
    pid: Option<u32>,
    exit: Option<RuntimeExit>,
    tail: Arc<Mutex<StderrTail>>,
    output_tasks: Vec<JoinHandle<()>>,
}

impl LocalRuntimeHandle {
    /// Let the output readers reach EOF so the stderr tail is complete.
    async fn flush_output(&mut self) {
        for task in std::mem::take(&mut self.output_tasks) {
            if tokio::time::timeout(Duration::from_secs(1), task).await.is_err() {
                debug!(pid = self.pid, "runtime output reader still busy after exit");
            }
        }
    }
}

#[async_trait]
impl RuntimeHandle for LocalRuntimeHandle {
    fn id(&self) -> Option<u32> {
        self.pid
    }

    async fn wait(&mut self) -> SandboxResult<RuntimeExit> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        let status = self.child.wait().await?;
        let exit = RuntimeExit::from_status(status);
        self.exit = Some(exit);
        self.flush_output().await;
        debug!(pid = self.pid, %exit, "runtime process exited");
        Ok(exit)
    }

    async fn terminate(&mut self, grace: Duration) -> SandboxResult<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        if let Some(status) = self.child.try_wait()? {
            self.exit = Some(RuntimeExit::from_status(status));
            return Ok(());
        }
        let Some(pid) = self.pid else {
            return Ok(());
        };

        let raw = i32::try_from(pid).map_err(|_| SandboxError::Signal {
            pid,
            message: "pid out of range".to_owned(),
        })?;
        if let Err(errno) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
            // ESRCH: exited between try_wait and kill.
            debug!(pid, error = %errno, "SIGTERM not delivered");
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                self.exit = Some(RuntimeExit::from_status(status?));
                debug!(pid, "runtime process stopped after SIGTERM");
            }
            Err(_) => {
                warn!(pid, grace_ms = grace.as_millis() as u64, "runtime ignored SIGTERM, killing");
                self.child.kill().await?;
                let status = self.child.wait().await?;
                self.exit = Some(RuntimeExit::from_status(status));
            }
        }
        Ok(())
    }

    fn kill_now(&mut self) {
        if self.exit.is_none()
            && let Err(error) = self.child.start_kill()
        {
            debug!(pid = self.pid, error = %error, "kill on drop path failed");
        }
    }

    fn stderr_tail(&self) -> String {
        self.tail.lock().render()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn spec() -> LaunchSpec {
        LaunchSpec {
            env: RuntimeEnv {
                socket_dir: PathBuf::from("/tmp/none/sockets"),
                control_socket: PathBuf::from("/tmp/none/sockets/control.sock"),
                llm_socket: PathBuf::from("/tmp/none/sockets/llm.sock"),
                allow_network: false,
            },
            extra_env: BTreeMap::new(),
        }
    }

    fn shell(script: &str) -> LauncherConfig {
        LauncherConfig {
            command: "/bin/sh".to_owned(),
            args: vec!["-c".to_owned(), script.to_owned()],
            ..LauncherConfig::default()
        }
    }

    #[tokio::test]
    async fn crash_exit_code_and_stderr_tail_are_captured() {
        let launcher = LocalRuntimeLauncher::new(shell("echo boom >&2; exit 1"));
        let mut handle = launcher.launch(spec()).await.unwrap();
        let exit = handle.wait().await.unwrap();
        assert_eq!(exit.code, Some(1));
        assert!(!exit.success());
        assert_eq!(handle.stderr_tail(), "boom");
    }

    #[tokio::test]
    async fn binary_stderr_does_not_close_the_pipe() {
        let launcher = LocalRuntimeLauncher::new(shell(
            "printf '\\377\\n' >&2; sleep 0.2; echo 'fatal: after binary' >&2; exit 1",
        ));
        let mut handle = launcher.launch(spec()).await.unwrap();
        let exit = handle.wait().await.unwrap();
        assert_eq!(exit.code, Some(1), "{exit:?}");
        assert_eq!(exit.signal, None);
        let tail = handle.stderr_tail();
        assert!(tail.contains("fatal: after binary"), "{tail}");
        assert!(tail.starts_with('\u{fffd}'), "{tail}");
    }

    #[tokio::test]
    async fn environment_is_scrubbed_except_contract_and_pass_through() {
        let launcher = LocalRuntimeLauncher::new(shell(
            r#"echo "home=[$HOME] net=[$ENCLAVE_ALLOW_NETWORK] dir=[$ENCLAVE_SOCKET_DIR]" >&2"#,
        ));
        let mut handle = launcher.launch(spec()).await.unwrap();
        handle.wait().await.unwrap();
        assert_eq!(handle.stderr_tail(), "home=[] net=[0] dir=[/tmp/none/sockets]");
    }

    #[tokio::test]
    async fn isolation_wrapper_prefixes_offline_runs_only() {
        let config = LauncherConfig {
            command: "/bin/true".to_owned(),
            isolation_wrapper: vec![
                "/bin/sh".to_owned(),
                "-c".to_owned(),
                r#"echo "wrapped $0" >&2; exit 3"#.to_owned(),
            ],
            ..LauncherConfig::default()
        };
        let launcher = LocalRuntimeLauncher::new(config);

        let mut offline = launcher.launch(spec()).await.unwrap();
        assert_eq!(offline.wait().await.unwrap().code, Some(3));
        assert_eq!(offline.stderr_tail(), "wrapped /bin/true");

        let mut online_spec = spec();
        online_spec.env.allow_network = true;
        let mut online = launcher.launch(online_spec).await.unwrap();
        assert!(online.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn terminate_escalates_to_kill_after_grace() {
        let launcher = LocalRuntimeLauncher::new(shell("trap '' TERM; exec sleep 30"));
        let mut handle = launcher.launch(spec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        handle.terminate(Duration::from_millis(200)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        let exit = handle.wait().await.unwrap();
        assert!(exit.signal.is_some());

        handle.terminate(Duration::from_millis(200)).await.unwrap();
    }

    #[test]
    fn stderr_tail_keeps_only_the_newest_bytes() {
        let mut tail = StderrTail::new(8);
        tail.push_line(b"first line");
        tail.push_line(b"last");
        assert_eq!(tail.render(), "ne\nlast");
    }
}
