mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use enclave_approval::ApprovalDecision;
use enclave_kernel::{ActionRegistry, EnclaveKernel, KernelBuilder};
use enclave_protocol::SessionId;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::DaemonConfig;

#[derive(Debug, Parser)]
#[command(name = "enclaved", version)]
#[command(about = "Run sandboxed agent sessions")]
struct Cli {
    /// TOML configuration file
    #[arg(long, env = "ENCLAVE_CONFIG", global = true)]
    config: Option<PathBuf>,
    /// Overrides `root` from the configuration
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the agent for one turn of a session
    Run {
        #[arg(long)]
        session_id: String,
        #[arg(long)]
        prompt: Option<String>,
        /// Overrides `executor.timeout_secs`
        #[arg(long)]
        timeout_secs: Option<f64>,
        /// Overrides `executor.launcher.command`
        #[arg(long)]
        runtime_command: Option<String>,
    },
    /// Apply approval decisions to paused tool calls, then resume the run
    Approve {
        #[arg(long)]
        session_id: String,
        /// JSON array of decisions, or `@path` to read them from a file
        #[arg(long)]
        decisions: String,
        /// Only execute the tools; do not resume the agent
        #[arg(long)]
        no_resume: bool,
    },
    /// Mint a capability token for debugging
    Mint {
        #[arg(long, value_enum)]
        kind: TokenKind,
        #[arg(long)]
        session_id: String,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TokenKind {
    Tool,
    Llm,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = DaemonConfig::load(cli.config.as_deref())?;
    if let Some(root) = cli.root {
        config.root = root;
    }
    if let Command::Run {
        timeout_secs,
        runtime_command,
        ..
    } = &cli.command
    {
        if let Some(timeout_secs) = timeout_secs {
            config.executor.timeout_secs = *timeout_secs;
        }
        if let Some(command) = runtime_command {
            config.executor.launcher.command = command.clone();
        }
    }

    let registry = ActionRegistry::with_core_actions();
    let kernel = KernelBuilder::new(&config.root)
        .config(config.executor.clone())
        .resolver(std::sync::Arc::new(registry.clone()))
        .build()?;

    match cli.command {
        Command::Run {
            session_id, prompt, ..
        } => {
            let scope = config.scope(&registry, SessionId::from(session_id));
            let cancel = cancel_on_shutdown();
            let events = spawn_event_logger(&kernel);
            let result = kernel.run(&scope, prompt, cancel).await?;
            stop_event_logger(events).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(exit_code(result.success))
        }
        Command::Approve {
            session_id,
            decisions,
            no_resume,
        } => {
            let scope = config.scope(&registry, SessionId::from(session_id));
            let decisions = parse_decisions(&decisions)?;
            let events = spawn_event_logger(&kernel);
            let success = if no_resume {
                let report = kernel.approve(&scope, decisions).await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
                true
            } else {
                let continuation = kernel
                    .continue_after_approval(&scope, decisions, cancel_on_shutdown())
                    .await?;
                println!("{}", serde_json::to_string_pretty(&continuation)?);
                continuation.run.is_none_or(|run| run.success)
            };
            stop_event_logger(events).await;
            Ok(exit_code(success))
        }
        Command::Mint { kind, session_id } => {
            let scope = config.scope(&registry, SessionId::from(session_id));
            let token = match kind {
                TokenKind::Tool => kernel
                    .tokens()
                    .mint_tool_token(&scope.tool_claims(), config.executor.tool_token_ttl()),
                TokenKind::Llm => kernel
                    .tokens()
                    .mint_llm_token(&scope.llm_claims(), config.executor.llm_token_ttl()),
            }
            .context("failed minting token")?;
            println!("{token}");
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

fn parse_decisions(raw: &str) -> Result<Vec<ApprovalDecision>> {
    let raw = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed reading decisions from {path}"))?,
        None => raw.to_owned(),
    };
    let decisions: Vec<ApprovalDecision> =
        serde_json::from_str(&raw).context("decisions must be a JSON array")?;
    if decisions.is_empty() {
        bail!("no decisions given");
    }
    Ok(decisions)
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn spawn_event_logger(kernel: &EnclaveKernel) -> tokio::task::JoinHandle<()> {
    let mut events = kernel.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            let rendered = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_owned());
            info!(event = %rendered, "session.event");
        }
    })
}

async fn stop_event_logger(task: tokio::task::JoinHandle<()>) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    task.abort();
    if let Err(error) = task.await
        && !error.is_cancelled()
    {
        warn!(%error, "event logger stopped");
    }
}

/// Cancel the run on Ctrl+C or SIGTERM; the executor still cleans up.
fn cancel_on_shutdown() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("shutdown requested, cancelling run");
        trigger.cancel();
    });
    cancel
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::error!(%error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
