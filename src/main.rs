#![forbid(unsafe_code)]

//! `pml-mediator` binary: run one capability through the mediator.
//!
//! Loads configuration and credentials, registers a session when a cloud
//! url is configured, executes the code file, prints the outcome as JSON on
//! stdout, then flushes traces and unregisters.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use pml_mediator::config::GlobalConfig;
use pml_mediator::mediator::{Mediator, RunOutcome, RunRequest};
use pml_mediator::session::{ClientIdentity, SessionClient};
use pml_mediator::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "pml-mediator", about = "Sandboxed capability execution mediator", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json). Logs go to stderr.
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Execute a code file in a fresh worker.
    Run {
        /// File containing the code to execute.
        code_file: PathBuf,

        /// Context object passed to the code, as JSON.
        #[arg(long, default_value = "{}")]
        context: String,

        /// Capability id used to label the trace.
        #[arg(long, default_value = "adhoc")]
        capability: String,

        /// Parent trace id, when this run is nested in another.
        #[arg(long)]
        parent_trace: Option<String>,

        /// Grant any approval the run asks for and resume immediately.
        #[arg(long)]
        approve: bool,
    },
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    config.load_credentials().await?;
    info!(standalone = config.is_standalone(), "configuration loaded");

    // ── Register session ────────────────────────────────
    let session = match config.cloud.url.as_deref() {
        Some(url) => {
            let identity = ClientIdentity::load_or_create(&config.state_dir()).await?;
            let client = Arc::new(SessionClient::new(
                url,
                config.cloud.api_key.clone(),
                identity,
                &config.workspace_root,
                config.timeouts.http(),
            )?);
            client.register().await?;
            client.start_heartbeat();
            Some(client)
        }
        None => {
            info!("no cloud url configured; running standalone");
            None
        }
    };

    let mediator = Mediator::from_config(&config, session.clone())?;

    // ── Execute ─────────────────────────────────────────
    let result = tokio::select! {
        result = execute(&mediator, args.command) => result,
        () = shutdown_signal() => {
            warn!("shutdown signal received; abandoning execution");
            Ok(())
        }
    };

    // ── Shutdown ────────────────────────────────────────
    let report = mediator.shutdown().await;
    info!(sent = report.sent, dropped = report.dropped, "trace syncer stopped");
    if let Some(session) = session {
        session.unregister().await;
    }

    result
}

async fn execute(mediator: &Mediator, command: Command) -> Result<()> {
    let Command::Run {
        code_file,
        context,
        capability,
        parent_trace,
        approve,
    } = command;

    let code = tokio::fs::read_to_string(&code_file)
        .await
        .map_err(|err| AppError::Io(format!("cannot read {}: {err}", code_file.display())))?;
    let context: Value = serde_json::from_str(&context)
        .map_err(|err| AppError::Config(format!("--context is not valid json: {err}")))?;

    let mut outcome = mediator
        .run(
            RunRequest {
                code,
                context,
                capability_id: capability,
                parent_trace_id: parent_trace,
            },
            None,
        )
        .await;

    let paused = match &outcome {
        RunOutcome::ApprovalRequired { workflow_id, .. } if approve => Some(workflow_id.clone()),
        _ => None,
    };
    if let Some(workflow_id) = paused {
        info!(workflow_id = %workflow_id, "auto-approving paused workflow");
        outcome = mediator.continue_workflow(&workflow_id, true, None).await?;
    }

    let rendered = serde_json::to_string_pretty(&outcome)
        .map_err(|err| AppError::Io(format!("failed to render outcome: {err}")))?;
    println!("{rendered}");

    if let RunOutcome::Completed { result, .. } = &outcome {
        if !result.success {
            error!(error = ?result.error, "execution failed");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
