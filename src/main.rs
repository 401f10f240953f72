#![forbid(unsafe_code)]

//! `acp-bridge` — server binary.
//!
//! Bootstraps configuration from the environment, assembles the bridge
//! (session manager, repository provider, adapters), serves the HTTP
//! ingress surface, and drains on SIGTERM/ctrl-c. Shutdown is driven by
//! one [`CancellationToken`]: the signal listener cancels it, `serve`
//! stops ingress and closes live agent sessions (their persisted records
//! survive for resumption), and the sweeper task winds down with it. A
//! repeated signal skips the drain and exits immediately.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use acp_bridge::app::Bridge;
use acp_bridge::config::GlobalConfig;
use acp_bridge::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "acp-bridge", about = "ACP bridge server", version, long_about = None)]
struct Cli {
    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the HTTP port.
    #[arg(long)]
    port: Option<u16>,

    /// Override the data directory (bare repos, worktrees, session store).
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("acp-bridge bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let mut config = GlobalConfig::from_env()?;
    if let Some(port) = args.port {
        config.http_port = port;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    info!(
        services = ?config.enabled_services,
        agents = config.agents.len(),
        "configuration loaded"
    );

    let bridge = Bridge::build(config).await?;
    bridge.start_adapters().await?;

    let ct = CancellationToken::new();
    let signal_task = spawn_signal_listener(ct.clone());
    let sweeper = bridge.spawn_worktree_sweeper(ct.clone());

    let served = bridge.serve(ct.clone()).await;

    // serve() also returns on its own failure path; make sure the sweeper
    // and any other token-driven tasks wind down either way.
    ct.cancel();
    let _ = sweeper.await;
    signal_task.abort();
    served?;

    info!("acp-bridge shut down");
    Ok(())
}

/// Listen for termination signals for the whole process lifetime.
///
/// The first SIGTERM/ctrl-c cancels `ct`, which drains ingress and closes
/// live agent sessions; a second signal means the drain is stuck (or the
/// operator is impatient) and exits the process immediately.
fn spawn_signal_listener(ct: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        #[cfg(unix)]
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => Some(sigterm),
                Err(err) => {
                    tracing::warn!(%err, "SIGTERM handler unavailable, listening for ctrl-c only");
                    None
                }
            };

        let mut received = 0u32;
        loop {
            #[cfg(unix)]
            match sigterm.as_mut() {
                Some(sigterm) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = sigterm.recv() => {}
                    }
                }
                None => {
                    let _ = tokio::signal::ctrl_c().await;
                }
            }

            #[cfg(not(unix))]
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }

            received += 1;
            if received == 1 {
                info!("termination signal received, draining sessions");
                ct.cancel();
            } else {
                error!("second termination signal, exiting without drain");
                std::process::exit(1);
            }
        }
    })
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter);

    match log_format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().flatten_event(true).try_init(),
    }
    .map_err(|err| AppError::Config(format!("tracing init failed: {err}")))
}
