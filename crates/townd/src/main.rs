//! Gas Town supervisor daemon entry point: CLI parsing, config/logging
//! setup, daemon bootstrap (lock + PID file), worker startup and ordered
//! shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use townd::backend::tmux::TmuxBackend;
use townd::bootstrap;
use townd::credential_watch;
use townd::issues::cli::CliIssueTracker;
use townd::mail::cli::CliMailClient;
use townd::nudge::{dispatch, NudgeQueue};
use townd::supervisor::{self, Daemon};

#[derive(Parser, Debug)]
#[command(name = "townd")]
#[command(about = "Town-level supervisor daemon for Gas Town")]
#[command(version)]
struct Args {
    /// Town root directory (default: resolved via GASTOWN_ROOT or ~/.gastown)
    #[arg(long, value_name = "PATH")]
    town_root: Option<PathBuf>,

    /// Path to daemon/config.toml override
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Run attached to the terminal (the only supported mode; fork/detach
    /// is not implemented, kept for flag compatibility with other binaries)
    #[arg(long)]
    foreground: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Report whether a daemon is running for this town
    Status,
    /// Request a graceful shutdown of the running daemon
    Stop,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    town_core::logging::init();

    let town_root = match &args.town_root {
        Some(path) => path.clone(),
        None => town_core::home::resolve_town_root(&std::env::current_dir().context("failed to get current directory")?)
            .context("failed to resolve town root")?,
    };

    match args.command {
        Some(Command::Status) => return run_status(&town_root),
        Some(Command::Stop) => return run_stop(&town_root),
        None => {}
    }

    if !args.foreground {
        info!("townd has no fork/detach mode; running attached to the terminal");
    }

    let config = town_core::config::load_config(&town_root, args.config.as_deref()).context("failed to load town config")?;

    let _daemon_lock = bootstrap::acquire_daemon_lock(&town_root).context("failed to acquire daemon lock")?;
    bootstrap::write_pid_file(&town_root).context("failed to write PID file")?;
    bootstrap::clear_shutdown_marker(&town_root);

    info!(town_root = %town_root.display(), "townd starting");

    let backend = Arc::new(TmuxBackend);
    let mail = Arc::new(CliMailClient);
    let issues = Arc::new(CliIssueTracker);

    let shutdown = CancellationToken::new();
    let nats_url = std::env::var("GASTOWN_NATS_URL").unwrap_or_else(|_| "nats://127.0.0.1:4222".to_string());
    let cooldowns_for_credentials = townd::ratelimit::cooldown::CooldownStore::new(&town_root);
    let credential_task = credential_watch::spawn(
        nats_url,
        config.profiles.clone(),
        cooldowns_for_credentials,
        config.timing.default_cooldown_secs,
        shutdown.clone(),
    );

    let queue = Arc::new(NudgeQueue::new(&town_root));
    let nudge_task = tokio::spawn(dispatch::run(
        Arc::clone(&queue),
        Arc::clone(&backend) as Arc<dyn townd::backend::Backend>,
        Arc::clone(&mail) as Arc<dyn townd::mail::MailClient>,
        config.timing,
        shutdown.clone(),
    ));

    let daemon = Arc::new(Daemon::new(
        town_root.clone(),
        config,
        backend as Arc<dyn townd::backend::Backend>,
        mail as Arc<dyn townd::mail::MailClient>,
        issues as Arc<dyn townd::issues::IssueTracker>,
    ));
    let (lifecycle_tx, lifecycle_rx) = tokio::sync::mpsc::channel(8);
    let supervisor_task = tokio::spawn(supervisor::run(Arc::clone(&daemon), shutdown.clone(), lifecycle_rx));

    let shutdown_for_signals = shutdown.clone();
    let lifecycle_tx_for_signals = lifecycle_tx.clone();
    tokio::spawn(async move {
        wait_for_signal(shutdown_for_signals, lifecycle_tx_for_signals).await;
    });

    // Workers are joined in reverse dependency order: the
    // credential watcher and nudge dispatcher (leaves) drain before the
    // supervisor loop that depends on them exits last.
    let _ = credential_task.await;
    let _ = nudge_task.await;
    let _ = supervisor_task.await;

    bootstrap::remove_pid_file(&town_root);
    info!("townd shutdown complete");
    Ok(())
}

/// One signal class means "process lifecycle mail now"; all others begin
/// graceful shutdown.
async fn wait_for_signal(shutdown: CancellationToken, lifecycle_tx: tokio::sync::mpsc::Sender<()>) {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            .expect("failed to install SIGHUP handler");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("received SIGINT; beginning graceful shutdown");
                    shutdown.cancel();
                    return;
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM; beginning graceful shutdown");
                    shutdown.cancel();
                    return;
                }
                _ = sighup.recv() => {
                    info!("received SIGHUP; processing lifecycle mail now");
                    let _ = lifecycle_tx.send(()).await;
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received Ctrl+C; beginning graceful shutdown");
        shutdown.cancel();
    }
}

fn run_status(town_root: &std::path::Path) -> Result<()> {
    let alive = bootstrap::check_stale_pid_file(town_root);
    if alive {
        println!("townd is running ({})", town_root.display());
    } else {
        println!("townd is not running ({})", town_root.display());
        std::process::exit(1);
    }
    Ok(())
}

fn run_stop(town_root: &std::path::Path) -> Result<()> {
    if !bootstrap::check_stale_pid_file(town_root) {
        println!("townd is not running ({})", town_root.display());
        return Ok(());
    }
    bootstrap::request_shutdown(town_root).context("failed to write shutdown marker")?;
    println!("shutdown requested for townd ({})", town_root.display());
    Ok(())
}
