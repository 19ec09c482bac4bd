//! autofilterd - adaptive traffic filtering for nginx front ends.

use anyhow::{bail, Context};
use autofilterd::daemon::Daemon;
use autofilterd::fcrdns::FcrdnsVerifier;
use autofilterd::policy::Policy;
use autofilterd::server::{NginxControl, DEFAULT_PIDFILE};
use autofilterd::tailer::{LogTailer, TailMode};
use autofilterd::{DEFAULT_ROOT, PRODUCTION_ACCESS_LOG};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "autofilterd",
    version,
    about = "Adaptive traffic filtering for nginx front ends"
)]
struct Cli {
    /// Operating mode; the filtering daemon runs as `daemon`.
    mode: String,

    /// Access log to follow.
    #[arg(long, default_value = PRODUCTION_ACCESS_LOG)]
    log: PathBuf,

    /// Filesystem root holding autofilter.conf and var/.
    #[arg(long, default_value = DEFAULT_ROOT)]
    root: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let cli = Cli::parse();
    match cli.mode.as_str() {
        "daemon" => run_daemon(cli).await,
        other => bail!("unknown mode '{other}' (the filtering daemon runs as 'daemon')"),
    }
}

async fn run_daemon(cli: Cli) -> anyhow::Result<()> {
    // Guard against reprocessing a copied or replayed log: blocks come
    // off the production stream only.
    if cli.log != Path::new(PRODUCTION_ACCESS_LOG) {
        bail!(
            "refusing to run the daemon against {} (the daemon reads {})",
            cli.log.display(),
            PRODUCTION_ACCESS_LOG
        );
    }

    let policy_path = cli.root.join("autofilter.conf");
    let policy = Policy::load(&policy_path)
        .with_context(|| format!("loading policy from {}", policy_path.display()))?;

    let var_dir = cli.root.join("var");
    std::fs::create_dir_all(&var_dir)
        .with_context(|| format!("creating working directory {}", var_dir.display()))?;
    let block_file = var_dir.join("bot.conf");

    info!(
        policy = %policy_path.display(),
        block_file = %block_file.display(),
        resolver = %policy.resolver,
        "starting autofilterd"
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    spawn_signal_watcher(Arc::clone(&shutdown));

    let control = NginxControl::new(DEFAULT_PIDFILE);
    let verifier = FcrdnsVerifier::new(policy.resolver, policy.resolver_timeout);

    let mut tailer = LogTailer::open(
        &cli.log,
        TailMode::Follow,
        control.clone(),
        Arc::clone(&shutdown),
    )
    .await
    .context("cannot open access log")?;

    let mut daemon = Daemon::new(policy, block_file, verifier, control);
    daemon.run(&mut tailer).await?;

    info!("shutdown complete");
    Ok(())
}

/// Set the termination flag on SIGINT or SIGTERM; the tailer observes
/// it at its next yield point and the daemon winds down cleanly.
fn spawn_signal_watcher(shutdown: Arc<AtomicBool>) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to install SIGINT handler");
                return;
            }
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };

        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
        shutdown.store(true, Ordering::Relaxed);
    });
}
