//! tund: VPN profile service
//!
//! Entry point. Parses the command line, sets up logging, loads the
//! config and runs the daemon until SIGINT or SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tund_net::{platform, NetworkCleaner};
use tund_profile::{ProcessLauncher, ProfileRegistry};
use tund_service::{Daemon, ServiceConfig, DEFAULT_CONFIG_PATH};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const DEFAULT_FILTER: &str = "tund=info,tund_profile=info,tund_net=info,tund_service=info,tower_http=info";
const DEV_FILTER: &str = "tund=debug,tund_profile=debug,tund_net=debug,tund_service=debug,tower_http=debug";

/// How long a crashed service waits for killed profiles to exit.
const CRASH_DRAIN: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "tund", version, about = "Always-on VPN profile service")]
struct Args {
    /// Service config file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Create runtime directories and exit
    #[arg(long, conflicts_with = "uninstall")]
    install: bool,
    /// Reset host networking, remove runtime files and exit
    #[arg(long)]
    uninstall: bool,
    /// Enable development features
    #[arg(long, default_value_t = false)]
    dev: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let default_filter = if args.dev { DEV_FILTER } else { DEFAULT_FILTER };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    let config = ServiceConfig::load(&args.config)
        .with_context(|| format!("Failed to load config {}", args.config.display()))?;

    if args.install {
        return tund_service::install(&config)
            .await
            .context("Install failed");
    }
    if args.uninstall {
        return tund_service::uninstall(&config, platform::native())
            .await
            .context("Uninstall failed");
    }

    info!("tund {} starting", env!("CARGO_PKG_VERSION"));
    if args.dev {
        info!("Development features enabled");
    }

    let started = Arc::new(OnceLock::new());
    match tokio::spawn(run(config.clone(), args.dev, started.clone())).await {
        Ok(result) => result,
        Err(e) => {
            error!("Service crashed: {}", e);
            let cleaner = match started.get() {
                Some(registry) => registry.cleaner().clone(),
                None => NetworkCleaner::new(platform::native(), config.cleaner_config()),
            };
            emergency_cleanup(started.get(), &cleaner).await;
            Err(e).context("Service crashed")
        }
    }
}

async fn run(config: ServiceConfig, dev: bool, started: Arc<OnceLock<ProfileRegistry>>) -> Result<()> {
    let launcher = ProcessLauncher::new(config.launcher_config());
    let daemon = Daemon::start(config, platform::native(), Arc::new(launcher), dev)
        .await
        .context("Startup failed")?;
    let _ = started.set(daemon.registry().clone());
    info!("Control API on {}", daemon.endpoint());

    let signal = wait_for_signal().await;
    let report = daemon.shutdown().await;
    signal?;
    if !report.drained {
        warn!("{} profile(s) did not stop cleanly", report.remaining);
    }
    info!("tund stopped");
    Ok(())
}

/// Kill every profile, then reset host networking after a crash. The
/// run marker stays so the next start reconciles again.
async fn emergency_cleanup(registry: Option<&ProfileRegistry>, cleaner: &NetworkCleaner) {
    if let Some(registry) = registry {
        registry.close();
        let killed = registry.stop_all(Duration::ZERO);
        info!("Killing {} profile(s) after crash", killed);
        if tokio::time::timeout(CRASH_DRAIN, registry.wait_idle()).await.is_err() {
            warn!("{} profile(s) still running after crash", registry.len());
        }
    }
    if let Err(e) = cleaner.global_reset().await {
        warn!("Network reset after crash incomplete: {}", e);
    }
    if let Err(e) = cleaner.final_cleanup().await {
        warn!("Platform cleanup after crash incomplete: {}", e);
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).context("SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
        _ = sigint.recv() => info!("Received SIGINT, shutting down"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await.context("Ctrl+C handler")?;
    info!("Received Ctrl+C, shutting down");
    Ok(())
}
