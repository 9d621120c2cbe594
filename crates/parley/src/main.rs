use anyhow::{Context, Result};
use clap::Parser;
use parley::health::HttpProbe;
use parley::{server, telemetry, Daemon};
use parleyconf::ParleyConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// The Parley orchestrator daemon
///
/// Terminates WebSocket clients and mediates LLM-backed agent sessions.
///
/// Configuration is loaded from (in order, later wins):
/// 1. Compiled defaults
/// 2. /etc/parley/config.toml
/// 3. ~/.config/parley/config.toml
/// 4. ./parley.toml (or --config path)
/// 5. Environment variables (PARLEY_*)
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file (overrides ./parley.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Show loaded configuration and exit
    #[arg(long)]
    show_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, sources) = ParleyConfig::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;

    if cli.show_config {
        println!("# Configuration sources:");
        for path in &sources.files {
            println!("#   - {}", path.display());
        }
        if !sources.env_overrides.is_empty() {
            println!("# Environment overrides:");
            for var in &sources.env_overrides {
                println!("#   - {}", var);
            }
        }
        println!();
        println!(
            "{}",
            toml::to_string_pretty(&config).context("Failed to render configuration")?
        );
        return Ok(());
    }

    telemetry::init(&config.telemetry).context("Failed to initialize telemetry")?;

    let probe_timeout = Duration::from_millis(config.health.probe_timeout_ms);
    let daemon = Daemon::new(config).context("Failed to assemble daemon")?;

    let shutdown = CancellationToken::new();

    // Background tasks: cluster probes, health event fan-out, span TTL sweep.
    let health = daemon.health.clone();
    let probe = Arc::new(HttpProbe::new(probe_timeout));
    let health_task = {
        let cancel = shutdown.clone();
        tokio::spawn(async move { health.run(probe, cancel).await })
    };
    let bridge_task = server::spawn_health_bridge(daemon.clone(), shutdown.clone());
    let sweeper_task = server::spawn_span_sweeper(daemon.clone(), shutdown.clone());

    // Serve until SIGINT.
    let serve_task = {
        let daemon = daemon.clone();
        let cancel = shutdown.clone();
        tokio::spawn(async move { server::serve(daemon, cancel).await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("shutdown requested");
    shutdown.cancel();

    serve_task.await?.context("server task failed")?;
    let _ = tokio::join!(health_task, bridge_task, sweeper_task);

    telemetry::shutdown()?;
    Ok(())
}
