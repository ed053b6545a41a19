//! Hydrogen daemon binary.
//!
//! A thin wrapper over the library: load configuration, boot the system
//! context, serve until the host asks us to stop, then drain every queue
//! manager. The HTTP front-end and the other host services attach to the
//! same library entry points.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use hydrogen::config::Config;
use hydrogen::migrate::MigrationSet;
use hydrogen::system::System;

#[derive(Parser)]
#[command(name = "hydrogen", about = "Hydrogen database subsystem daemon")]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, default_value = "hydrogen.toml")]
    config: PathBuf,
    /// Seconds granted to in-flight queries when draining.
    #[arg(long, default_value_t = 5)]
    drain_grace: u64,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Load configuration and render every migration without connecting.
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();
    let config = Config::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    match cli.command {
        Some(Commands::Check) => run_check(&config),
        None => run_daemon(&config, Duration::from_secs(cli.drain_grace)).await,
    }
}

fn run_check(config: &Config) -> Result<()> {
    let mut failures = 0usize;
    for descriptor in config.descriptors()? {
        let Some(dir) = &descriptor.migrations else {
            info!(database = %descriptor.name, "no migrations configured");
            continue;
        };
        match MigrationSet::load(dir, descriptor.engine, &descriptor.schema) {
            Ok(set) => info!(
                database = %descriptor.name,
                engine = %descriptor.engine,
                migrations = set.records().len(),
                queries = set.queries_table().len(),
                "migrations render cleanly"
            ),
            Err(cause) => {
                error!(database = %descriptor.name, %cause, "migration check failed");
                failures += 1;
            }
        }
    }
    anyhow::ensure!(failures == 0, "{failures} database(s) failed the check");
    Ok(())
}

async fn run_daemon(config: &Config, grace: Duration) -> Result<()> {
    let system = System::boot(config).await?;
    info!("hydrogen running; send SIGTERM or Ctrl-C to drain");
    shutdown_signal().await;
    info!("shutdown requested, draining");
    system.shutdown(grace).await;
    Ok(())
}

/// Complete when the host asks the process to stop.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if let Err(cause) = result {
                            error!(%cause, "failed to listen for Ctrl-C");
                        }
                    }
                    _ = term.recv() => {}
                }
            }
            Err(cause) => {
                error!(%cause, "failed to install SIGTERM handler");
                if let Err(cause) = tokio::signal::ctrl_c().await {
                    error!(%cause, "failed to listen for Ctrl-C");
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(cause) = tokio::signal::ctrl_c().await {
            error!(%cause, "failed to listen for Ctrl-C");
        }
    }
}
