//! CLI command implementations

use std::path::PathBuf;
use std::sync::Arc;

use acerelay_core::config::RelayConfig;
use acerelay_core::{RelayComponents, RuntimeMode, StreamQuality};
use anyhow::Context;
use clap::{Args, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Start the relay server
    Server {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,
        /// Port to bind to
        #[arg(short, long)]
        port: Option<u16>,
        #[command(flatten)]
        relay: RelayArgs,
    },
    /// Probe every catalog stream once and print channel rankings
    Probe {
        /// Only print the ranking of this channel
        #[arg(short, long)]
        channel: Option<String>,
        #[command(flatten)]
        relay: RelayArgs,
    },
    /// Check that the media engine is reachable
    Ping {
        #[command(flatten)]
        relay: RelayArgs,
    },
}

/// Options shared by every command, layered over `ACERELAY_*` variables.
#[derive(Args)]
pub struct RelayArgs {
    /// Engine backend to use
    #[arg(long, value_enum)]
    mode: Option<RuntimeMode>,
    /// Base URL of the engine HTTP API
    #[arg(long)]
    engine_url: Option<String>,
    /// JSON channel catalog
    #[arg(long)]
    catalog: Option<PathBuf>,
}

impl RelayArgs {
    fn into_config(self) -> RelayConfig {
        let mut config = RelayConfig::from_env();
        if let Some(mode) = self.mode {
            config.runtime_mode = mode;
        }
        if let Some(url) = self.engine_url {
            config.engine.base_url = url.trim_end_matches('/').to_string();
        }
        if self.catalog.is_some() {
            config.catalog_path = self.catalog;
        }
        config
    }
}

/// Handle the CLI command
///
/// # Errors
/// Returns the error of the command that failed
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Server { host, port, relay } => start_server(host, port, relay).await,
        Commands::Probe { channel, relay } => run_probe_cycle(channel, relay).await,
        Commands::Ping { relay } => ping_engine(relay).await,
    }
}

/// Serve until ctrl-c
///
/// # Errors
/// - Components could not be built (invalid engine URL, unreadable catalog)
/// - The listen address could not be bound
pub async fn start_server(
    host: Option<String>,
    port: Option<u16>,
    relay: RelayArgs,
) -> anyhow::Result<()> {
    let mut config = relay.into_config();
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    let components = Arc::new(RelayComponents::build(&config)?);
    let shutdown = CancellationToken::new();

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(%error, "Cannot listen for ctrl-c, stop the process to shut down");
            return;
        }
        info!("Shutdown requested");
        signal.cancel();
    });

    info!(
        mode = %config.runtime_mode,
        host = %config.server.host,
        port = config.server.port,
        "Starting Acerelay server"
    );
    acerelay_web::run_server(&config.server, components, shutdown).await?;
    Ok(())
}

/// Run one probe cycle and print rankings
///
/// # Errors
/// - Components could not be built
/// - The catalog could not be read or `channel` is unknown
pub async fn run_probe_cycle(channel: Option<String>, relay: RelayArgs) -> anyhow::Result<()> {
    probe_and_rank(&relay.into_config(), channel).await
}

async fn probe_and_rank(config: &RelayConfig, channel: Option<String>) -> anyhow::Result<()> {
    let components = RelayComponents::build(config)?;

    let summary = components
        .probes
        .probe_all_streams(&CancellationToken::new())
        .await
        .context("probe cycle failed")?;
    println!(
        "Probed {} streams: {} available, {} unavailable, {} failed",
        summary.probed, summary.available, summary.unavailable, summary.failed
    );

    let channels = match channel {
        Some(channel) => vec![channel],
        None => components.catalog.channels().await?,
    };
    if channels.is_empty() {
        println!("Catalog has no channels, pass --catalog or set ACERELAY_CATALOG");
        return Ok(());
    }

    for channel in channels {
        let ranked = components
            .probes
            .get_quality_scores(&channel)
            .await
            .with_context(|| format!("cannot rank channel {channel}"))?;
        print_ranking(&channel, &ranked);
    }
    Ok(())
}

fn print_ranking(channel: &str, ranked: &[StreamQuality]) {
    println!();
    println!("{channel}");
    if ranked.is_empty() {
        println!("  (no streams)");
        return;
    }
    for (position, stream) in ranked.iter().enumerate() {
        println!(
            "  {:>2}. {}  score {:.3}  uptime {:>5.1}%  peers {:>5.1}  {:>8.1} KiB/s",
            position + 1,
            stream.info_hash,
            stream.score,
            stream.metrics.uptime_ratio * 100.0,
            stream.metrics.avg_peer_count,
            stream.metrics.avg_download_speed / 1024.0,
        );
    }
}

/// Check engine reachability
///
/// # Errors
/// - The engine URL is invalid or the engine did not answer
pub async fn ping_engine(relay: RelayArgs) -> anyhow::Result<()> {
    let config = relay.into_config();
    let components = RelayComponents::build(&config)?;

    components
        .engine
        .ping()
        .await
        .with_context(|| format!("engine at {} is not reachable", config.engine.base_url))?;
    println!(
        "Engine reachable ({}, {})",
        config.runtime_mode.engine_label(),
        config.engine.base_url
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct TestCli {
        #[command(subcommand)]
        command: Commands,
    }

    #[test]
    fn test_flags_override_environment_defaults() {
        let cli = TestCli::try_parse_from([
            "acerelay",
            "server",
            "--port",
            "9000",
            "--mode",
            "dev",
            "--engine-url",
            "http://engine:6878/",
        ])
        .unwrap();

        let Commands::Server { port, relay, .. } = cli.command else {
            panic!("expected server command");
        };
        assert_eq!(port, Some(9000));

        let config = relay.into_config();
        assert_eq!(config.runtime_mode, RuntimeMode::Development);
        assert_eq!(config.engine.base_url, "http://engine:6878");
    }

    #[test]
    fn test_unknown_mode_is_rejected() {
        assert!(TestCli::try_parse_from(["acerelay", "ping", "--mode", "staging"]).is_err());
    }

    #[tokio::test]
    async fn test_probe_cycle_runs_against_simulated_engine() {
        let config = RelayConfig::for_testing();

        probe_and_rank(&config, Some("demo-news".to_string()))
            .await
            .unwrap();
        assert!(
            probe_and_rank(&config, Some("missing".to_string()))
                .await
                .is_err()
        );
    }
}
