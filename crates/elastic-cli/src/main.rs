use anyhow::{anyhow, Context, Result};
use clap::Parser;
use elastic_proxy::config::ServerAddress;
use elastic_proxy::{Config, Dispatcher, Worker};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod cli;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let mut config = load_config(cli.config.as_deref()).await?;

    match cli.command {
        Commands::Server {
            socks_port,
            link_port,
            metrics,
        } => {
            if let Some(port) = socks_port {
                config.server.socks.port = port;
            }
            if let Some(port) = link_port {
                config.server.link.port = port;
            }
            if metrics {
                config.server.metrics.enabled = true;
            }
            run_server(config).await
        }
        Commands::Worker { servers } => {
            if !servers.is_empty() {
                config.worker.servers = servers
                    .iter()
                    .map(|s| parse_server_address(s))
                    .collect::<Result<Vec<_>>>()?;
            }
            run_worker(config).await
        }
        Commands::InitConfig { output } => {
            Config::default()
                .save_to_file(&output)
                .await
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!("Default configuration written to {}", output.display());
            Ok(())
        }
    }
}

async fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load_from_file(path)
            .await
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => Config::default(),
    };
    Ok(config)
}

async fn run_server(config: Config) -> Result<()> {
    let dispatcher = Dispatcher::bind(config.server)
        .await
        .context("Failed to start dispatcher")?;
    info!(
        "Dispatcher ready: SOCKS on {}, worker links on {}",
        dispatcher.socks_addr()?,
        dispatcher.link_addr()?
    );

    let shutdown = shutdown_on_ctrl_c();
    dispatcher.run(shutdown).await?;
    info!("Dispatcher stopped");
    Ok(())
}

async fn run_worker(config: Config) -> Result<()> {
    let worker = Worker::new(config.worker).context("Invalid worker configuration")?;

    let shutdown = shutdown_on_ctrl_c();
    worker.run(shutdown).await?;
    info!("Worker stopped");
    Ok(())
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => warn!("Failed to listen for ctrl-c: {}", e),
        }
        token.cancel();
    });
    shutdown
}

/// Parse `host:port`, accepting bracketed IPv6 hosts.
fn parse_server_address(value: &str) -> Result<ServerAddress> {
    let (host, port) = value
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("Expected HOST:PORT, got {}", value))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(anyhow!("Missing host in {}", value));
    }
    let port = port
        .parse::<u16>()
        .with_context(|| format!("Invalid port in {}", value))?;
    Ok(ServerAddress {
        host: host.to_string(),
        port,
    })
}

fn setup_logging(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if verbose {
        "debug"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_server_address() {
        let addr = parse_server_address("relay.example.com:8081").unwrap();
        assert_eq!(addr.host, "relay.example.com");
        assert_eq!(addr.port, 8081);

        let addr = parse_server_address("[::1]:9000").unwrap();
        assert_eq!(addr.host, "::1");
        assert_eq!(addr.port, 9000);

        assert!(parse_server_address("relay.example.com").is_err());
        assert!(parse_server_address(":8081").is_err());
        assert!(parse_server_address("host:http").is_err());
    }

    #[tokio::test]
    async fn test_missing_config_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(Some(&dir.path().join("absent.toml"))).await.is_err());
        assert!(load_config(None).await.is_ok());
    }
}
