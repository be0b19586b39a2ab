use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use monkey_worker::{Config, Service};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "monkey-worker")]
#[command(about = "Peer-to-peer build worker")]
struct Cli {
    /// Path to a JSON config file (defaults to $MONKEY_CONFIG, then ./monkey.json)
    #[arg(short, long, global = true, env = "MONKEY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the job topic and run builds until interrupted
    Run {
        /// Development mode: loopback listener, no generated domains
        #[arg(long, env = "MONKEY_DEV")]
        dev: bool,
        /// Listen port for the peer stream
        #[arg(short, long, env = "MONKEY_PORT")]
        port: Option<u16>,
        /// Job topic to subscribe to
        #[arg(long, env = "MONKEY_TOPIC")]
        topic: Option<String>,
        /// NATS server URL
        #[arg(long, env = "MONKEY_NATS_URL")]
        nats_url: Option<String>,
        /// Base URL of the naming service
        #[arg(long, env = "MONKEY_RESOLVER_URL")]
        resolver_url: Option<String>,
        /// Base URL of the discovery service
        #[arg(long, env = "MONKEY_DISCOVERY_URL")]
        discovery_url: Option<String>,
        /// Directory holding build scripts
        #[arg(long, env = "MONKEY_SCRIPTS_DIR")]
        scripts_dir: Option<PathBuf>,
    },
    /// Load and validate the configuration, then print it
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(env_filter()?).init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::from_path(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Commands::Run {
            dev,
            port,
            topic,
            nats_url,
            resolver_url,
            discovery_url,
            scripts_dir,
        } => {
            let mut config = config;
            if dev {
                config.dev = true;
            }
            if let Some(port) = port {
                config.port = port;
                config.listen.clear();
            }
            if let Some(topic) = topic {
                config.topic = topic;
            }
            if let Some(url) = nats_url {
                config.nats.url = url;
            }
            if resolver_url.is_some() {
                config.resolver_url = resolver_url;
            }
            if discovery_url.is_some() {
                config.discovery_url = discovery_url;
            }
            if let Some(dir) = scripts_dir {
                config.scripts_dir = dir;
            }

            let token = CancellationToken::new();
            let service = Service::new(token.clone(), config)
                .await
                .context("failed to start monkey service")?;
            info!(
                "Monkey {} listening on http://{}",
                service.peer_id(),
                service.local_addr()
            );

            tokio::signal::ctrl_c().await?;
            info!("Interrupt received, shutting down");

            service.close().await;
            token.cancel();
        }
        Commands::CheckConfig => {
            let mut config = config;
            config.build()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

/// `RUST_LOG` directives plus the worker's defaults.
fn env_filter() -> Result<EnvFilter> {
    Ok(EnvFilter::from_default_env()
        .add_directive("monkey_worker=info".parse()?)
        .add_directive("monkey::script=info".parse()?)
        .add_directive("async_nats=warn".parse()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_filter_directives() {
        let filter = env_filter().unwrap().to_string();
        assert!(filter.contains("monkey_worker=info"), "{}", filter);
        assert!(filter.contains("monkey::script=info"), "{}", filter);
        assert!(filter.contains("async_nats=warn"), "{}", filter);
    }
}
