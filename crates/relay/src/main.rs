use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

use relay_shared::config::RelayConfig;

#[derive(Debug, Parser)]
#[command(name = "relay", about = "Protocol-version-translating game relay")]
struct Args {
    /// Path to the relay configuration file.
    #[arg(long, default_value = "relay.toml")]
    config: PathBuf,
    /// Override the listening address from the config file.
    #[arg(long)]
    listen: Option<SocketAddr>,
    /// Override the upstream server address from the config file.
    #[arg(long)]
    upstream: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut config = RelayConfig::load(&args.config)?;
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(upstream) = args.upstream {
        config.upstream_addr = upstream;
    }
    config.validate()?;

    tokio::select! {
        result = relay::run(config) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    }
}
