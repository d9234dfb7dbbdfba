use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use portal_sync::{PortalConfig, PortalService};

#[derive(Parser, Debug)]
#[command(author, version, about = "Reconcile portal state with an identity agent", long_about = None)]
struct Args {
    /// TOML config file. Without one, configuration comes from PORTAL_* variables.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the agent HTTP API URL
    #[arg(long)]
    agent_url: Option<String>,

    /// Override the agent event stream URL
    #[arg(long)]
    events_url: Option<String>,

    /// Override the state directory
    #[arg(long)]
    state_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = PortalConfig::load(args.config.as_deref())?;
    if let Some(url) = args.agent_url {
        config.agent_url = url;
    }
    if let Some(url) = args.events_url {
        config.events_url = url;
    }
    if let Some(path) = args.state_path {
        config.state_path = Some(path);
    }
    config.validate()?;

    info!(
        agent_url = %config.agent_url,
        events_url = %config.events_url,
        max_retries = config.retry.max_retry_count,
        "Starting portal sync"
    );

    let service = PortalService::build(config)?;
    service
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
}
