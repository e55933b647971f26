//! pullwire agent entry point.

mod app;
mod config;

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Agent that serves a file to the relay on request.
#[derive(Debug, Parser)]
#[command(name = "pullwire-agent", version)]
pub struct Cli {
    /// TOML configuration file. A missing file means defaults.
    #[arg(long, env = "PULLWIRE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Relay WebSocket URL.
    #[arg(long, env = "PULLWIRE_SERVER_URL")]
    pub server_url: Option<String>,

    /// Identity to register under. A random UUID when unset.
    #[arg(long, env = "PULLWIRE_CLIENT_ID")]
    pub client_id: Option<String>,

    /// File sent for every download request.
    #[arg(long = "file", env = "PULLWIRE_FILE")]
    pub file_path: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting pullwire agent");

    let cli = Cli::parse();
    let config = config::Config::load(cli.config.as_deref())?.with_overrides(&cli);
    let options = config.agent_options();
    tracing::info!(
        client_id = %options.client_id,
        server_url = %options.server_url,
        file = %options.file_path.display(),
        "configuration loaded"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(options))?;

    tracing::info!("agent shut down cleanly");
    Ok(())
}
