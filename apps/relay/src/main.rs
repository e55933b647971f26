//! pullwire relay entry point.

mod app;
mod config;

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Relay for reverse-initiated file downloads.
#[derive(Debug, Parser)]
#[command(name = "pullwire-relay", version)]
pub struct Cli {
    /// TOML configuration file. A missing file means defaults.
    #[arg(long, env = "PULLWIRE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Agent WebSocket listen address.
    #[arg(long, env = "PULLWIRE_LISTEN")]
    pub listen: Option<String>,

    /// Admin HTTP listen address.
    #[arg(long, env = "PULLWIRE_ADMIN_LISTEN")]
    pub admin_listen: Option<String>,

    /// Directory receiving downloaded files.
    #[arg(long, env = "PULLWIRE_DOWNLOADS_DIR")]
    pub downloads_dir: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting pullwire relay");

    let cli = Cli::parse();
    let config = config::Config::load(cli.config.as_deref())?.with_overrides(&cli);
    tracing::info!(
        listen = %config.listen,
        admin_listen = %config.admin_listen,
        downloads_dir = %config.downloads_dir.display(),
        "configuration loaded"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config))?;

    tracing::info!("relay shut down cleanly");
    Ok(())
}
