//! Wires the relay and its admin API together.

use anyhow::Context;
use tokio::net::TcpListener;

use pullwire_relay_server::{RelayServer, serve_admin};

use crate::config::Config;

/// Runs the relay until Ctrl-C or a fatal listener error.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let relay = RelayServer::new(config.relay_config());

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;
    let admin_listener = TcpListener::bind(&config.admin_listen)
        .await
        .with_context(|| format!("binding {}", config.admin_listen))?;

    let admin = tokio::spawn(serve_admin(relay.clone(), admin_listener));

    tokio::select! {
        result = relay.run(listener) => {
            result.context("relay server")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, shutting down");
        }
    }

    relay.shutdown();
    match admin.await {
        Ok(result) => result.context("admin API")?,
        Err(e) => tracing::error!("admin task failed: {e}"),
    }

    Ok(())
}
