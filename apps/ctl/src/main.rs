//! Command-line client for the relay admin API.

mod client;

use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use client::AdminClient;

#[derive(Debug, Parser)]
#[command(name = "pullwire-ctl", version, about = "Drive a pullwire relay")]
struct Cli {
    /// Base URL of the relay admin API.
    #[arg(long, env = "PULLWIRE_ADMIN_URL", default_value = "http://127.0.0.1:8081")]
    admin_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List connected clients, oldest first.
    List,

    /// Ask a client to send its file.
    Trigger {
        client_id: String,

        /// Wait for the client to connect before triggering.
        #[arg(long)]
        wait: bool,

        /// Poll interval while waiting, in milliseconds.
        #[arg(long, default_value_t = 500)]
        poll_ms: u64,

        /// Give up waiting after this many seconds.
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
    },

    /// Show the state of a download session.
    Status { session_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let admin = AdminClient::new(&cli.admin_url)?;

    match cli.command {
        Command::List => {
            let clients = admin.list_clients().await?;
            if clients.is_empty() {
                println!("no clients connected");
            }
            for c in clients {
                let busy = if c.has_active_download { "  (downloading)" } else { "" };
                println!("{}  {}{busy}", c.connected_at.to_rfc3339(), c.id);
            }
        }
        Command::Trigger {
            client_id,
            wait,
            poll_ms,
            timeout_secs,
        } => {
            if wait {
                println!("waiting for {client_id} to connect...");
                admin
                    .wait_for_client(
                        &client_id,
                        Duration::from_millis(poll_ms.max(1)),
                        Duration::from_secs(timeout_secs),
                    )
                    .await?;
            }
            let ticket = admin.trigger(&client_id).await?;
            println!(
                "{} download {} for {}",
                ticket.status, ticket.session_id, ticket.client_id
            );
        }
        Command::Status { session_id } => {
            let s = admin.session(&session_id).await?;
            println!(
                "{} ({}): {}  {} chunks, {} bytes",
                s.session_id, s.client_id, s.state, s.chunks, s.bytes
            );
            if let Some(error) = s.error {
                println!("error: {error}");
            }
        }
    }

    Ok(())
}
