//! Runs the agent until Ctrl-C.

use std::sync::Arc;

use pullwire_agent::{Agent, AgentOptions};

pub async fn run(options: AgentOptions) -> anyhow::Result<()> {
    if !options.file_path.exists() {
        tracing::warn!(
            file = %options.file_path.display(),
            "file does not exist yet, requests will be answered with an error"
        );
    }

    let agent = Arc::new(Agent::new(options));
    let runner = Arc::clone(&agent);
    let mut run = tokio::spawn(async move { runner.run().await });

    tokio::select! {
        result = &mut run => {
            result??;
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, shutting down");
        }
    }

    agent.shutdown();
    run.await??;
    Ok(())
}
