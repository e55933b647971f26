//! Agent configuration, stored as TOML with every field optional.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use pullwire_agent::{AgentOptions, ReconnectConfig};
use pullwire_transfer::FlowConfig;

use crate::Cli;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Registration identity; a random UUID is used when absent.
    #[serde(default)]
    pub client_id: Option<String>,

    #[serde(default = "default_file_path")]
    pub file_path: PathBuf,

    /// Chunk payload size in bytes before encoding.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Chunks written to the connection but not yet flushed.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

fn default_server_url() -> String {
    "ws://127.0.0.1:8080/ws".into()
}

fn default_file_path() -> PathBuf {
    PathBuf::from("./outbox.bin")
}

fn default_chunk_size() -> usize {
    FlowConfig::default().chunk_size
}

fn default_max_in_flight() -> usize {
    FlowConfig::default().max_in_flight
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            client_id: None,
            file_path: default_file_path(),
            chunk_size: default_chunk_size(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

impl Config {
    /// Loads `path`, falling back to defaults when no file is given or the
    /// file does not exist.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.exists() {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    pub fn with_overrides(mut self, cli: &Cli) -> Self {
        if let Some(url) = &cli.server_url {
            self.server_url = url.clone();
        }
        if let Some(id) = &cli.client_id {
            self.client_id = Some(id.clone());
        }
        if let Some(path) = &cli.file_path {
            self.file_path = path.clone();
        }
        self
    }

    pub fn agent_options(&self) -> AgentOptions {
        AgentOptions {
            server_url: self.server_url.clone(),
            client_id: self
                .client_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            file_path: self.file_path.clone(),
            flow: FlowConfig {
                chunk_size: self.chunk_size,
                max_in_flight: self.max_in_flight,
            }
            .normalized(),
            reconnect: ReconnectConfig::default(),
        }
    }
}
