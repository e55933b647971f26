//! Relay configuration.
//!
//! Stored as TOML; every field is optional:
//!
//! ```toml
//! listen = "0.0.0.0:8080"
//! admin_listen = "127.0.0.1:8081"
//! downloads_dir = "./downloads"
//! session_timeout_secs = 120
//! keep_partial_files = true
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use pullwire_relay_server::RelayConfig;

use crate::Cli;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Address agents dial (WebSocket).
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Address of the admin HTTP API.
    #[serde(default = "default_admin_listen")]
    pub admin_listen: String,

    /// Where sink files are written; created on first use.
    #[serde(default = "default_downloads_dir")]
    pub downloads_dir: PathBuf,

    /// Sessions idle for longer than this are failed.
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,

    #[serde(default = "default_true")]
    pub keep_partial_files: bool,
}

fn default_listen() -> String {
    "0.0.0.0:8080".into()
}

fn default_admin_listen() -> String {
    "127.0.0.1:8081".into()
}

fn default_downloads_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_session_timeout_secs() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            admin_listen: default_admin_listen(),
            downloads_dir: default_downloads_dir(),
            session_timeout_secs: default_session_timeout_secs(),
            keep_partial_files: default_true(),
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
        tracing::debug!(path = %path.display(), "configuration read");
        Ok(config)
    }

    /// Applies command-line overrides.
    pub fn with_overrides(mut self, cli: &Cli) -> Self {
        if let Some(listen) = &cli.listen {
            self.listen = listen.clone();
        }
        if let Some(admin_listen) = &cli.admin_listen {
            self.admin_listen = admin_listen.clone();
        }
        if let Some(dir) = &cli.downloads_dir {
            self.downloads_dir = dir.clone();
        }
        self
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            downloads_dir: self.downloads_dir.clone(),
            session_timeout: Duration::from_secs(self.session_timeout_secs.max(1)),
            keep_partial_files: self.keep_partial_files,
        }
    }
}
