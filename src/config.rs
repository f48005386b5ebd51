//! Runtime configuration for feed-sync.
//!
//! Configuration is loaded from a JSON file or constructed programmatically.
//! Every section has defaults, so a partial file only overrides what it names.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "feed-sync", about = "Offline-first feed cache with a local HTTP API")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address (overrides the config file).
    #[arg(long)]
    pub listen: Option<String>,

    /// Signed-in user id. Omit to run anonymously.
    #[arg(long)]
    pub user_id: Option<i64>,

    /// Bearer token sent to the remote API.
    #[arg(long)]
    pub token: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local API server.
    pub server: ServerConfig,

    /// Async runtime sizing.
    pub runtime: RuntimeConfig,

    /// Remote API endpoint.
    pub remote: RemoteConfig,

    /// Window sizing.
    pub paging: PagingConfig,

    /// Local persistence.
    pub store: StoreConfig,

    /// Background newer-items polling.
    pub newer: NewerConfig,
}

/// Local HTTP API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "127.0.0.1:8787").
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8787".to_string(),
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Tokio worker threads (0 = one per core).
    pub worker_threads: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { worker_threads: 4 }
    }
}

/// Remote API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Base URL; resource paths are joined under `{base_url}/api/`.
    pub base_url: String,

    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9999".to_string(),
            request_timeout_secs: 30,
        }
    }
}

impl RemoteConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Page window sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PagingConfig {
    /// Rows added per APPEND / PREPEND.
    pub page_size: usize,

    /// Rows fetched by REFRESH and shown by a fresh window.
    pub initial_load_size: usize,

    /// Launch a REFRESH when a repository stream is opened.
    pub refresh_on_open: bool,
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self {
            page_size: 10,
            initial_load_size: 30,
            refresh_on_open: true,
        }
    }
}

/// Local persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory for per-kind snapshots. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,

    /// Compress snapshots with zstd.
    pub compress: bool,

    /// zstd compression level (1-22).
    pub zstd_level: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            compress: true,
            zstd_level: 3,
        }
    }
}

/// Background newer-items watch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NewerConfig {
    pub enabled: bool,

    /// Seconds between polls.
    pub poll_interval_secs: u64,
}

impl Default for NewerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: 10,
        }
    }
}

impl NewerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Apply command-line overrides.
    pub fn with_cli(mut self, cli: &Cli) -> Self {
        if let Some(listen) = &cli.listen {
            self.server.listen = listen.clone();
        }
        self
    }
}
