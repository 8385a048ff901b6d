//! Configuration for the server

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    http::HttpConfig,
    ingest::{PipelineOptions, DEFAULT_BATCH_BYTES, DEFAULT_IDLE_FLUSH},
};

const DEFAULT_METRICS_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9118);

/// Server configuration
///
/// The config is usually loaded from a file with [`Self::load`].
///
/// The struct also implements [`Default`] which creates a config suitable for local development
/// and testing.
#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    /// Config for the HTTP server
    ///
    /// If set to `None` no HTTP server will be started.
    pub http: Option<HttpConfig>,
    /// Config for the store.
    #[serde(default)]
    pub store: StoreConfig,
    /// Config for ingestion pipelines.
    #[serde(default)]
    pub ingest: IngestConfig,
    /// Config for the metrics server.
    ///
    /// The metrics server is started by default. To disable the metrics server, set to
    /// `Some(MetricsConfig::disabled())`.
    pub metrics: Option<MetricsConfig>,
}

/// The config for the store.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path of the database file. Defaults to a file in [`Config::data_dir`].
    pub path: Option<PathBuf>,
}

/// The config for ingestion pipelines.
#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// A batch is committed once its rows reach this many bytes.
    pub batch_bytes: usize,
    /// A partial batch is committed when the input is idle for this long.
    #[serde(with = "humantime_serde")]
    pub idle_flush: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_bytes: DEFAULT_BATCH_BYTES,
            idle_flush: DEFAULT_IDLE_FLUSH,
        }
    }
}

impl IngestConfig {
    /// Pipeline options with the configured batching.
    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            batch_bytes: self.batch_bytes,
            idle_flush: self.idle_flush,
            ..Default::default()
        }
    }
}

/// The config for the metrics server.
#[derive(Debug, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Set to true to disable the metrics server.
    pub disabled: bool,
    /// Optionally set a custom address to bind to.
    pub bind_addr: Option<SocketAddr>,
}

impl MetricsConfig {
    /// Disable the metrics server.
    pub fn disabled() -> Self {
        Self {
            disabled: true,
            bind_addr: None,
        }
    }
}

impl Config {
    /// Load the config from a file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Config> {
        let s = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("failed to read {}", path.as_ref().to_string_lossy()))?;
        let config: Config = toml::from_str(&s)?;
        Ok(config)
    }

    /// Get the data directory.
    pub fn data_dir() -> Result<PathBuf> {
        let dir = if let Some(val) = env::var_os("DAT_DATA_DIR") {
            PathBuf::from(val)
        } else {
            let path = dirs_next::data_dir().ok_or_else(|| {
                anyhow!("operating environment provides no directory for application data")
            })?;
            path.join("dat-store")
        };
        Ok(dir)
    }

    /// Get the path to the store database file.
    pub fn store_path(&self) -> Result<PathBuf> {
        match &self.store.path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::data_dir()?.join("store-1.db")),
        }
    }

    /// Get the address where the metrics server should be bound, if set.
    pub(crate) fn metrics_addr(&self) -> Option<SocketAddr> {
        match &self.metrics {
            None => Some(DEFAULT_METRICS_ADDR),
            Some(conf) => match conf.disabled {
                true => None,
                false => Some(conf.bind_addr.unwrap_or(DEFAULT_METRICS_ADDR)),
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http: Some(HttpConfig {
                port: 8080,
                bind_addr: None,
            }),
            store: StoreConfig::default(),
            ingest: IngestConfig::default(),
            metrics: None,
        }
    }
}
