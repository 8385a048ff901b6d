//! The main server which combines the store and the HTTP server.

use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use iroh_metrics::{service::start_metrics_server, Registry};
use tracing::info;

use crate::{
    config::Config,
    http::HttpServer,
    state::AppState,
    store::Store,
};

/// Spawn the server and run until the `Ctrl-C` signal is received, then shutdown.
pub async fn run_with_config_until_ctrl_c(config: Config) -> Result<()> {
    let store = Store::persistent(config.store_path()?)?;
    let server = Server::spawn(config, store).await?;
    tokio::signal::ctrl_c().await?;
    info!("shutdown");
    server.shutdown().await?;
    Ok(())
}

/// The dat-store server.
#[derive(Debug)]
pub struct Server {
    store: Store,
    http_server: HttpServer,
    metrics_task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl Server {
    /// Spawn the server.
    ///
    /// This will spawn several background tasks:
    /// * A HTTP server task
    /// * A metrics server task, if not disabled in `config.metrics`
    pub async fn spawn(config: Config, store: Store) -> Result<Self> {
        let state = AppState {
            store: store.clone(),
        };

        let metrics_addr = config.metrics_addr();
        let metrics = store.metrics().clone();
        let metrics_task = tokio::task::spawn(async move {
            if let Some(addr) = metrics_addr {
                let mut registry = Registry::default();
                registry.register(metrics);
                start_metrics_server(addr, Arc::new(RwLock::new(registry))).await?;
            }
            Ok(())
        });
        let http_config = config.http.context("http config is required")?;
        let http_server = HttpServer::spawn(http_config, state).await?;
        Ok(Self {
            store,
            http_server,
            metrics_task,
        })
    }

    /// The store served by this server.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// The bound address of the HTTP server.
    pub fn http_addr(&self) -> std::net::SocketAddr {
        self.http_server.http_addr()
    }

    /// Close the store, which ends live feeds, and wait for all tasks to complete.
    pub async fn shutdown(self) -> Result<()> {
        self.metrics_task.abort();
        self.store.close();
        self.http_server.shutdown().await
    }

    /// Wait for all tasks to complete.
    ///
    /// This will run forever unless the HTTP server fails.
    pub async fn run_until_error(self) -> Result<()> {
        self.http_server.run_until_done().await?;
        self.metrics_task.abort();
        Ok(())
    }

    /// Spawn a server on localhost with an in-memory store, suitable for testing.
    ///
    /// It returns the server handle and the [`Url`](url::Url) of the HTTP server.
    #[cfg(test)]
    pub async fn spawn_for_tests() -> Result<(Self, url::Url)> {
        Self::spawn_for_tests_with_store(Store::in_memory()?).await
    }

    /// Like [`Self::spawn_for_tests`], serving the given store.
    #[cfg(test)]
    pub async fn spawn_for_tests_with_store(store: Store) -> Result<(Self, url::Url)> {
        use crate::{config::MetricsConfig, http::HttpConfig};
        use std::net::{IpAddr, Ipv4Addr};

        let mut config = Config::default();
        config.http = Some(HttpConfig {
            port: 0,
            bind_addr: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        });
        config.metrics = Some(MetricsConfig::disabled());

        let server = Self::spawn(config, store).await?;
        let http_url = format!("http://{}", server.http_addr()).parse()?;
        Ok((server, http_url))
    }
}
