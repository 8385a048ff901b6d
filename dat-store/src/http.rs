//! HTTP server part of dat-store

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Instant,
};

use anyhow::Result;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::Method,
    middleware::{self, Next},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{self, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, span, warn, Level};

mod error;
mod routes;

pub use self::error::{AppError, AppResult};
use crate::state::AppState;

/// Config for the HTTP server
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HttpConfig {
    /// Port to bind to
    pub port: u16,
    /// Optionally set a custom bind address (will use 0.0.0.0 if unset)
    pub bind_addr: Option<IpAddr>,
}

/// The HTTP server part of dat-store
#[derive(Debug)]
pub struct HttpServer {
    tasks: JoinSet<std::io::Result<()>>,
    http_addr: SocketAddr,
    cancel: CancellationToken,
}

impl HttpServer {
    /// Spawn the server
    pub async fn spawn(config: HttpConfig, state: AppState) -> Result<HttpServer> {
        let app = create_app(state);
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();

        let bind_addr = SocketAddr::new(
            config.bind_addr.unwrap_or(Ipv4Addr::UNSPECIFIED.into()),
            config.port,
        );
        let listener = TcpListener::bind(bind_addr).await?;
        let http_addr = listener.local_addr()?;
        let serve = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(cancel.clone().cancelled_owned());
        info!("HTTP server listening on {http_addr}");
        tasks.spawn(async move { serve.await });

        Ok(HttpServer {
            tasks,
            http_addr,
            cancel,
        })
    }

    /// Get the bound address of the HTTP socket.
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// Stop accepting connections and wait for open requests to complete.
    ///
    /// Live feeds only complete once the store is closed.
    pub async fn shutdown(self) -> Result<()> {
        self.cancel.cancel();
        self.run_until_done().await
    }

    /// Wait for all tasks to complete.
    ///
    /// Runs forever unless tasks fail.
    pub async fn run_until_done(mut self) -> Result<()> {
        let mut final_res: anyhow::Result<()> = Ok(());
        while let Some(res) = self.tasks.join_next().await {
            match res {
                Ok(Ok(())) => {}
                Err(err) if err.is_cancelled() => {}
                Ok(Err(err)) => {
                    warn!(?err, "task failed");
                    final_res = Err(anyhow::Error::from(err));
                }
                Err(err) => {
                    warn!(?err, "task panicked");
                    final_res = Err(err.into());
                }
            }
        }
        final_res
    }
}

pub(crate) fn create_app(state: AppState) -> Router {
    // configure cors middleware
    let cors = CorsLayer::new()
        // allow `GET` and `POST` when accessing the resource
        .allow_methods([Method::GET, Method::POST])
        // allow requests from any origin
        .allow_origin(cors::Any);

    // configure tracing middleware
    let trace = TraceLayer::new_for_http().make_span_with(|request: &http::Request<_>| {
        let src = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|conn_info| conn_info.0.to_string());
        span!(
            Level::DEBUG,
            "http_request",
            method = ?request.method(),
            uri = ?request.uri(),
            src = ?src,
        )
    });

    // configure routes
    let router = Router::new()
        .route("/_changes", get(routes::changes))
        .route("/_snapshot", get(routes::snapshot))
        .route("/_columns", get(routes::columns))
        .route("/_backup", get(routes::backup))
        .route("/_bulk", post(routes::bulk))
        .route("/rows/{id}", get(routes::get_row))
        .route("/healthcheck", get(|| async { "OK" }))
        .route("/", get(|| async { "dat-store" }))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            metrics_middleware,
        ))
        .with_state(state);

    // configure app
    router.layer(cors).layer(trace)
}

/// Record request metrics.
async fn metrics_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> impl IntoResponse {
    let start = Instant::now();
    let response = next.run(req).await;
    let latency = start.elapsed().as_millis();
    let status = response.status();
    let metrics = state.store.metrics();
    metrics.http_requests_duration_ms.inc_by(latency as u64);
    metrics.http_requests.inc();
    if status.is_success() {
        metrics.http_requests_success.inc();
    } else {
        metrics.http_requests_error.inc();
    }
    response
}
