use crate::error::MetricsServerError;
use crate::metrics::MetricsRegistry;
use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, HeaderValue},
    response::IntoResponse,
    routing::get,
    Router,
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub const METRICS_PATH: &str = "/metrics";
const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

pub fn build_router(registry: Arc<MetricsRegistry>) -> Router {
    Router::new()
        .route(METRICS_PATH, get(scrape))
        .with_state(registry)
}

async fn scrape(State(registry): State<Arc<MetricsRegistry>>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, HeaderValue::from_static(EXPOSITION_CONTENT_TYPE))],
        registry.render(),
    )
}

/// A running endpoint. Dropping it without `stop` leaves the server running
/// until the runtime shuts down.
#[derive(Debug)]
pub struct MetricsServer {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl MetricsServer {
    pub async fn bind(
        bind_address: &str,
        port: u16,
        registry: Arc<MetricsRegistry>,
    ) -> Result<Self, MetricsServerError> {
        let ip: IpAddr = bind_address
            .trim()
            .parse()
            .map_err(|source| MetricsServerError::InvalidAddr {
                address: bind_address.to_string(),
                source,
            })?;
        let addr = SocketAddr::new(ip, port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| MetricsServerError::Bind {
                address: addr.to_string(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| MetricsServerError::Bind {
                address: addr.to_string(),
                source,
            })?;

        let (tx, rx) = oneshot::channel::<()>();
        let app = build_router(registry);
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await;
            if let Err(err) = result {
                warn!(error = %err, "metrics endpoint stopped with error");
            }
        });
        info!(%local_addr, path = METRICS_PATH, "metrics endpoint listening");
        Ok(Self {
            local_addr,
            shutdown: Some(tx),
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(err) = self.task.await {
            warn!(error = %err, "metrics endpoint task failed");
        }
    }
}

/// Start the endpoint if a port is configured. Errors are logged, not
/// returned.
pub async fn spawn(
    bind_address: &str,
    port: Option<u16>,
    registry: Arc<MetricsRegistry>,
) -> Option<MetricsServer> {
    let port = port?;
    match MetricsServer::bind(bind_address, port, registry).await {
        Ok(server) => Some(server),
        Err(err) => {
            warn!(error = %err, "metrics endpoint unavailable, continuing without it");
            None
        }
    }
}
