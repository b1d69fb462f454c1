//! HTTP endpoint serving `/metrics`.

use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use super::Metrics;
use crate::error::MetricsError;

/// Serves the metrics registry over HTTP/1.
pub struct MetricsServer {
    metrics: Arc<Metrics>,
    listener: TcpListener,
}

impl MetricsServer {
    /// Binds the listener on all interfaces. Port 0 picks a free port.
    pub async fn bind(metrics: Arc<Metrics>, port: u16) -> Result<Self, MetricsError> {
        let addr: SocketAddr = ([0, 0, 0, 0], port).into();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| MetricsError::PrometheusFailed(e.to_string()))?;

        Ok(Self { metrics, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, MetricsError> {
        self.listener
            .local_addr()
            .map_err(|e| MetricsError::PrometheusFailed(e.to_string()))
    }

    /// Accepts connections until `shutdown` flips to true.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<(), MetricsError> {
        info!(addr = ?self.listener.local_addr().ok(), "Starting Prometheus metrics server");

        loop {
            let (stream, _) = tokio::select! {
                accepted = self.listener.accept() => {
                    accepted.map_err(|e| MetricsError::PrometheusFailed(e.to_string()))?
                }
                _ = shutdown.wait_for(|stop| *stop) => {
                    info!("Metrics server stopped");
                    return Ok(());
                }
            };

            let io = TokioIo::new(stream);
            let metrics = self.metrics.clone();

            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| {
                    let metrics = metrics.clone();
                    async move { Ok::<_, hyper::Error>(respond(&metrics, req.uri().path())) }
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    error!(error = %e, "Error serving metrics connection");
                }
            });
        }
    }
}

fn respond(metrics: &Metrics, path: &str) -> Response<Full<Bytes>> {
    let (status, body) = match path {
        "/metrics" => match metrics.gather() {
            Ok(text) => (StatusCode::OK, text),
            Err(e) => {
                error!(error = %e, "Failed to render metrics");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        },
        _ => (StatusCode::NOT_FOUND, "Not Found".to_string()),
    };

    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
}
