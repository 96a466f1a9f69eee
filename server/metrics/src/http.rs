//! Prometheus scrape endpoint.
//!
//! `install` registers the global recorder and shapes the histogram
//! buckets; `serve` exposes the rendered registry over a minimal HTTP/1
//! listener. The only route is `GET /metrics`; everything else gets a
//! plain status answer without touching the recorder.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::MetricsConfig;

pub struct MetricsServer {
    handle: PrometheusHandle,
    cfg: MetricsConfig,
}

impl MetricsServer {
    /// Install the global recorder. Call once from main init; a second
    /// install fails.
    pub fn install(cfg: MetricsConfig) -> Result<Self> {
        // Poll cycles are budgeted at 50 ms; resolve around that mark.
        let poll_histogram = format!("{}_relay_poll_duration_seconds", cfg.namespace);
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Full(poll_histogram),
                &[0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25],
            )
            .context("setting poll-duration buckets")?
            .install_recorder()
            .context("installing Prometheus recorder")?;

        Ok(Self { handle, cfg })
    }

    pub async fn serve(self) -> Result<()> {
        let addr: SocketAddr = self
            .cfg
            .listen
            .parse()
            .with_context(|| format!("bad metrics listen address {}", self.cfg.listen))?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding metrics endpoint on {addr}"))?;
        info!("metrics listening on http://{addr}/metrics");

        loop {
            // A failed accept is not fatal to the scrape endpoint.
            let (stream, remote) = match listener.accept().await {
                Ok(conn) => conn,
                Err(error) => {
                    warn!(%error, "metrics accept failed");
                    continue;
                }
            };

            let handle = self.handle.clone();
            tokio::spawn(async move {
                let service = hyper::service::service_fn(move |req: Request<Incoming>| {
                    let handle = handle.clone();
                    async move { respond(&req, &handle) }
                });
                if let Err(error) = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    warn!(%remote, %error, "metrics connection failed");
                }
            });
        }
    }
}

fn respond(req: &Request<Incoming>, handle: &PrometheusHandle) -> Result<Response<Full<Bytes>>> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain; version=0.0.4")
            .body(Full::new(Bytes::from(handle.render())))
            .context("building metrics response"),
        (_, "/metrics") => status_only(StatusCode::METHOD_NOT_ALLOWED),
        _ => status_only(StatusCode::NOT_FOUND),
    }
}

fn status_only(status: StatusCode) -> Result<Response<Full<Bytes>>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(status.canonical_reason().unwrap_or(""))))
        .context("building status response")
}
