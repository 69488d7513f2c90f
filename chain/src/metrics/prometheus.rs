//! Prometheus-backed metrics and HTTP exporter.
//!
//! This module defines a [`MetricsRegistry`] that owns a Prometheus
//! registry and a set of strongly-typed node metrics, and an async HTTP
//! exporter that serves `/metrics` using `hyper`.

use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use http_body_util::Full;
use hyper::{
    Method, Request, Response, StatusCode, body::Incoming, header, server::conn::http1,
    service::service_fn,
};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::error;

use prometheus::{
    self, Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};

/// Node-level Prometheus metrics.
///
/// These are registered into a [`Registry`] and updated from the pump
/// loop, the queues, and the hard-apply path.
#[derive(Clone)]
pub struct NodeMetrics {
    /// Transactions executed by the processing queue.
    pub txs_processed: IntCounter,
    /// Blocks minted (extends and inserts).
    pub blocks_minted: IntCounter,
    /// Blocks rewritten during reorgs.
    pub block_reorgs: IntCounter,
    /// Full reprocessing runs triggered by out-of-order arrivals.
    pub reprocess_runs: IntCounter,
    /// Wall time of one transaction execution, in seconds.
    pub processing_seconds: Histogram,
    /// Current depth of the processing queue.
    pub processing_queue_depth: IntGauge,
    /// Current depth of the validation queue.
    pub validation_queue_depth: IntGauge,
}

impl NodeMetrics {
    /// Registers node metrics into the given `Registry`.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let txs_processed = IntCounter::with_opts(Opts::new(
            "node_txs_processed",
            "Total number of transactions executed by the processing queue",
        ))?;
        registry.register(Box::new(txs_processed.clone()))?;

        let blocks_minted = IntCounter::with_opts(Opts::new(
            "node_blocks_minted",
            "Total number of blocks minted",
        ))?;
        registry.register(Box::new(blocks_minted.clone()))?;

        let block_reorgs = IntCounter::with_opts(Opts::new(
            "node_block_reorgs",
            "Total number of blocks rewritten during reorgs",
        ))?;
        registry.register(Box::new(block_reorgs.clone()))?;

        let reprocess_runs = IntCounter::with_opts(Opts::new(
            "node_reprocess_runs",
            "Total number of reprocessing runs triggered by out-of-order arrivals",
        ))?;
        registry.register(Box::new(reprocess_runs.clone()))?;

        let processing_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "node_processing_seconds",
                "Time to execute one transaction in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
            ]),
        )?;
        registry.register(Box::new(processing_seconds.clone()))?;

        let processing_queue_depth = IntGauge::with_opts(Opts::new(
            "node_processing_queue_depth",
            "Current number of transactions waiting in the processing queue",
        ))?;
        registry.register(Box::new(processing_queue_depth.clone()))?;

        let validation_queue_depth = IntGauge::with_opts(Opts::new(
            "node_validation_queue_depth",
            "Current number of HLCs waiting in the validation queue",
        ))?;
        registry.register(Box::new(validation_queue_depth.clone()))?;

        Ok(Self {
            txs_processed,
            blocks_minted,
            block_reorgs,
            reprocess_runs,
            processing_seconds,
            processing_queue_depth,
            validation_queue_depth,
        })
    }
}

/// Wrapper around a Prometheus registry and the node metrics.
///
/// This is the main handle you pass around in the node. It can be wrapped
/// in an [`Arc`] and shared across tasks.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    pub node: NodeMetrics,
}

impl MetricsRegistry {
    /// Creates a new `MetricsRegistry` with a fresh underlying `Registry`
    /// and registers the node metrics.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("chain".to_string()), None)?;
        let node = NodeMetrics::register(&registry)?;
        Ok(Self { registry, node })
    }

    /// Encodes all metrics in this registry into the Prometheus text
    /// format.
    pub fn gather_text(&self) -> String {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            error!("failed to encode Prometheus metrics: {e}");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Runs an HTTP server that exposes Prometheus metrics.
///
/// The server listens on `addr` and serves `GET /metrics` with the
/// Prometheus text exposition format. All other paths return 404.
pub async fn run_prometheus_http_server(
    metrics: Arc<MetricsRegistry>,
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let svc = service_fn(move |req| {
                let metrics = metrics.clone();
                handle_request(req, metrics)
            });

            if let Err(err) = http1::Builder::new().serve_connection(io, svc).await {
                error!("prometheus HTTP server error: {err}");
            }
        });
    }
}

async fn handle_request(
    req: Request<Incoming>,
    metrics: Arc<MetricsRegistry>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let body = metrics.gather_text();
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
                .body(Full::new(Bytes::from(body)))
                .unwrap())
        }
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("not found")))
            .unwrap()),
    }
}
