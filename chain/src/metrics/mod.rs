//! Prometheus-backed metrics and HTTP exporter.

pub mod prometheus;

pub use prometheus::{MetricsRegistry, NodeMetrics, run_prometheus_http_server};
