//! Observability
//!
//! Service counters and latency histograms.

pub mod metrics;

pub use metrics::{MetricsSnapshot, ServiceMetrics};
