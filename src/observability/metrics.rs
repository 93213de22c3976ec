// Service counters and latency histograms.
//
// Lock-free atomics only; every component holds an `Arc<ServiceMetrics>`
// handed out by the service, so tests never share state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::config::types::TerminalState;

/// Counter metric (monotonically increasing)
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge metric (can go up or down)
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Saturates at zero.
    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub struct HistogramBucket {
    pub le: f64, // upper bound in seconds
    pub count: AtomicU64,
}

/// Cumulative latency histogram
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<HistogramBucket>,
    sum: AtomicU64, // microseconds
    count: AtomicU64,
}

impl Histogram {
    pub fn new_latency() -> Self {
        let bounds = [
            0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
        ];
        Self {
            buckets: bounds
                .into_iter()
                .map(|le| HistogramBucket {
                    le,
                    count: AtomicU64::new(0),
                })
                .collect(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: Duration) {
        let seconds = value.as_secs_f64();
        self.sum
            .fetch_add(value.as_micros() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        for bucket in &self.buckets {
            if seconds <= bucket.le {
                bucket.count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn get_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn get_sum_micros(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    pub fn get_bucket_count(&self, le: f64) -> u64 {
        self.buckets
            .iter()
            .find(|b| (b.le - le).abs() < 0.0001)
            .map(|b| b.count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn export(&self, name: &str, help: &str, out: &mut String) {
        out.push_str(&format!("# HELP {} {}\n", name, help));
        out.push_str(&format!("# TYPE {} histogram\n", name));
        for bucket in &self.buckets {
            out.push_str(&format!(
                "{}_bucket{{le=\"{}\"}} {}\n",
                name,
                bucket.le,
                bucket.count.load(Ordering::Relaxed)
            ));
        }
        out.push_str(&format!(
            "{}_bucket{{le=\"+Inf\"}} {}\n",
            name,
            self.get_count()
        ));
        out.push_str(&format!(
            "{}_sum {}\n",
            name,
            self.get_sum_micros() as f64 / 1_000_000.0
        ));
        out.push_str(&format!("{}_count {}\n", name, self.get_count()));
    }
}

/// Counters for one service instance.
#[derive(Debug)]
pub struct ServiceMetrics {
    // Terminal states, indexed like TerminalState::ALL
    executions: [Counter; 6],
    pub rejected_requests: Counter,

    pub sandboxes_acquired: Counter,
    pub sandboxes_released: Counter,
    pub sandboxes_active: Gauge,
    pub acquire_timeouts: Counter,
    pub teardown_failures: Counter,

    pub watchdog_kills: Counter,
    pub straggler_kills: Counter,

    pub provision_latency: Histogram,
    pub execution_duration: Histogram,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            executions: Default::default(),
            rejected_requests: Counter::new(),
            sandboxes_acquired: Counter::new(),
            sandboxes_released: Counter::new(),
            sandboxes_active: Gauge::new(),
            acquire_timeouts: Counter::new(),
            teardown_failures: Counter::new(),
            watchdog_kills: Counter::new(),
            straggler_kills: Counter::new(),
            provision_latency: Histogram::new_latency(),
            execution_duration: Histogram::new_latency(),
        }
    }

    fn slot(state: TerminalState) -> usize {
        TerminalState::ALL
            .iter()
            .position(|s| *s == state)
            .unwrap_or(TerminalState::ALL.len() - 1)
    }

    pub fn record_execution(&self, state: TerminalState, elapsed: Duration) {
        self.executions[Self::slot(state)].inc();
        self.execution_duration.observe(elapsed);
    }

    pub fn executions(&self, state: TerminalState) -> u64 {
        self.executions[Self::slot(state)].get()
    }

    pub fn executions_total(&self) -> u64 {
        self.executions.iter().map(Counter::get).sum()
    }

    pub fn record_acquire(&self, latency: Duration) {
        self.sandboxes_acquired.inc();
        self.sandboxes_active.inc();
        self.provision_latency.observe(latency);
    }

    pub fn record_release(&self, clean: bool) {
        self.sandboxes_released.inc();
        self.sandboxes_active.dec();
        if !clean {
            self.teardown_failures.inc();
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            executions_total: self.executions_total(),
            success: self.executions(TerminalState::Success),
            compile_error: self.executions(TerminalState::CompileError),
            runtime_error: self.executions(TerminalState::RuntimeError),
            timeout: self.executions(TerminalState::Timeout),
            resource_exceeded: self.executions(TerminalState::ResourceExceeded),
            internal_error: self.executions(TerminalState::InternalError),
            rejected_requests: self.rejected_requests.get(),
            sandboxes_acquired: self.sandboxes_acquired.get(),
            sandboxes_released: self.sandboxes_released.get(),
            sandboxes_active: self.sandboxes_active.get(),
            acquire_timeouts: self.acquire_timeouts.get(),
            teardown_failures: self.teardown_failures.get(),
        }
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP coderun_executions_total Finished submissions by terminal state\n");
        output.push_str("# TYPE coderun_executions_total counter\n");
        for state in TerminalState::ALL {
            output.push_str(&format!(
                "coderun_executions_total{{state=\"{}\"}} {}\n",
                state,
                self.executions(state)
            ));
        }

        output.push_str("# HELP coderun_rejected_requests_total Requests refused before provisioning\n");
        output.push_str("# TYPE coderun_rejected_requests_total counter\n");
        output.push_str(&format!(
            "coderun_rejected_requests_total {}\n",
            self.rejected_requests.get()
        ));

        output.push_str("# HELP coderun_sandboxes_total Sandbox lifecycle events\n");
        output.push_str("# TYPE coderun_sandboxes_total counter\n");
        output.push_str(&format!(
            "coderun_sandboxes_total{{event=\"acquired\"}} {}\n",
            self.sandboxes_acquired.get()
        ));
        output.push_str(&format!(
            "coderun_sandboxes_total{{event=\"released\"}} {}\n",
            self.sandboxes_released.get()
        ));
        output.push_str(&format!(
            "coderun_sandboxes_total{{event=\"acquire_timeout\"}} {}\n",
            self.acquire_timeouts.get()
        ));
        output.push_str(&format!(
            "coderun_sandboxes_total{{event=\"teardown_failure\"}} {}\n",
            self.teardown_failures.get()
        ));

        output.push_str("# HELP coderun_sandboxes_active Sandboxes currently provisioned\n");
        output.push_str("# TYPE coderun_sandboxes_active gauge\n");
        output.push_str(&format!(
            "coderun_sandboxes_active {}\n",
            self.sandboxes_active.get()
        ));

        output.push_str("# HELP coderun_kills_total Forced terminations\n");
        output.push_str("# TYPE coderun_kills_total counter\n");
        output.push_str(&format!(
            "coderun_kills_total{{reason=\"watchdog\"}} {}\n",
            self.watchdog_kills.get()
        ));
        output.push_str(&format!(
            "coderun_kills_total{{reason=\"straggler\"}} {}\n",
            self.straggler_kills.get()
        ));

        self.provision_latency.export(
            "coderun_provision_latency_seconds",
            "Time to acquire a sandbox",
            &mut output,
        );
        self.execution_duration.export(
            "coderun_execution_duration_seconds",
            "Wall time per submission",
            &mut output,
        );
        output
    }
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Plain copy of the counters, for JSON output.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub executions_total: u64,
    pub success: u64,
    pub compile_error: u64,
    pub runtime_error: u64,
    pub timeout: u64,
    pub resource_exceeded: u64,
    pub internal_error: u64,
    pub rejected_requests: u64,
    pub sandboxes_acquired: u64,
    pub sandboxes_released: u64,
    pub sandboxes_active: u64,
    pub acquire_timeouts: u64,
    pub teardown_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_and_gauge() {
        let counter = Counter::new();
        counter.inc();
        counter.add(5);
        assert_eq!(counter.get(), 6);

        let gauge = Gauge::new();
        gauge.set(2);
        gauge.inc();
        gauge.dec();
        gauge.dec();
        gauge.dec();
        gauge.dec();
        assert_eq!(gauge.get(), 0);
    }

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let histogram = Histogram::new_latency();
        histogram.observe(Duration::from_millis(50));
        histogram.observe(Duration::from_millis(150));
        histogram.observe(Duration::from_millis(500));

        assert_eq!(histogram.get_count(), 3);
        assert_eq!(histogram.get_bucket_count(0.1), 1);
        assert_eq!(histogram.get_bucket_count(0.25), 2);
        assert_eq!(histogram.get_bucket_count(0.5), 3);
    }

    #[test]
    fn test_sandbox_lifecycle_counters() {
        let metrics = ServiceMetrics::new();
        metrics.record_acquire(Duration::from_millis(3));
        metrics.record_acquire(Duration::from_millis(3));
        metrics.record_release(true);
        metrics.record_release(false);

        let snap = metrics.snapshot();
        assert_eq!(snap.sandboxes_acquired, 2);
        assert_eq!(snap.sandboxes_released, 2);
        assert_eq!(snap.sandboxes_active, 0);
        assert_eq!(snap.teardown_failures, 1);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = ServiceMetrics::new();
        metrics.record_execution(TerminalState::Success, Duration::from_millis(20));
        metrics.record_execution(TerminalState::Timeout, Duration::from_secs(2));

        let output = metrics.export_prometheus();
        assert!(output.contains("coderun_executions_total{state=\"Success\"} 1"));
        assert!(output.contains("coderun_executions_total{state=\"Timeout\"} 1"));
        assert!(output.contains("coderun_execution_duration_seconds_count 2"));
        assert_eq!(metrics.executions_total(), 2);
    }
}
