//! Prometheus metrics collection for eptd

use prometheus::{Counter, Gauge, Histogram, HistogramOpts, Opts, Registry};
use std::sync::Arc;

/// Per-process metrics collector
#[derive(Clone)]
pub struct MetricsCollector {
    // Counters
    pub events_received_total: Counter,
    pub events_accepted_total: Counter,
    pub events_rejected_total: Counter,
    pub analyses_total: Counter,
    pub analysis_failures_total: Counter,
    pub moves_total: Counter,
    pub stale_total: Counter,
    pub offsubnet_total: Counter,
    pub rapid_total: Counter,
    pub notify_jobs_total: Counter,
    pub notify_failures_total: Counter,
    pub decode_failures_total: Counter,
    pub store_errors_total: Counter,
    pub dispatch_errors_total: Counter,

    // Gauges
    pub queue_depth: Gauge,
    pub active_fabrics: Gauge,

    // Histograms
    pub event_latency_seconds: Histogram,

    // Registry for export
    pub registry: Arc<Registry>,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<Counter, prometheus::Error> {
    let counter = Counter::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<Gauge, prometheus::Error> {
    let gauge = Gauge::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let event_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "eptd_event_latency_seconds",
                "Work item processing latency in seconds",
            )
            .buckets(vec![
                0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
            ]),
        )?;
        registry.register(Box::new(event_latency_seconds.clone()))?;

        Ok(Self {
            events_received_total: counter(
                &registry,
                "eptd_events_received_total",
                "Total number of endpoint events received",
            )?,
            events_accepted_total: counter(
                &registry,
                "eptd_events_accepted_total",
                "Total number of endpoint events accepted into history",
            )?,
            events_rejected_total: counter(
                &registry,
                "eptd_events_rejected_total",
                "Total number of endpoint events rejected as stale or duplicate",
            )?,
            analyses_total: counter(
                &registry,
                "eptd_analyses_total",
                "Total number of endpoint analyses run",
            )?,
            analysis_failures_total: counter(
                &registry,
                "eptd_analysis_failures_total",
                "Total number of analyses aborted on lookup failure",
            )?,
            moves_total: counter(&registry, "eptd_moves_total", "Total number of moves detected")?,
            stale_total: counter(
                &registry,
                "eptd_stale_total",
                "Total number of stale learns detected",
            )?,
            offsubnet_total: counter(
                &registry,
                "eptd_offsubnet_total",
                "Total number of off-subnet learns detected",
            )?,
            rapid_total: counter(
                &registry,
                "eptd_rapid_total",
                "Total number of endpoints flagged rapid",
            )?,
            notify_jobs_total: counter(
                &registry,
                "eptd_notify_jobs_total",
                "Total number of notify jobs submitted",
            )?,
            notify_failures_total: counter(
                &registry,
                "eptd_notify_failures_total",
                "Total number of notify jobs lost after retries",
            )?,
            decode_failures_total: counter(
                &registry,
                "eptd_decode_failures_total",
                "Total number of messages dropped on decode failure",
            )?,
            store_errors_total: counter(
                &registry,
                "eptd_store_errors_total",
                "Total number of work items failed on store errors",
            )?,
            dispatch_errors_total: counter(
                &registry,
                "eptd_dispatch_errors_total",
                "Total number of submissions the distributor failed to forward",
            )?,
            queue_depth: gauge(&registry, "eptd_queue_depth", "Current worker queue depth")?,
            active_fabrics: gauge(
                &registry,
                "eptd_active_fabrics",
                "Number of fabrics with a loaded history engine",
            )?,
            event_latency_seconds,
            registry: Arc::new(registry),
        })
    }

    /// Record a received event and whether it was accepted
    pub fn record_event(&self, accepted: bool) {
        self.events_received_total.inc();
        if accepted {
            self.events_accepted_total.inc();
        } else {
            self.events_rejected_total.inc();
        }
    }

    /// Record event processing latency
    pub fn observe_event_latency(&self, duration_secs: f64) {
        self.event_latency_seconds.observe(duration_secs);
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as f64);
    }

    pub fn set_active_fabrics(&self, count: usize) {
        self.active_fabrics.set(count as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_collector_creation() {
        let collector = MetricsCollector::new().unwrap();
        assert_eq!(collector.events_received_total.get(), 0.0);
        assert_eq!(collector.moves_total.get(), 0.0);
        assert_eq!(collector.registry.gather().len(), 17);
    }

    #[test]
    fn test_record_event() {
        let collector = MetricsCollector::new().unwrap();
        collector.record_event(true);
        collector.record_event(false);
        collector.record_event(true);
        assert_eq!(collector.events_received_total.get(), 3.0);
        assert_eq!(collector.events_accepted_total.get(), 2.0);
        assert_eq!(collector.events_rejected_total.get(), 1.0);
    }

    #[test]
    fn test_gauges() {
        let collector = MetricsCollector::new().unwrap();
        collector.set_queue_depth(12);
        collector.set_active_fabrics(2);
        assert_eq!(collector.queue_depth.get(), 12.0);
        assert_eq!(collector.active_fabrics.get(), 2.0);
    }
}
