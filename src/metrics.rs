//! Prometheus-compatible metrics for the Caliper engine.
//!
//! One global registry covers the bus, the session store, the external
//! services, and the turn pipeline. Everything is observed at the point
//! where the work happens; this module only declares and registers.

use prometheus::{self, Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use serde::{Deserialize, Serialize};
use std::time::Instant;

use parking_lot::RwLock;

/// Global metrics instance.
static METRICS: std::sync::OnceLock<std::sync::Arc<Metrics>> = std::sync::OnceLock::new();

/// Get or initialize the global metrics instance.
pub fn get_metrics() -> std::sync::Arc<Metrics> {
    METRICS
        .get_or_init(|| std::sync::Arc::new(Metrics::new()))
        .clone()
}

/// Default histogram buckets for latency tracking (in seconds).
/// Covers from 1ms to 10s with reasonable granularity.
fn default_latency_buckets() -> Vec<f64> {
    vec![
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ]
}

/// All metrics for the engine.
pub struct Metrics {
    /// Prometheus registry for all metrics.
    pub registry: Registry,

    // =========================================================================
    // Counters
    // =========================================================================
    /// Total envelopes published on the bus.
    pub messages_published_total: IntCounter,
    /// Total handler errors caught at the bus boundary.
    pub handler_errors_total: IntCounter,
    /// Total transcript lines the mirror failed to persist.
    pub mirror_dropped_total: IntCounter,
    /// Total source metadata cache hits.
    pub cache_hits_total: IntCounter,
    /// Total source metadata cache misses.
    pub cache_misses_total: IntCounter,
    /// Total requests no data source could serve.
    pub plan_failures_total: IntCounter,
    /// Total critical anomaly alerts broadcast.
    pub anomaly_alerts_total: IntCounter,
    /// Total conversation turns started.
    pub turns_total: IntCounter,
    /// Total turns answered with a clarification question.
    pub clarifications_total: IntCounter,
    /// Total branches that missed their deadline or failed.
    pub degraded_branches_total: IntCounter,

    // =========================================================================
    // Gauges
    // =========================================================================
    /// Current number of live sessions.
    pub active_sessions: IntGauge,
    /// Uptime in seconds.
    pub uptime_seconds: IntGauge,

    // =========================================================================
    // Histograms (durations in seconds)
    // =========================================================================
    /// Data query round-trip duration in seconds.
    pub query_duration_seconds: Histogram,
    /// Language-model call duration in seconds.
    pub inference_duration_seconds: Histogram,
    /// Whole-turn duration in seconds.
    pub turn_duration_seconds: Histogram,

    /// Server start time.
    start_time: RwLock<Instant>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create a new metrics instance with all metrics registered.
    pub fn new() -> Self {
        let registry = Registry::new();

        // Counters
        let messages_published_total = IntCounter::new(
            "caliper_messages_published_total",
            "Total envelopes published on the bus",
        )
        .expect("failed to create counter");

        let handler_errors_total = IntCounter::new(
            "caliper_handler_errors_total",
            "Total handler errors caught at the bus boundary",
        )
        .expect("failed to create counter");

        let mirror_dropped_total = IntCounter::new(
            "caliper_mirror_dropped_total",
            "Total transcript lines the mirror failed to persist",
        )
        .expect("failed to create counter");

        let cache_hits_total = IntCounter::new(
            "caliper_cache_hits_total",
            "Total source metadata cache hits",
        )
        .expect("failed to create counter");

        let cache_misses_total = IntCounter::new(
            "caliper_cache_misses_total",
            "Total source metadata cache misses",
        )
        .expect("failed to create counter");

        let plan_failures_total = IntCounter::new(
            "caliper_plan_failures_total",
            "Total requests no data source could serve",
        )
        .expect("failed to create counter");

        let anomaly_alerts_total = IntCounter::new(
            "caliper_anomaly_alerts_total",
            "Total critical anomaly alerts broadcast",
        )
        .expect("failed to create counter");

        let turns_total = IntCounter::new(
            "caliper_turns_total",
            "Total conversation turns started",
        )
        .expect("failed to create counter");

        let clarifications_total = IntCounter::new(
            "caliper_clarifications_total",
            "Total turns answered with a clarification question",
        )
        .expect("failed to create counter");

        let degraded_branches_total = IntCounter::new(
            "caliper_degraded_branches_total",
            "Total branches that missed their deadline or failed",
        )
        .expect("failed to create counter");

        // Gauges
        let active_sessions =
            IntGauge::new("caliper_active_sessions", "Current number of live sessions")
                .expect("failed to create gauge");

        let uptime_seconds = IntGauge::new("caliper_uptime_seconds", "Server uptime in seconds")
            .expect("failed to create gauge");

        // Histograms with latency buckets (in seconds)
        let query_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "caliper_query_duration_seconds",
                "Data query round-trip duration in seconds",
            )
            .buckets(default_latency_buckets()),
        )
        .expect("failed to create histogram");

        let inference_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "caliper_inference_duration_seconds",
                "Language-model call duration in seconds",
            )
            .buckets(default_latency_buckets()),
        )
        .expect("failed to create histogram");

        let turn_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "caliper_turn_duration_seconds",
                "Whole-turn duration in seconds",
            )
            .buckets(default_latency_buckets()),
        )
        .expect("failed to create histogram");

        // Register all metrics
        registry
            .register(Box::new(messages_published_total.clone()))
            .expect("failed to register metric");
        registry
            .register(Box::new(handler_errors_total.clone()))
            .expect("failed to register metric");
        registry
            .register(Box::new(mirror_dropped_total.clone()))
            .expect("failed to register metric");
        registry
            .register(Box::new(cache_hits_total.clone()))
            .expect("failed to register metric");
        registry
            .register(Box::new(cache_misses_total.clone()))
            .expect("failed to register metric");
        registry
            .register(Box::new(plan_failures_total.clone()))
            .expect("failed to register metric");
        registry
            .register(Box::new(anomaly_alerts_total.clone()))
            .expect("failed to register metric");
        registry
            .register(Box::new(turns_total.clone()))
            .expect("failed to register metric");
        registry
            .register(Box::new(clarifications_total.clone()))
            .expect("failed to register metric");
        registry
            .register(Box::new(degraded_branches_total.clone()))
            .expect("failed to register metric");
        registry
            .register(Box::new(active_sessions.clone()))
            .expect("failed to register metric");
        registry
            .register(Box::new(uptime_seconds.clone()))
            .expect("failed to register metric");
        registry
            .register(Box::new(query_duration_seconds.clone()))
            .expect("failed to register metric");
        registry
            .register(Box::new(inference_duration_seconds.clone()))
            .expect("failed to register metric");
        registry
            .register(Box::new(turn_duration_seconds.clone()))
            .expect("failed to register metric");

        Self {
            registry,
            // Counters
            messages_published_total,
            handler_errors_total,
            mirror_dropped_total,
            cache_hits_total,
            cache_misses_total,
            plan_failures_total,
            anomaly_alerts_total,
            turns_total,
            clarifications_total,
            degraded_branches_total,
            // Gauges
            active_sessions,
            uptime_seconds,
            // Histograms
            query_duration_seconds,
            inference_duration_seconds,
            turn_duration_seconds,
            // Internal state
            start_time: RwLock::new(Instant::now()),
        }
    }

    /// Update the uptime gauge.
    pub fn update_uptime(&self) {
        let uptime = self.start_time.read().elapsed();
        self.uptime_seconds.set(uptime.as_secs() as i64);
    }

    /// Export metrics in Prometheus text format.
    pub fn export_prometheus(&self) -> String {
        use prometheus::Encoder;
        self.update_uptime();

        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Health status for the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: HealthState,
    pub version: String,
    pub uptime_seconds: u64,
    pub checks: Vec<HealthCheck>,
}

/// Health state enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthState {
    /// Convert to HTTP status code.
    pub fn to_status_code(self) -> u16 {
        match self {
            HealthState::Healthy => 200,
            HealthState::Degraded => 200, // Still operational
            HealthState::Unhealthy => 503,
        }
    }
}

/// Individual health check result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: HealthState,
    pub message: Option<String>,
    pub duration_ms: Option<u64>,
}

impl HealthCheck {
    /// Create a healthy check.
    pub fn healthy(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthState::Healthy,
            message: None,
            duration_ms: None,
        }
    }

    /// Create a healthy check with duration.
    pub fn healthy_with_duration(name: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            name: name.into(),
            status: HealthState::Healthy,
            message: None,
            duration_ms: Some(duration_ms),
        }
    }

    /// Create a degraded check.
    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthState::Degraded,
            message: Some(message.into()),
            duration_ms: None,
        }
    }

    /// Create an unhealthy check.
    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthState::Unhealthy,
            message: Some(message.into()),
            duration_ms: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = IntCounter::new("test_counter", "test").unwrap();
        assert_eq!(counter.get(), 0);
        counter.inc();
        assert_eq!(counter.get(), 1);
        counter.inc_by(5);
        assert_eq!(counter.get(), 6);
    }

    #[test]
    fn test_gauge() {
        let gauge = IntGauge::new("test_gauge", "test").unwrap();
        assert_eq!(gauge.get(), 0);
        gauge.set(10);
        assert_eq!(gauge.get(), 10);
        gauge.inc();
        assert_eq!(gauge.get(), 11);
        gauge.dec();
        assert_eq!(gauge.get(), 10);
    }

    #[test]
    fn test_histogram() {
        let hist = Histogram::with_opts(
            HistogramOpts::new("test_histogram", "test").buckets(default_latency_buckets()),
        )
        .unwrap();
        hist.observe(0.005); // 5ms
        hist.observe(0.025); // 25ms
        hist.observe(0.1); // 100ms

        assert_eq!(hist.get_sample_count(), 3);
        assert!((hist.get_sample_sum() - 0.13).abs() < 0.001);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = Metrics::new();
        metrics.turns_total.inc_by(7);
        metrics.messages_published_total.inc_by(50);
        metrics.active_sessions.set(3);

        let output = metrics.export_prometheus();
        assert!(output.contains("caliper_turns_total 7"));
        assert!(output.contains("caliper_messages_published_total 50"));
        assert!(output.contains("caliper_active_sessions 3"));

        // Durations are tracked in seconds, never milliseconds.
        assert!(output.contains("caliper_query_duration_seconds"));
        assert!(output.contains("caliper_inference_duration_seconds"));
        assert!(output.contains("caliper_turn_duration_seconds"));
        assert!(!output.contains("duration_ms"));
    }

    #[test]
    fn test_health_check_constructors() {
        let ok = HealthCheck::healthy("bus");
        assert_eq!(ok.status, HealthState::Healthy);
        assert!(ok.message.is_none());

        let bad = HealthCheck::unhealthy("query_service", "connection refused");
        assert_eq!(bad.status, HealthState::Unhealthy);
        assert_eq!(bad.status.to_status_code(), 503);
    }

    #[test]
    fn test_global_metrics() {
        let metrics = get_metrics();
        metrics.turns_total.inc();
        assert!(metrics.turns_total.get() >= 1);
    }
}
