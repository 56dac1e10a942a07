//! Prometheus Exporter
//!
//! Mirrors monitor samples into a private Prometheus registry served by the
//! daemon's `/metrics` endpoint.

use prometheus::{Encoder, GaugeVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use super::monitor::MetricsSample;
use crate::error::Result;

const NAMESPACE: &str = "tiercache";

/// Per-cache gauges plus alert and remote health gauges
pub struct PrometheusExporter {
    registry: Registry,
    hits: IntGaugeVec,
    misses: IntGaugeVec,
    errors: IntGaugeVec,
    evictions: IntGaugeVec,
    memory_bytes: IntGaugeVec,
    hit_rate: GaugeVec,
    response_time_ms: GaugeVec,
    active_alerts: IntGauge,
    remote_up: IntGauge,
    remote_used_bytes: IntGauge,
}

impl PrometheusExporter {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let int_vec = |name: &str, help: &str| -> Result<IntGaugeVec> {
            let gauge = IntGaugeVec::new(Opts::new(name, help).namespace(NAMESPACE), &["cache"])?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };
        let float_vec = |name: &str, help: &str| -> Result<GaugeVec> {
            let gauge = GaugeVec::new(Opts::new(name, help).namespace(NAMESPACE), &["cache"])?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };
        let int = |name: &str, help: &str| -> Result<IntGauge> {
            let gauge = IntGauge::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };

        Ok(Self {
            hits: int_vec("cache_hits", "Cache hits since start")?,
            misses: int_vec("cache_misses", "Cache misses since start")?,
            errors: int_vec("cache_errors", "Tier errors since start")?,
            evictions: int_vec("cache_evictions", "Memory tier evictions since start")?,
            memory_bytes: int_vec("cache_memory_bytes", "Bytes held in the memory tier")?,
            hit_rate: float_vec("cache_hit_ratio", "Hits per request (0-1)")?,
            response_time_ms: float_vec(
                "cache_response_time_ms",
                "Average lookup latency in milliseconds",
            )?,
            active_alerts: int("active_alerts", "Unresolved alerts")?,
            remote_up: int("remote_up", "1 when the remote tier answers PING")?,
            remote_used_bytes: int("remote_used_bytes", "Memory used by the remote store")?,
            registry,
        })
    }

    /// Refresh every gauge from a sample
    pub fn update(&self, sample: &MetricsSample, active_alerts: usize) {
        for snapshot in sample.caches.iter().chain(std::iter::once(&sample.aggregate)) {
            let labels = [snapshot.name.as_str()];
            self.hits.with_label_values(&labels).set(snapshot.hits as i64);
            self.misses.with_label_values(&labels).set(snapshot.misses as i64);
            self.errors.with_label_values(&labels).set(snapshot.errors as i64);
            self.evictions
                .with_label_values(&labels)
                .set(snapshot.evictions as i64);
            self.memory_bytes
                .with_label_values(&labels)
                .set(snapshot.memory_usage_bytes as i64);
            self.hit_rate.with_label_values(&labels).set(snapshot.hit_rate);
            self.response_time_ms
                .with_label_values(&labels)
                .set(snapshot.avg_response_time_ms);
        }
        self.active_alerts.set(active_alerts as i64);
        self.remote_up.set(i64::from(sample.remote_connected));
        self.remote_used_bytes.set(sample.remote_used_bytes as i64);
    }

    /// Prometheus text exposition
    pub fn encode(&self) -> Result<Vec<u8>> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }

    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }
}

// =============================================================================
// Tests
// =============================================================================
