//! Metrics collection contract and implementations.
//!
//! Components record through the [`MetricsCollector`] trait so tests and
//! embedders can swap the backend: [`InMemoryMetrics`] keeps plain maps,
//! [`PrometheusMetrics`] registers families against a Prometheus registry.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use prometheus::{CounterVec, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Metrics collection contract used across the resilience pipeline
pub trait MetricsCollector: Send + Sync {
    fn increment_counter(&self, name: &str, labels: &[(&str, &str)]);

    fn set_gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]);

    fn record_histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]);

    fn record_timer(&self, name: &str, duration: Duration, labels: &[(&str, &str)]) {
        self.record_histogram(name, duration.as_secs_f64(), labels);
    }

    /// Aggregate view of everything recorded so far
    fn snapshot(&self) -> HashMap<String, f64>;

    /// Discard all recorded values
    fn reset(&self);
}

/// Shared handle to a collector
pub type SharedMetrics = Arc<dyn MetricsCollector>;

fn series_key(name: &str, labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let mut sorted: Vec<_> = labels.to_vec();
    sorted.sort_by_key(|(k, _)| *k);
    let rendered: Vec<String> = sorted
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, v))
        .collect();
    format!("{}{{{}}}", name, rendered.join(","))
}

/// Map-backed collector for tests and embedded use
#[derive(Default)]
pub struct InMemoryMetrics {
    counters: DashMap<String, f64>,
    gauges: DashMap<String, f64>,
    histogram_sums: DashMap<String, f64>,
    histogram_counts: DashMap<String, u64>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter value for an exact name/label series
    pub fn counter_value(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        self.counters
            .get(&series_key(name, labels))
            .map(|v| *v)
            .unwrap_or(0.0)
    }

    /// Gauge value for an exact name/label series
    pub fn gauge_value(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        self.gauges.get(&series_key(name, labels)).map(|v| *v)
    }
}

impl MetricsCollector for InMemoryMetrics {
    fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        *self.counters.entry(series_key(name, labels)).or_insert(0.0) += 1.0;
    }

    fn set_gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        self.gauges.insert(series_key(name, labels), value);
    }

    fn record_histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        let key = series_key(name, labels);
        *self.histogram_sums.entry(key.clone()).or_insert(0.0) += value;
        *self.histogram_counts.entry(key).or_insert(0) += 1;
    }

    fn snapshot(&self) -> HashMap<String, f64> {
        let mut out = HashMap::new();
        for entry in self.counters.iter() {
            out.insert(entry.key().clone(), *entry.value());
        }
        for entry in self.gauges.iter() {
            out.insert(entry.key().clone(), *entry.value());
        }
        for entry in self.histogram_sums.iter() {
            out.insert(format!("{}_sum", entry.key()), *entry.value());
        }
        for entry in self.histogram_counts.iter() {
            out.insert(format!("{}_count", entry.key()), *entry.value() as f64);
        }
        out
    }

    fn reset(&self) {
        self.counters.clear();
        self.gauges.clear();
        self.histogram_sums.clear();
        self.histogram_counts.clear();
    }
}

/// Prometheus-backed collector.
///
/// Metric families are created lazily on first use with the label names seen
/// there; later calls for the same name must use the same label set, which is
/// how all built-in call sites behave.
pub struct PrometheusMetrics {
    registry: Registry,
    namespace: String,
    counters: RwLock<HashMap<String, CounterVec>>,
    gauges: RwLock<HashMap<String, GaugeVec>>,
    histograms: RwLock<HashMap<String, HistogramVec>>,
}

impl PrometheusMetrics {
    pub fn new(registry: Registry, namespace: impl Into<String>) -> Self {
        Self {
            registry,
            namespace: namespace.into(),
            counters: RwLock::new(HashMap::new()),
            gauges: RwLock::new(HashMap::new()),
            histograms: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn label_names<'a>(labels: &'a [(&str, &str)]) -> Vec<&'a str> {
        labels.iter().map(|(k, _)| *k).collect()
    }

    fn label_values<'a>(labels: &'a [(&str, &str)]) -> Vec<&'a str> {
        labels.iter().map(|(_, v)| *v).collect()
    }
}

impl MetricsCollector for PrometheusMetrics {
    fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        {
            let counters = self.counters.read();
            if let Some(vec) = counters.get(name) {
                vec.with_label_values(&Self::label_values(labels)).inc();
                return;
            }
        }
        let mut counters = self.counters.write();
        let vec = match counters.entry(name.to_string()) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                let created = match CounterVec::new(
                    Opts::new(name, name).namespace(self.namespace.clone()),
                    &Self::label_names(labels),
                ) {
                    Ok(v) => v,
                    Err(err) => {
                        warn!(metric = %name, error = %err, "Failed to create counter");
                        return;
                    }
                };
                if let Err(err) = self.registry.register(Box::new(created.clone())) {
                    warn!(metric = %name, error = %err, "Failed to register counter");
                }
                e.insert(created)
            }
        };
        vec.with_label_values(&Self::label_values(labels)).inc();
    }

    fn set_gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        {
            let gauges = self.gauges.read();
            if let Some(vec) = gauges.get(name) {
                vec.with_label_values(&Self::label_values(labels)).set(value);
                return;
            }
        }
        let mut gauges = self.gauges.write();
        let vec = match gauges.entry(name.to_string()) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                let created = match GaugeVec::new(
                    Opts::new(name, name).namespace(self.namespace.clone()),
                    &Self::label_names(labels),
                ) {
                    Ok(v) => v,
                    Err(err) => {
                        warn!(metric = %name, error = %err, "Failed to create gauge");
                        return;
                    }
                };
                if let Err(err) = self.registry.register(Box::new(created.clone())) {
                    warn!(metric = %name, error = %err, "Failed to register gauge");
                }
                e.insert(created)
            }
        };
        vec.with_label_values(&Self::label_values(labels)).set(value);
    }

    fn record_histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        {
            let histograms = self.histograms.read();
            if let Some(vec) = histograms.get(name) {
                vec.with_label_values(&Self::label_values(labels))
                    .observe(value);
                return;
            }
        }
        let mut histograms = self.histograms.write();
        let vec = match histograms.entry(name.to_string()) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                let created = match HistogramVec::new(
                    HistogramOpts::new(name, name).namespace(self.namespace.clone()),
                    &Self::label_names(labels),
                ) {
                    Ok(v) => v,
                    Err(err) => {
                        warn!(metric = %name, error = %err, "Failed to create histogram");
                        return;
                    }
                };
                if let Err(err) = self.registry.register(Box::new(created.clone())) {
                    warn!(metric = %name, error = %err, "Failed to register histogram");
                }
                e.insert(created)
            }
        };
        vec.with_label_values(&Self::label_values(labels))
            .observe(value);
    }

    fn snapshot(&self) -> HashMap<String, f64> {
        let mut out = HashMap::new();
        for family in self.registry.gather() {
            let mut total = 0.0;
            for metric in family.get_metric() {
                if metric.has_counter() {
                    total += metric.get_counter().get_value();
                } else if metric.has_gauge() {
                    total += metric.get_gauge().get_value();
                } else if metric.has_histogram() {
                    total += metric.get_histogram().get_sample_sum();
                }
            }
            out.insert(family.get_name().to_string(), total);
        }
        out
    }

    fn reset(&self) {
        for vec in self.counters.read().values() {
            vec.reset();
        }
        for vec in self.gauges.read().values() {
            vec.reset();
        }
        for vec in self.histograms.read().values() {
            vec.reset();
        }
    }
}

/// Process-wide Prometheus registry shared by all components
pub static DEFAULT_REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Collector bound to the process-wide registry
pub fn default_collector() -> SharedMetrics {
    Arc::new(PrometheusMetrics::new(
        DEFAULT_REGISTRY.clone(),
        "plugin_resilience",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_counter() {
        let metrics = InMemoryMetrics::new();
        metrics.increment_counter("retry_total", &[("unit", "netease")]);
        metrics.increment_counter("retry_total", &[("unit", "netease")]);
        metrics.increment_counter("retry_total", &[("unit", "qq")]);

        assert_eq!(
            metrics.counter_value("retry_total", &[("unit", "netease")]),
            2.0
        );
        assert_eq!(metrics.counter_value("retry_total", &[("unit", "qq")]), 1.0);
    }

    #[test]
    fn test_in_memory_gauge_and_reset() {
        let metrics = InMemoryMetrics::new();
        metrics.set_gauge("active_recoveries", 3.0, &[]);
        assert_eq!(metrics.gauge_value("active_recoveries", &[]), Some(3.0));

        metrics.reset();
        assert_eq!(metrics.gauge_value("active_recoveries", &[]), None);
    }

    #[test]
    fn test_in_memory_timer_snapshot() {
        let metrics = InMemoryMetrics::new();
        metrics.record_timer("recovery_duration", Duration::from_millis(500), &[]);
        metrics.record_timer("recovery_duration", Duration::from_millis(1500), &[]);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.get("recovery_duration_count"), Some(&2.0));
        assert!(
            (snapshot.get("recovery_duration_sum").copied().unwrap_or(0.0) - 2.0).abs() < 1e-9
        );
    }

    #[test]
    fn test_series_key_sorted() {
        let a = series_key("m", &[("b", "2"), ("a", "1")]);
        let b = series_key("m", &[("a", "1"), ("b", "2")]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_prometheus_collector() {
        let metrics = PrometheusMetrics::new(Registry::new(), "test_ns");
        metrics.increment_counter("calls_total", &[("status", "ok")]);
        metrics.increment_counter("calls_total", &[("status", "ok")]);
        metrics.set_gauge("in_flight", 5.0, &[]);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.get("test_ns_calls_total"), Some(&2.0));
        assert_eq!(snapshot.get("test_ns_in_flight"), Some(&5.0));
    }
}
