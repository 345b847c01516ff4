use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub const CACHE_HIT: &str = "cache.hit";
pub const CACHE_MISS: &str = "cache.miss";
pub const RECOMMENDATIONS_SERVED: &str = "recommendations.served";
pub const RECOMMENDATIONS_AVG_SCORE: &str = "recommendations.avg_score";
pub const RECOMMENDATION_LATENCY: &str = "recommendations.latency";
pub const RATINGS_RECORDED: &str = "ratings.recorded";
pub const PIPELINE_BATCH_SIZE: &str = "pipeline.batch_size";
pub const PIPELINE_BATCH_DURATION: &str = "pipeline.batch_duration";
pub const PIPELINE_BATCH_FAILED: &str = "pipeline.batch_failed";
pub const PIPELINE_EVICTED: &str = "pipeline.evicted";

/// Destination for operational counters, timings and gauges.
pub trait MetricsSink: Send + Sync {
    fn incr_counter(&self, name: &str, by: u64);
    fn record_timing(&self, name: &str, elapsed: Duration);
    fn record_value(&self, name: &str, value: f64);

    /// Point-in-time view of everything recorded, for sinks that keep one.
    fn report(&self) -> Option<MetricsSnapshot> {
        None
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub last: f64,
}

impl MetricSummary {
    fn observe(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
        self.last = value;
    }

    pub fn mean(&self) -> f64 {
        if self.count > 0 {
            self.sum / self.count as f64
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    /// Milliseconds.
    pub timings: BTreeMap<String, MetricSummary>,
    pub values: BTreeMap<String, MetricSummary>,
}

impl MetricsSnapshot {
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    /// Hit ratio over cache lookups, 0 before the first lookup.
    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.counter(CACHE_HIT);
        let total = hits + self.counter(CACHE_MISS);
        if total > 0 {
            hits as f64 / total as f64
        } else {
            0.0
        }
    }
}

#[derive(Default)]
pub struct InMemoryMetrics {
    counters: DashMap<String, u64>,
    timings: DashMap<String, MetricSummary>,
    values: DashMap<String, MetricSummary>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self.counters.iter().map(|e| (e.key().clone(), *e.value())).collect(),
            timings: self.timings.iter().map(|e| (e.key().clone(), e.value().clone())).collect(),
            values: self.values.iter().map(|e| (e.key().clone(), e.value().clone())).collect(),
        }
    }

    pub fn reset(&self) {
        self.counters.clear();
        self.timings.clear();
        self.values.clear();
    }
}

impl MetricsSink for InMemoryMetrics {
    fn incr_counter(&self, name: &str, by: u64) {
        *self.counters.entry(name.to_string()).or_insert(0) += by;
    }

    fn record_timing(&self, name: &str, elapsed: Duration) {
        self.timings
            .entry(name.to_string())
            .or_default()
            .observe(elapsed.as_secs_f64() * 1000.0);
    }

    fn record_value(&self, name: &str, value: f64) {
        self.values.entry(name.to_string()).or_default().observe(value);
    }

    fn report(&self) -> Option<MetricsSnapshot> {
        Some(self.snapshot())
    }
}
