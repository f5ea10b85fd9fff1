//! Per-identifier request metrics.

use std::collections::HashMap;

use dashmap::DashMap;
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default)]
struct MetricsRecord {
    requests: u64,
    errors: u64,
    total_response_time_ms: u64,
}

/// Reported metrics for one identifier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub errors: u64,
    /// Errors divided by requests, 0.0 when idle
    pub error_rate: f64,
    pub avg_response_time_ms: f64,
}

impl MetricsRecord {
    fn snapshot(&self) -> MetricsSnapshot {
        let (error_rate, avg_response_time_ms) = if self.requests == 0 {
            (0.0, 0.0)
        } else {
            (
                self.errors as f64 / self.requests as f64,
                self.total_response_time_ms as f64 / self.requests as f64,
            )
        };

        MetricsSnapshot {
            requests: self.requests,
            errors: self.errors,
            error_rate,
            avg_response_time_ms,
        }
    }
}

/// Additive request counters, created lazily per identifier.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    records: DashMap<String, MetricsRecord>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, identifier: &str, success: bool, response_time_ms: u64) {
        let mut record = self.records.entry(identifier.to_string()).or_default();
        record.requests += 1;
        if !success {
            record.errors += 1;
        }
        record.total_response_time_ms += response_time_ms;
    }

    pub fn get_metrics(&self) -> HashMap<String, MetricsSnapshot> {
        self.records
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect()
    }

    pub fn get(&self, identifier: &str) -> Option<MetricsSnapshot> {
        self.records.get(identifier).map(|r| r.snapshot())
    }

    /// Reset one identifier, or everything when `None`.
    pub fn clear(&self, identifier: Option<&str>) {
        match identifier {
            Some(id) => {
                self.records.remove(id);
            }
            None => self.records.clear(),
        }
    }
}
