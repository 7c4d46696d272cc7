use serde::Serialize;

use crate::db::{Anomaly, ProbeResult};

/// Health figures for one service over an analysis window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceMetrics {
    /// Fraction of results with `ok = false`, in `[0, 1]`.
    pub error_rate: f64,
    /// Milliseconds.
    pub p95_latency: f64,
    pub anomalies: Vec<Anomaly>,
}

impl ServiceMetrics {
    pub fn from_results(results: &[ProbeResult], anomalies: Vec<Anomaly>) -> Self {
        let latencies: Vec<f64> = results.iter().filter_map(|r| r.latency_ms).collect();
        Self {
            error_rate: error_rate(results),
            p95_latency: p95(latencies),
            anomalies,
        }
    }
}

/// 0 for an empty window.
pub fn error_rate(results: &[ProbeResult]) -> f64 {
    if results.is_empty() {
        return 0.0;
    }
    let failed = results.iter().filter(|r| !r.ok).count();
    failed as f64 / results.len() as f64
}

/// Nearest-rank p95 at index `floor(0.95 * (n - 1))` of the sorted values.
/// 0 when there are none.
pub fn p95(mut latencies: Vec<f64>) -> f64 {
    if latencies.is_empty() {
        return 0.0;
    }
    latencies.sort_by(f64::total_cmp);
    let idx = (0.95 * (latencies.len() - 1) as f64).floor() as usize;
    latencies[idx]
}
