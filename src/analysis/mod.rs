//! Windowed analysis of probe results into digests.

mod detector;
mod metrics;
mod summary;

pub use detector::*;
pub use metrics::*;
pub use summary::*;

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::clock::Clock;
use crate::db::{Anomaly, NewDigest, ProbeResult, ResultFilter, ResultStore, ServiceRegistry};

/// Produces one digest per enabled service plus one system-wide digest for
/// each analysis run.
#[derive(Clone)]
pub struct Analyzer {
    registry: Arc<dyn ServiceRegistry>,
    store: Arc<dyn ResultStore>,
    detector: Arc<dyn AnomalyDetector>,
    summarizer: Option<Arc<dyn Summarizer>>,
    clock: Arc<dyn Clock>,
}

impl Analyzer {
    pub fn new(
        registry: Arc<dyn ServiceRegistry>,
        store: Arc<dyn ResultStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            store,
            detector: Arc::new(IsolationForest::default()),
            summarizer: None,
            clock,
        }
    }

    pub fn with_detector(mut self, detector: Arc<dyn AnomalyDetector>) -> Self {
        self.detector = detector;
        self
    }

    /// Try `summarizer` before the built-in text.
    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// Analyze the last `window_hours` hours and return the number of
    /// digests written.
    pub async fn run(&self, window_hours: u32) -> usize {
        let end = self.clock.now();
        let start = end - Duration::hours(i64::from(window_hours.max(1)));
        tracing::info!("Analyzer: Analyzing {} to {}", start, end);

        let services = match self.registry.list_enabled() {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Analyzer: Failed to list services: {}", e);
                Vec::new()
            }
        };

        let mut created = 0;
        for svc in &services {
            let results = match self.load_window(Some(svc.id), start, end) {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!("Analyzer: Failed to load results for {}: {}", svc.name, e);
                    continue;
                }
            };

            let anomalies = self.find_anomalies(&svc.name, &results);
            let metrics = BTreeMap::from([(
                svc.name.clone(),
                ServiceMetrics::from_results(&results, anomalies),
            )]);
            let summary = self.summarize(&metrics, start, end).await;
            let anomalies = metrics
                .into_values()
                .next()
                .map(|m| m.anomalies)
                .unwrap_or_default();

            if self.write_digest(Some(svc.id), start, end, anomalies, summary) {
                created += 1;
            }
        }

        let all = match self.load_window(None, start, end) {
            Ok(r) => r,
            Err(e) => {
                tracing::error!("Analyzer: Failed to load window results: {}", e);
                Vec::new()
            }
        };

        let names: HashMap<i64, String> =
            services.iter().map(|s| (s.id, s.name.clone())).collect();
        let mut grouped: BTreeMap<i64, Vec<ProbeResult>> = BTreeMap::new();
        for r in all {
            grouped.entry(r.service_id).or_default().push(r);
        }

        let mut system: BTreeMap<String, ServiceMetrics> = BTreeMap::new();
        for (service_id, results) in grouped {
            let name = names
                .get(&service_id)
                .cloned()
                .or_else(|| self.registry.get(service_id).ok().map(|s| s.name))
                .unwrap_or_else(|| format!("service-{}", service_id));
            let anomalies = self.find_anomalies(&name, &results);
            system.insert(name, ServiceMetrics::from_results(&results, anomalies));
        }

        let summary = self.summarize(&system, start, end).await;
        let counts = system
            .iter()
            .map(|(name, m)| Anomaly::ServiceCount {
                service: name.clone(),
                count: m.anomalies.len(),
            })
            .collect();
        if self.write_digest(None, start, end, counts, summary) {
            created += 1;
        }

        tracing::info!("Analyzer: Wrote {} digests", created);
        created
    }

    /// Window results in ascending time order.
    fn load_window(
        &self,
        service_id: Option<i64>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ProbeResult>, crate::db::StoreError> {
        let mut results = self
            .store
            .list_results(&ResultFilter::window(service_id, start, end))?;
        results.reverse();
        Ok(results)
    }

    fn find_anomalies(&self, name: &str, results: &[ProbeResult]) -> Vec<Anomaly> {
        if results.is_empty() {
            return Vec::new();
        }
        let points: Vec<[f64; 2]> = results
            .iter()
            .map(|r| [r.latency_ms.unwrap_or(0.0), if r.ok { 0.0 } else { 1.0 }])
            .collect();

        match self.detector.detect(&points) {
            Ok(detections) => results
                .iter()
                .zip(detections)
                .filter(|(_, d)| d.outlier)
                .map(|(r, d)| Anomaly::Point {
                    ts: r.checked_at,
                    score: Some(d.score),
                })
                .collect(),
            Err(e) => {
                tracing::warn!("Analyzer: Anomaly detection failed for {}: {}", name, e);
                Vec::new()
            }
        }
    }

    async fn summarize(
        &self,
        metrics: &BTreeMap<String, ServiceMetrics>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> String {
        if let Some(summarizer) = &self.summarizer {
            match summarizer.summarize(metrics, start, end).await {
                Ok(text) if !text.trim().is_empty() => return text,
                Ok(_) => tracing::warn!("Analyzer: Summarizer returned no text, using fallback"),
                Err(e) => tracing::warn!("Analyzer: Summarizer failed, using fallback: {}", e),
            }
        }
        fallback_summary(metrics, start, end)
    }

    fn write_digest(
        &self,
        service_id: Option<i64>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        anomalies: Vec<Anomaly>,
        summary_text: String,
    ) -> bool {
        let digest = NewDigest {
            service_id,
            period_start: start,
            period_end: end,
            anomalies,
            summary_text,
            created_at: self.clock.now(),
        };
        match self.store.append_digest(digest) {
            Ok(_) => true,
            Err(e) => {
                tracing::error!("Analyzer: Failed to write digest: {}", e);
                false
            }
        }
    }
}
