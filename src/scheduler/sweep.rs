//! Probe sweeps: one concurrent round of probes over every enabled service.

use chrono::{DateTime, Utc};
use serde_json::{json, Map};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::clock::Clock;
use crate::db::{NewProbeResult, ResultStore, Service, ServiceRegistry};
use crate::probe::{probe_with_retry, ProbeLog, ProbeLogRecord, ProbeOutcome, Prober};

type InFlightSet = Arc<Mutex<HashSet<i64>>>;

/// Runs probe sweeps and records their results.
///
/// Cloning is cheap; clones share the single-flight set, so a service is
/// never probed twice at once through the same engine.
#[derive(Clone)]
pub struct ProbeEngine {
    registry: Arc<dyn ServiceRegistry>,
    store: Arc<dyn ResultStore>,
    prober: Arc<dyn Prober>,
    clock: Arc<dyn Clock>,
    log: ProbeLog,
    in_flight: InFlightSet,
    max_concurrent: Option<usize>,
}

impl ProbeEngine {
    pub fn new(
        registry: Arc<dyn ServiceRegistry>,
        store: Arc<dyn ResultStore>,
        prober: Arc<dyn Prober>,
        clock: Arc<dyn Clock>,
        log: ProbeLog,
    ) -> Self {
        Self {
            registry,
            store,
            prober,
            clock,
            log,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            max_concurrent: None,
        }
    }

    /// Bound the number of probes running at once. `None` runs all of them.
    pub fn with_max_concurrent(mut self, limit: Option<usize>) -> Self {
        self.max_concurrent = limit;
        self
    }

    /// Probe every enabled service once and return the number of results
    /// written.
    ///
    /// The service list is read once at the start. Services whose previous
    /// probe is still running are skipped and produce no result.
    pub async fn sweep(&self) -> usize {
        self.run_sweep(None).await
    }

    /// Like [`ProbeEngine::sweep`], but stop waiting at `deadline`.
    ///
    /// Probes still running then carry on in the background. They keep the
    /// service marked in flight and still record their result, but are not
    /// counted in the return value.
    pub async fn sweep_until(&self, deadline: DateTime<Utc>) -> usize {
        self.run_sweep(Some(deadline)).await
    }

    async fn run_sweep(&self, deadline: Option<DateTime<Utc>>) -> usize {
        let services = match self.registry.list_enabled() {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("ProbeEngine: Failed to list services: {}", e);
                return 0;
            }
        };
        if services.is_empty() {
            tracing::debug!("ProbeEngine: No enabled services");
            return 0;
        }

        let permits = self.max_concurrent.unwrap_or(services.len()).max(1);
        let semaphore = Arc::new(Semaphore::new(permits));
        let mut tasks = JoinSet::new();
        let mut skipped = 0;

        for service in services {
            let Some(guard) = InFlightGuard::acquire(&self.in_flight, service.id) else {
                tracing::warn!(
                    "Skipping probe for {}: previous probe still in flight",
                    service.name
                );
                skipped += 1;
                continue;
            };

            let engine = self.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                // Held until the probe reaches a terminal state, even on panic.
                let _guard = guard;
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return false;
                };
                engine.probe_and_record(&service).await
            });
        }

        let mut written = 0;
        loop {
            let joined = match deadline {
                None => tasks.join_next().await,
                Some(deadline) => {
                    let wait = (deadline - self.clock.now()).to_std().unwrap_or_default();
                    tokio::select! {
                        biased;
                        joined = tasks.join_next() => joined,
                        _ = self.clock.sleep(wait) => break,
                    }
                }
            };
            match joined {
                Some(Ok(true)) => written += 1,
                Some(Ok(false)) => {}
                Some(Err(e)) => tracing::error!("ProbeEngine: Probe task failed: {}", e),
                None => break,
            }
        }

        if !tasks.is_empty() {
            tracing::warn!(
                "ProbeEngine: {} probes still running at the sweep deadline",
                tasks.len()
            );
            tasks.detach_all();
        }

        tracing::info!(
            "ProbeEngine: Sweep complete, {} results written, {} skipped",
            written,
            skipped
        );
        written
    }

    async fn probe_and_record(&self, service: &Service) -> bool {
        let outcome = probe_with_retry(self.prober.as_ref(), self.clock.as_ref(), service).await;
        let checked_at = self.clock.now();

        self.log.emit(log_record(service, &outcome, checked_at));

        let result = NewProbeResult {
            service_id: service.id,
            status_code: outcome.status_code,
            ok: outcome.ok,
            latency_ms: Some(outcome.latency_ms),
            error_text: outcome.error_text.clone(),
            checked_at,
            meta: probe_meta(service, &outcome),
        };

        match self.store.append_result(result) {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(
                    "ProbeEngine: Failed to record result for {}: {}",
                    service.name,
                    e
                );
                false
            }
        }
    }
}

fn log_record(service: &Service, outcome: &ProbeOutcome, ts: DateTime<Utc>) -> ProbeLogRecord {
    ProbeLogRecord {
        service: service.name.clone(),
        status: outcome.status_code,
        ok: outcome.ok,
        latency_ms: outcome.latency_ms,
        error: outcome.error_text.clone(),
        ts: ts.timestamp_micros() as f64 / 1_000_000.0,
    }
}

fn probe_meta(service: &Service, outcome: &ProbeOutcome) -> Map<String, serde_json::Value> {
    let mut meta = Map::new();
    meta.insert("headers".to_string(), json!(outcome.headers));
    meta.insert("attempts".to_string(), json!(outcome.attempts));
    meta.insert("url".to_string(), json!(service.health_url()));
    meta.insert("method".to_string(), json!(service.method.as_str()));
    meta
}

/// Membership of one service id in the single-flight set.
struct InFlightGuard {
    set: InFlightSet,
    id: i64,
}

impl InFlightGuard {
    fn acquire(set: &InFlightSet, id: i64) -> Option<Self> {
        let mut ids = set.lock().unwrap_or_else(PoisonError::into_inner);
        ids.insert(id).then(|| Self {
            set: set.clone(),
            id,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut ids = self.set.lock().unwrap_or_else(PoisonError::into_inner);
        ids.remove(&self.id);
    }
}
