//! Helpers shared by the unit tests.

use async_trait::async_trait;
use axum::Router;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;
use tokio::sync::Notify;

use crate::db::{Service, Store};
use crate::probe::{Prober, RawResponse, TransportError, TransportErrorKind};

/// Serve `router` on an ephemeral local port.
pub async fn serve(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// A local address nothing is listening on.
pub async fn closed_port() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

pub fn service_at(id: i64, name: &str, base_url: &str) -> Service {
    Service {
        id,
        name: name.to_string(),
        base_url: base_url.to_string(),
        ..Default::default()
    }
}

pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

/// A store on a temporary file. Keep the file alive as long as the store.
pub fn temp_store() -> (NamedTempFile, Store) {
    let file = NamedTempFile::new().unwrap();
    let store = Store::new(file.path()).unwrap();
    (file, store)
}

/// Blocks a probe until released.
#[derive(Default)]
pub struct Gate {
    pub entered: Notify,
    pub release: Notify,
}

#[derive(Default)]
struct Plan {
    steps: VecDeque<Result<u16, TransportErrorKind>>,
    gate: Option<Arc<Gate>>,
}

/// A prober driven by per-service scripts instead of the network.
///
/// Each call consumes the next step of the service's script; the last step
/// repeats. Unscripted services answer 200.
#[derive(Default)]
pub struct FakeProber {
    plans: Mutex<HashMap<String, Plan>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl FakeProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, service: &str, steps: Vec<Result<u16, TransportErrorKind>>) {
        let mut plans = self.plans.lock().unwrap();
        plans.entry(service.to_string()).or_default().steps = steps.into();
    }

    /// Make probes of `service` wait on a gate before answering.
    pub fn gate(&self, service: &str) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        let mut plans = self.plans.lock().unwrap();
        plans.entry(service.to_string()).or_default().gate = Some(gate.clone());
        gate
    }

    pub fn calls(&self, service: &str) -> usize {
        self.calls.lock().unwrap().get(service).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Prober for FakeProber {
    async fn probe(&self, service: &Service) -> Result<RawResponse, TransportError> {
        *self.calls.lock().unwrap().entry(service.name.clone()).or_default() += 1;

        let (step, gate) = {
            let mut plans = self.plans.lock().unwrap();
            match plans.get_mut(&service.name) {
                Some(plan) => {
                    let step = if plan.steps.len() > 1 {
                        plan.steps.pop_front()
                    } else {
                        plan.steps.front().cloned()
                    };
                    (step.unwrap_or(Ok(200)), plan.gate.clone())
                }
                None => (Ok(200), None),
            }
        };

        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        match step {
            Ok(status_code) => Ok(RawResponse {
                status_code,
                headers: BTreeMap::from([("content-type".to_string(), "text/plain".to_string())]),
            }),
            Err(kind) => Err(TransportError::new(kind, "scripted failure")),
        }
    }
}
