//! HTTP request handlers.

use super::AppState;
use crate::clock::Clock;
use crate::db::{
    Digest, ProbeResult, ResultFilter, ResultStore, Service, ServiceRegistry, Store, StoreError,
};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

const DEFAULT_RESULT_LIMIT: u32 = 500;

// ============================================================================
// API: Services
// ============================================================================

pub async fn handle_get_services(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.list_services() {
        Ok(services) => Json(services).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

// ============================================================================
// API: Results
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ResultsQuery {
    #[serde(default)]
    pub service: Option<i64>,
    #[serde(default)]
    pub since: Option<String>,
    #[serde(default)]
    pub until: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
}

pub async fn handle_get_results(
    State(state): State<AppState>,
    Query(query): Query<ResultsQuery>,
) -> impl IntoResponse {
    let since = match parse_time("since", query.since.as_deref()) {
        Ok(t) => t,
        Err(e) => return (StatusCode::BAD_REQUEST, e).into_response(),
    };
    let until = match parse_time("until", query.until.as_deref()) {
        Ok(t) => t,
        Err(e) => return (StatusCode::BAD_REQUEST, e).into_response(),
    };

    let filter = ResultFilter {
        service_id: query.service,
        since,
        until,
        limit: Some(query.limit.unwrap_or(DEFAULT_RESULT_LIMIT)),
    };

    match state.store.list_results(&filter) {
        Ok(results) => Json(results).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Latest result of every service that has one.
pub async fn handle_get_latest_results(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.latest_result_per_service() {
        Ok(latest) => Json(latest.into_values().collect::<Vec<_>>()).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

// ============================================================================
// API: Digests
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct DigestQuery {
    #[serde(default)]
    pub service: Option<i64>,
}

pub async fn handle_get_latest_digest(
    State(state): State<AppState>,
    Query(query): Query<DigestQuery>,
) -> impl IntoResponse {
    match state.store.latest_digest(query.service) {
        Ok(Some(digest)) => Json(digest).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "No digest found").into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

// ============================================================================
// API: Health summary
// ============================================================================

const SUMMARY_WINDOW_HOURS: i64 = 24;

#[derive(Debug, Serialize)]
pub struct ServiceHealth {
    pub service: Service,
    pub latest: Option<ProbeResult>,
    /// The service's own digest or the system-wide one, whichever is newer.
    pub latest_digest: Option<Digest>,
    pub checks_24h: usize,
    pub errors_24h: usize,
    pub avg_latency_24h: Option<f64>,
    pub uptime_percentage_24h: f64,
}

#[derive(Debug, Serialize)]
pub struct HealthSummary {
    pub services: Vec<ServiceHealth>,
    pub system_digest: Option<Digest>,
    pub timestamp: DateTime<Utc>,
}

pub async fn handle_health_summary(State(state): State<AppState>) -> impl IntoResponse {
    match health_summary(&state.store, state.clock.now()) {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

fn health_summary(store: &Store, now: DateTime<Utc>) -> Result<HealthSummary, StoreError> {
    let day_ago = now - Duration::hours(SUMMARY_WINDOW_HOURS);
    let system_digest = store.latest_digest(None)?;
    let mut latest = store.latest_result_per_service()?;

    let mut services = Vec::new();
    for service in store.list_enabled()? {
        let window = store.list_results(&ResultFilter::window(Some(service.id), day_ago, now))?;
        let checks = window.len();
        let errors = window.iter().filter(|r| !r.ok).count();
        let latencies: Vec<f64> = window.iter().filter_map(|r| r.latency_ms).collect();
        let avg_latency = (!latencies.is_empty())
            .then(|| latencies.iter().sum::<f64>() / latencies.len() as f64);
        let uptime = if checks > 0 {
            ((checks - errors) as f64 / checks as f64 * 10_000.0).round() / 100.0
        } else {
            0.0
        };

        let latest_digest = match (store.latest_digest(Some(service.id))?, &system_digest) {
            (Some(own), Some(system)) if system.created_at > own.created_at => Some(system.clone()),
            (Some(own), _) => Some(own),
            (None, system) => system.clone(),
        };

        services.push(ServiceHealth {
            latest: latest.remove(&service.id),
            latest_digest,
            checks_24h: checks,
            errors_24h: errors,
            avg_latency_24h: avg_latency,
            uptime_percentage_24h: uptime,
            service,
        });
    }

    Ok(HealthSummary {
        services,
        system_digest,
        timestamp: now,
    })
}

fn parse_time(name: &str, value: Option<&str>) -> Result<Option<DateTime<Utc>>, String> {
    match value {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| format!("Invalid {} timestamp {:?}: {}", name, s, e)),
    }
}
