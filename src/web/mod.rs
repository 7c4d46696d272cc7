//! Web server module: a read-only JSON API over the store.

mod handlers;

pub use handlers::*;

use crate::clock::Clock;
use crate::db::Store;

use axum::{routing::get, Router};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub clock: Arc<dyn Clock>,
}

/// Web server for healthtrail.
pub struct Server {
    port: u16,
    state: AppState,
}

impl Server {
    pub fn new(port: u16, store: Arc<Store>, clock: Arc<dyn Clock>) -> Self {
        Self {
            port,
            state: AppState { store, clock },
        }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            .route("/api/services", get(handlers::handle_get_services))
            .route("/api/results", get(handlers::handle_get_results))
            .route("/api/results/latest", get(handlers::handle_get_latest_results))
            .route("/api/digests/latest", get(handlers::handle_get_latest_digest))
            .route("/api/health/summary", get(handlers::handle_health_summary))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve until `shutdown` resolves.
    pub async fn start<F>(&self, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::{Anomaly, NewDigest, NewProbeResult, ResultStore};
    use crate::testing::{epoch, serve, service_at, temp_store};
    use chrono::Duration;
    use serde_json::{Map, Value};
    use tempfile::NamedTempFile;

    struct Fixture {
        _tmp: NamedTempFile,
        store: Arc<Store>,
        base: String,
        api_id: i64,
        db_id: i64,
    }

    async fn fixture() -> Fixture {
        let (tmp, store) = temp_store();
        let api_id = store.upsert_service(&service_at(0, "api", "http://api.test")).unwrap().0;
        let db_id = store.upsert_service(&service_at(0, "db", "http://db.test")).unwrap().0;
        let mut off = service_at(0, "off", "http://off.test");
        off.enabled = false;
        store.upsert_service(&off).unwrap();

        for (service_id, minutes, ok) in [(api_id, 30, true), (api_id, 20, false), (db_id, 10, true)] {
            store
                .append_result(NewProbeResult {
                    service_id,
                    status_code: Some(if ok { 200 } else { 503 }),
                    ok,
                    latency_ms: Some(42.0),
                    error_text: None,
                    checked_at: epoch() - Duration::minutes(minutes),
                    meta: Map::new(),
                })
                .unwrap();
        }

        let store = Arc::new(store);
        let server = Server::new(0, store.clone(), Arc::new(ManualClock::new(epoch())));
        let addr = serve(server.routes()).await;
        Fixture {
            _tmp: tmp,
            store,
            base: format!("http://{}", addr),
            api_id,
            db_id,
        }
    }

    async fn get_json(url: &str) -> (u16, Value) {
        let resp = reqwest::get(url).await.unwrap();
        let status = resp.status().as_u16();
        let body = resp.json().await.unwrap_or(Value::Null);
        (status, body)
    }

    #[tokio::test]
    async fn test_list_services() {
        let fx = fixture().await;
        let (status, body) = get_json(&format!("{}/api/services", fx.base)).await;
        assert_eq!(status, 200);
        let names: Vec<&str> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["api", "db", "off"]);
    }

    #[tokio::test]
    async fn test_results_filtering() {
        let fx = fixture().await;

        let (status, body) =
            get_json(&format!("{}/api/results?service={}", fx.base, fx.api_id)).await;
        assert_eq!(status, 200);
        let results = body.as_array().unwrap();
        assert_eq!(results.len(), 2);
        // Newest first.
        assert_eq!(results[0]["ok"], false);
        assert_eq!(results[1]["ok"], true);

        let since = (epoch() - Duration::minutes(20)).to_rfc3339();
        let url = format!(
            "{}/api/results?since={}",
            fx.base,
            since.replace('+', "%2B")
        );
        let (_, body) = get_json(&url).await;
        assert_eq!(body.as_array().unwrap().len(), 2);

        let (_, body) = get_json(&format!("{}/api/results?limit=1", fx.base)).await;
        let results = body.as_array().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["service_id"], fx.db_id);
    }

    #[tokio::test]
    async fn test_results_rejects_bad_timestamp() {
        let fx = fixture().await;
        let resp = reqwest::get(format!("{}/api/results?until=yesterday", fx.base))
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 400);
    }

    #[tokio::test]
    async fn test_latest_results() {
        let fx = fixture().await;
        let (status, body) = get_json(&format!("{}/api/results/latest", fx.base)).await;
        assert_eq!(status, 200);
        let latest = body.as_array().unwrap();
        assert_eq!(latest.len(), 2);
        let api = latest
            .iter()
            .find(|r| r["service_id"] == fx.api_id)
            .unwrap();
        assert_eq!(api["status_code"], 503);
    }

    fn digest(service_id: Option<i64>, text: &str, created_min: i64) -> NewDigest {
        NewDigest {
            service_id,
            period_start: epoch() - Duration::hours(24),
            period_end: epoch() - Duration::minutes(60),
            anomalies: vec![],
            summary_text: text.to_string(),
            created_at: epoch() - Duration::minutes(created_min),
        }
    }

    #[tokio::test]
    async fn test_latest_digest() {
        let fx = fixture().await;
        let url = format!("{}/api/digests/latest", fx.base);
        assert_eq!(reqwest::get(&url).await.unwrap().status().as_u16(), 404);

        let mut api_digest = digest(Some(fx.api_id), "api digest", 5);
        api_digest.anomalies = vec![Anomaly::Point {
            ts: epoch() - Duration::minutes(20),
            score: Some(-0.08),
        }];
        fx.store.append_digest(api_digest).unwrap();

        // Only a service digest exists, so there is no system-wide one yet.
        assert_eq!(reqwest::get(&url).await.unwrap().status().as_u16(), 404);

        let (status, body) = get_json(&format!("{}?service={}", url, fx.api_id)).await;
        assert_eq!(status, 200);
        assert_eq!(body["summary_text"], "api digest");
        assert_eq!(body["anomalies"][0]["score"], -0.08);
        let (status, _) = get_json(&format!("{}?service={}", url, fx.db_id)).await;
        assert_eq!(status, 404);

        fx.store.append_digest(digest(None, "system digest", 30)).unwrap();
        let (status, body) = get_json(&url).await;
        assert_eq!(status, 200);
        assert_eq!(body["summary_text"], "system digest");
        assert_eq!(body["service_id"], Value::Null);
    }

    #[tokio::test]
    async fn test_health_summary() {
        let fx = fixture().await;
        let summary_url = format!("{}/api/health/summary", fx.base);
        let (status, body) = get_json(&summary_url).await;
        assert_eq!(status, 200);

        assert_eq!(body["timestamp"], serde_json::json!(epoch()));
        assert_eq!(body["system_digest"], Value::Null);

        let services = body["services"].as_array().unwrap();
        assert_eq!(services.len(), 2);

        let api = &services[0];
        assert_eq!(api["service"]["name"], "api");
        assert_eq!(api["latest"]["ok"], false);
        assert_eq!(api["checks_24h"], 2);
        assert_eq!(api["errors_24h"], 1);
        assert_eq!(api["avg_latency_24h"], 42.0);
        assert_eq!(api["uptime_percentage_24h"], 50.0);
        assert_eq!(api["latest_digest"], Value::Null);

        let db = &services[1];
        assert_eq!(db["latest"]["ok"], true);
        assert_eq!(db["checks_24h"], 1);
        assert_eq!(db["errors_24h"], 0);
        assert_eq!(db["uptime_percentage_24h"], 100.0);

        // Results older than a day are left out of the statistics.
        fx.store
            .append_result(NewProbeResult {
                service_id: fx.db_id,
                status_code: None,
                ok: false,
                latency_ms: Some(3000.0),
                error_text: Some("ConnectError: refused".to_string()),
                checked_at: epoch() - Duration::hours(30),
                meta: Map::new(),
            })
            .unwrap();

        fx.store.append_digest(digest(None, "system digest", 30)).unwrap();
        fx.store.append_digest(digest(Some(fx.api_id), "api digest", 10)).unwrap();

        let (_, body) = get_json(&summary_url).await;
        assert_eq!(body["system_digest"]["summary_text"], "system digest");
        let services = body["services"].as_array().unwrap();
        // api has a newer digest of its own; db falls back to the system one.
        assert_eq!(services[0]["latest_digest"]["summary_text"], "api digest");
        assert_eq!(services[1]["latest_digest"]["summary_text"], "system digest");
        assert_eq!(services[1]["checks_24h"], 1);
        assert_eq!(services[1]["avg_latency_24h"], 42.0);
    }
}
