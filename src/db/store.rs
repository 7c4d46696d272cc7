//! SQLite database store implementation.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use rusqlite::types::{Type, Value as SqlValue};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;
use super::repo::{ResultStore, ServiceRegistry};

/// Timestamps are stored as UTC text in this format so that string order
/// matches time order.
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

const RESULT_COLUMNS: &str =
    "id, service_id, status_code, ok, latency_ms, error_text, checked_at, meta";
const DIGEST_COLUMNS: &str =
    "id, service_id, period_start, period_end, anomalies, summary_text, created_at";
const SERVICE_COLUMNS: &str =
    "id, name, base_url, health_path, method, headers, timeout_s, enabled";

/// Database error types.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("JSON encoding error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Invalid service: {0}")]
    InvalidService(String),
    #[error("Database connection lock poisoned")]
    Poisoned,
    #[error("Not found")]
    NotFound,
}

#[derive(Error, Debug)]
#[error("invalid stored value: {0}")]
struct InvalidColumn(String);

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| StoreError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    // --- Services ---

    /// Insert a service, or update the service with the same name.
    ///
    /// Returns the service id and whether a new row was created.
    pub fn upsert_service(&self, service: &Service) -> Result<(i64, bool), StoreError> {
        validate_service(service)?;
        let headers = serde_json::to_string(&service.headers)?;

        let conn = self.conn()?;
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM services WHERE name = ?1",
                params![service.name],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE services SET base_url=?1, health_path=?2, method=?3, headers=?4, timeout_s=?5, enabled=?6 WHERE id=?7",
                    params![
                        service.base_url,
                        service.health_path,
                        service.method.as_str(),
                        headers,
                        service.timeout_s,
                        service.enabled,
                        id,
                    ],
                )?;
                Ok((id, false))
            }
            None => {
                conn.execute(
                    "INSERT INTO services (name, base_url, health_path, method, headers, timeout_s, enabled) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        service.name,
                        service.base_url,
                        service.health_path,
                        service.method.as_str(),
                        headers,
                        service.timeout_s,
                        service.enabled,
                    ],
                )?;
                Ok((conn.last_insert_rowid(), true))
            }
        }
    }

    /// Get all services.
    pub fn list_services(&self) -> Result<Vec<Service>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM services ORDER BY id",
            SERVICE_COLUMNS
        ))?;
        let services = stmt
            .query_map([], service_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(services)
    }

    /// Delete a service. Its results go with it; its digests are kept with
    /// the service reference cleared.
    pub fn delete_service(&self, id: i64) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM services WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    // --- Digests ---

    /// Digests newest first, optionally for one service.
    pub fn list_digests(
        &self,
        service_id: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Digest>, StoreError> {
        let conn = self.conn()?;
        let mut sql = format!("SELECT {} FROM digests", DIGEST_COLUMNS);
        let mut values = Vec::new();
        if let Some(id) = service_id {
            sql.push_str(" WHERE service_id = ?");
            values.push(SqlValue::Integer(id));
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ?");
        values.push(SqlValue::Integer(limit as i64));

        let mut stmt = conn.prepare(&sql)?;
        let digests = stmt
            .query_map(params_from_iter(values.iter()), digest_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(digests)
    }
}

impl ServiceRegistry for Store {
    fn list_enabled(&self) -> Result<Vec<Service>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM services WHERE enabled = 1 ORDER BY id",
            SERVICE_COLUMNS
        ))?;
        let services = stmt
            .query_map([], service_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(services)
    }

    fn get(&self, id: i64) -> Result<Service, StoreError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM services WHERE id = ?1", SERVICE_COLUMNS),
            params![id],
            service_from_row,
        )
        .optional()?
        .ok_or(StoreError::NotFound)
    }
}

impl ResultStore for Store {
    fn append_result(&self, result: NewProbeResult) -> Result<ProbeResult, StoreError> {
        let meta = serde_json::to_string(&result.meta)?;

        let conn = self.conn()?;
        let last: Option<String> = conn.query_row(
            "SELECT MAX(checked_at) FROM probe_results WHERE service_id = ?1",
            params![result.service_id],
            |row| row.get(0),
        )?;

        // Ties (or a clock step backwards) are broken by append order.
        let mut checked_at = result.checked_at;
        if let Some(last) = last.as_deref().and_then(parse_db_time) {
            if checked_at <= last {
                checked_at = last + ChronoDuration::microseconds(1);
            }
        }

        conn.execute(
            "INSERT INTO probe_results (service_id, status_code, ok, latency_ms, error_text, checked_at, meta) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                result.service_id,
                result.status_code,
                result.ok,
                result.latency_ms,
                result.error_text,
                format_db_time(checked_at),
                meta,
            ],
        )?;

        Ok(ProbeResult {
            id: conn.last_insert_rowid(),
            service_id: result.service_id,
            status_code: result.status_code,
            ok: result.ok,
            latency_ms: result.latency_ms,
            error_text: result.error_text,
            checked_at,
            meta: result.meta,
        })
    }

    fn append_digest(&self, digest: NewDigest) -> Result<Digest, StoreError> {
        let anomalies = serde_json::to_string(&digest.anomalies)?;

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO digests (service_id, period_start, period_end, anomalies, summary_text, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                digest.service_id,
                format_db_time(digest.period_start),
                format_db_time(digest.period_end),
                anomalies,
                digest.summary_text,
                format_db_time(digest.created_at),
            ],
        )?;

        Ok(Digest {
            id: conn.last_insert_rowid(),
            service_id: digest.service_id,
            period_start: digest.period_start,
            period_end: digest.period_end,
            anomalies: digest.anomalies,
            summary_text: digest.summary_text,
            created_at: digest.created_at,
        })
    }

    fn list_results(&self, filter: &ResultFilter) -> Result<Vec<ProbeResult>, StoreError> {
        let mut clauses = Vec::new();
        let mut values = Vec::new();

        if let Some(id) = filter.service_id {
            clauses.push("service_id = ?");
            values.push(SqlValue::Integer(id));
        }
        if let Some(since) = filter.since {
            clauses.push("checked_at >= ?");
            values.push(SqlValue::Text(format_db_time(since)));
        }
        if let Some(until) = filter.until {
            clauses.push("checked_at <= ?");
            values.push(SqlValue::Text(format_db_time(until)));
        }

        let mut sql = format!("SELECT {} FROM probe_results", RESULT_COLUMNS);
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY checked_at DESC, id DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            values.push(SqlValue::Integer(limit as i64));
        }

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let results = stmt
            .query_map(params_from_iter(values.iter()), result_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(results)
    }

    fn latest_result_per_service(&self) -> Result<BTreeMap<i64, ProbeResult>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM probe_results r
             WHERE r.id = (
                 SELECT r2.id FROM probe_results r2
                 WHERE r2.service_id = r.service_id
                 ORDER BY r2.checked_at DESC, r2.id DESC LIMIT 1
             )",
            RESULT_COLUMNS
        ))?;
        let results = stmt
            .query_map([], result_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(results.into_iter().map(|r| (r.service_id, r)).collect())
    }

    fn latest_digest(&self, service_id: Option<i64>) -> Result<Option<Digest>, StoreError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM digests WHERE service_id IS ? ORDER BY created_at DESC, id DESC LIMIT 1",
            DIGEST_COLUMNS
        );
        let digest = conn
            .query_row(&sql, params![service_id], digest_from_row)
            .optional()?;
        Ok(digest)
    }
}

fn validate_service(service: &Service) -> Result<(), StoreError> {
    if service.name.trim().is_empty() {
        return Err(StoreError::InvalidService("name must not be empty".to_string()));
    }
    let url = reqwest::Url::parse(&service.base_url).map_err(|e| {
        StoreError::InvalidService(format!("{}: base_url {:?}: {}", service.name, service.base_url, e))
    })?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(StoreError::InvalidService(format!(
            "{}: base_url must be http or https",
            service.name
        )));
    }
    if !service.health_path.starts_with('/') {
        return Err(StoreError::InvalidService(format!(
            "{}: health_path must start with '/'",
            service.name
        )));
    }
    if service.timeout_s == 0 {
        return Err(StoreError::InvalidService(format!(
            "{}: timeout_s must be positive",
            service.name
        )));
    }
    Ok(())
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(InvalidColumn(message)))
}

fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_db_time(&raw).ok_or_else(|| conversion_error(idx, raw))
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn service_from_row(row: &Row<'_>) -> rusqlite::Result<Service> {
    let method: String = row.get(4)?;
    Ok(Service {
        id: row.get(0)?,
        name: row.get(1)?,
        base_url: row.get(2)?,
        health_path: row.get(3)?,
        method: method.parse().map_err(|e| conversion_error(4, e))?,
        headers: json_column(row, 5)?,
        timeout_s: row.get(6)?,
        enabled: row.get(7)?,
    })
}

fn result_from_row(row: &Row<'_>) -> rusqlite::Result<ProbeResult> {
    Ok(ProbeResult {
        id: row.get(0)?,
        service_id: row.get(1)?,
        status_code: row.get(2)?,
        ok: row.get(3)?,
        latency_ms: row.get(4)?,
        error_text: row.get(5)?,
        checked_at: time_column(row, 6)?,
        meta: json_column(row, 7)?,
    })
}

fn digest_from_row(row: &Row<'_>) -> rusqlite::Result<Digest> {
    Ok(Digest {
        id: row.get(0)?,
        service_id: row.get(1)?,
        period_start: time_column(row, 2)?,
        period_end: time_column(row, 3)?,
        anomalies: json_column(row, 4)?,
        summary_text: row.get(5)?,
        created_at: time_column(row, 6)?,
    })
}

fn format_db_time(dt: DateTime<Utc>) -> String {
    dt.format(TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [TIME_FORMAT, "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::{json, Map};
    use tempfile::NamedTempFile;

    fn service(name: &str) -> Service {
        Service {
            name: name.to_string(),
            base_url: "https://example.com/".to_string(),
            ..Default::default()
        }
    }

    fn result_at(service_id: i64, checked_at: DateTime<Utc>, ok: bool) -> NewProbeResult {
        NewProbeResult {
            service_id,
            status_code: if ok { Some(200) } else { None },
            ok,
            latency_ms: Some(12.5),
            error_text: if ok { None } else { Some("ConnectError: refused".to_string()) },
            checked_at,
            meta: Map::new(),
        }
    }

    fn t(min: u32, sec: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, min, sec).unwrap()
    }

    #[test]
    fn test_service_upsert_and_registry() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        let mut api = service("api");
        api.headers.insert("Authorization".to_string(), "Bearer x".to_string());
        let (id, created) = store.upsert_service(&api).unwrap();
        assert!(created);

        let mut disabled = service("legacy");
        disabled.enabled = false;
        store.upsert_service(&disabled).unwrap();

        api.timeout_s = 9;
        let (same_id, created) = store.upsert_service(&api).unwrap();
        assert_eq!(same_id, id);
        assert!(!created);

        let fetched = store.get(id).unwrap();
        assert_eq!(fetched.timeout_s, 9);
        assert_eq!(fetched.headers["Authorization"], "Bearer x");

        let enabled = store.list_enabled().unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].name, "api");
        assert_eq!(store.list_services().unwrap().len(), 2);
        assert!(matches!(store.get(999), Err(StoreError::NotFound)));
    }

    #[test]
    fn test_upsert_rejects_invalid_service() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        let mut bad_path = service("a");
        bad_path.health_path = "health".to_string();
        assert!(matches!(
            store.upsert_service(&bad_path),
            Err(StoreError::InvalidService(_))
        ));

        let mut relative = service("b");
        relative.base_url = "example.com".to_string();
        assert!(store.upsert_service(&relative).is_err());

        let mut zero_timeout = service("c");
        zero_timeout.timeout_s = 0;
        assert!(store.upsert_service(&zero_timeout).is_err());
    }

    #[test]
    fn test_checked_at_strictly_increases_per_service() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let (a, _) = store.upsert_service(&service("a")).unwrap();
        let (b, _) = store.upsert_service(&service("b")).unwrap();

        let first = store.append_result(result_at(a, t(0, 0), true)).unwrap();
        let tie = store.append_result(result_at(a, t(0, 0), true)).unwrap();
        let backwards = store.append_result(result_at(a, t(0, 0) - ChronoDuration::seconds(5), true)).unwrap();
        let other = store.append_result(result_at(b, t(0, 0), true)).unwrap();

        assert!(tie.checked_at > first.checked_at);
        assert!(backwards.checked_at > tie.checked_at);
        // Other services are not affected.
        assert_eq!(other.checked_at, t(0, 0));

        let listed = store
            .list_results(&ResultFilter { service_id: Some(a), ..Default::default() })
            .unwrap();
        let times: Vec<_> = listed.iter().map(|r| r.checked_at).collect();
        assert_eq!(times, vec![backwards.checked_at, tie.checked_at, first.checked_at]);
    }

    #[test]
    fn test_list_results_window_is_inclusive() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let (a, _) = store.upsert_service(&service("a")).unwrap();
        let (b, _) = store.upsert_service(&service("b")).unwrap();

        for min in 0..6 {
            store.append_result(result_at(a, t(min, 0), min % 2 == 0)).unwrap();
            store.append_result(result_at(b, t(min, 30), true)).unwrap();
        }

        let window = store
            .list_results(&ResultFilter::window(Some(a), t(1, 0), t(4, 0)))
            .unwrap();
        let times: Vec<_> = window.iter().map(|r| r.checked_at).collect();
        assert_eq!(times, vec![t(4, 0), t(3, 0), t(2, 0), t(1, 0)]);

        let all = store
            .list_results(&ResultFilter::window(None, t(1, 0), t(4, 0)))
            .unwrap();
        assert_eq!(all.len(), 7);
        assert!(all.windows(2).all(|w| w[0].checked_at >= w[1].checked_at));

        let limited = store
            .list_results(&ResultFilter { limit: Some(2), ..Default::default() })
            .unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].checked_at, t(5, 30));
    }

    #[test]
    fn test_result_roundtrip_preserves_fields() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let (a, _) = store.upsert_service(&service("a")).unwrap();

        let mut meta = Map::new();
        meta.insert("headers".to_string(), json!({"content-type": "application/json"}));
        let appended = store
            .append_result(NewProbeResult {
                service_id: a,
                status_code: Some(503),
                ok: false,
                latency_ms: Some(41.125),
                error_text: None,
                checked_at: t(7, 0),
                meta,
            })
            .unwrap();

        let listed = store.list_results(&ResultFilter::default()).unwrap();
        assert_eq!(listed, vec![appended]);
    }

    #[test]
    fn test_latest_result_per_service() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let (a, _) = store.upsert_service(&service("a")).unwrap();
        let (b, _) = store.upsert_service(&service("b")).unwrap();

        store.append_result(result_at(a, t(0, 0), true)).unwrap();
        let latest_a = store.append_result(result_at(a, t(1, 0), false)).unwrap();
        let latest_b = store.append_result(result_at(b, t(0, 30), true)).unwrap();

        let latest = store.latest_result_per_service().unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[&a], latest_a);
        assert_eq!(latest[&b], latest_b);
    }

    #[test]
    fn test_digests_and_service_deletion() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let (a, _) = store.upsert_service(&service("a")).unwrap();
        store.append_result(result_at(a, t(0, 0), true)).unwrap();

        let digest = store
            .append_digest(NewDigest {
                service_id: Some(a),
                period_start: t(0, 0),
                period_end: t(30, 0),
                anomalies: vec![Anomaly::Point { ts: t(0, 0), score: Some(-0.2) }],
                summary_text: "Summary".to_string(),
                created_at: t(30, 0),
            })
            .unwrap();
        let global = store
            .append_digest(NewDigest {
                service_id: None,
                period_start: t(0, 0),
                period_end: t(30, 0),
                anomalies: vec![Anomaly::ServiceCount { service: "a".to_string(), count: 1 }],
                summary_text: "Summary".to_string(),
                created_at: t(31, 0),
            })
            .unwrap();

        assert_eq!(store.latest_digest(Some(a)).unwrap(), Some(digest.clone()));
        assert_eq!(store.latest_digest(None).unwrap(), Some(global.clone()));

        // A newer service digest does not replace the system-wide one.
        let newer = store
            .append_digest(NewDigest {
                service_id: Some(a),
                period_start: t(10, 0),
                period_end: t(40, 0),
                anomalies: vec![],
                summary_text: "Later".to_string(),
                created_at: t(40, 0),
            })
            .unwrap();
        assert_eq!(store.latest_digest(None).unwrap(), Some(global));
        assert_eq!(store.latest_digest(Some(a)).unwrap(), Some(newer));

        store.delete_service(a).unwrap();
        assert!(store.list_results(&ResultFilter::default()).unwrap().is_empty());
        assert!(store.latest_digest(Some(a)).unwrap().is_none());

        let orphaned = store.list_digests(None, 10).unwrap();
        assert_eq!(orphaned.len(), 2);
        assert!(orphaned.iter().all(|d| d.service_id.is_none()));
        assert!(matches!(store.delete_service(a), Err(StoreError::NotFound)));
    }

    #[test]
    fn test_digest_period_must_be_ordered() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        let result = store.append_digest(NewDigest {
            service_id: None,
            period_start: t(30, 0),
            period_end: t(0, 0),
            anomalies: vec![],
            summary_text: "Summary".to_string(),
            created_at: t(30, 0),
        });
        assert!(matches!(result, Err(StoreError::Sqlite(_))));
    }
}
