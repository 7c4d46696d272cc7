//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// HTTP methods a health endpoint may be probed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Head,
    Put,
    Patch,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Head => "HEAD",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "HEAD" => Ok(HttpMethod::Head),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            other => Err(format!("unsupported HTTP method: {}", other)),
        }
    }
}

/// A monitored service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: i64,
    pub name: String,
    pub base_url: String,
    pub health_path: String,
    pub method: HttpMethod,
    pub headers: BTreeMap<String, String>,
    pub timeout_s: u32,
    pub enabled: bool,
}

impl Default for Service {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            base_url: String::new(),
            health_path: "/health".to_string(),
            method: HttpMethod::Get,
            headers: BTreeMap::new(),
            timeout_s: 5,
            enabled: true,
        }
    }
}

impl Service {
    /// The URL a probe is sent to: the base URL without trailing slashes,
    /// followed by the health path.
    pub fn health_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.health_path)
    }
}

/// A probe result about to be appended. The store may move `checked_at`
/// forward to keep per-service timestamps strictly increasing.
#[derive(Debug, Clone)]
pub struct NewProbeResult {
    pub service_id: i64,
    pub status_code: Option<u16>,
    pub ok: bool,
    pub latency_ms: Option<f64>,
    pub error_text: Option<String>,
    pub checked_at: DateTime<Utc>,
    pub meta: Map<String, Value>,
}

/// A stored probe result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeResult {
    pub id: i64,
    pub service_id: i64,
    pub status_code: Option<u16>,
    pub ok: bool,
    pub latency_ms: Option<f64>,
    pub error_text: Option<String>,
    pub checked_at: DateTime<Utc>,
    pub meta: Map<String, Value>,
}

/// One entry of a digest's anomaly list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Anomaly {
    /// A single outlying probe result (service digests).
    Point {
        ts: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        score: Option<f64>,
    },
    /// Number of outliers found for one service (system-wide digest).
    ServiceCount { service: String, count: usize },
}

/// A digest about to be appended.
#[derive(Debug, Clone)]
pub struct NewDigest {
    pub service_id: Option<i64>,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub anomalies: Vec<Anomaly>,
    pub summary_text: String,
    pub created_at: DateTime<Utc>,
}

/// A stored analysis digest. `service_id` is `None` for system-wide digests
/// and for digests whose service has since been deleted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Digest {
    pub id: i64,
    pub service_id: Option<i64>,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub anomalies: Vec<Anomaly>,
    pub summary_text: String,
    pub created_at: DateTime<Utc>,
}

/// Range filter for result queries. Bounds are inclusive.
#[derive(Debug, Clone, Default)]
pub struct ResultFilter {
    pub service_id: Option<i64>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

impl ResultFilter {
    pub fn window(service_id: Option<i64>, since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        Self {
            service_id,
            since: Some(since),
            until: Some(until),
            limit: None,
        }
    }
}
