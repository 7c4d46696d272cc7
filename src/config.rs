//! Configuration module for healthtrail.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use thiserror::Error;

/// Configuration errors surfaced at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid cron expression {expr:?}: {reason}")]
    InvalidCron { expr: String, reason: String },
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid service entry {name:?}: {reason}")]
    InvalidService { name: String, reason: String },
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the read API (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "healthtrail.db")
    pub db_path: String,
    /// Services to seed at startup, if the file exists (default: "services.json")
    pub services_json: String,
    /// JSON-lines probe log (default: "logs/health.log")
    pub health_log_path: String,
    /// When to run probe sweeps (default: every 5 minutes)
    pub probe_cron: String,
    /// When to run the analyzer, local time (default: daily at 02:00)
    pub analysis_cron: String,
    /// Length of the analysis window in hours (default: 24)
    pub analysis_window_hours: u32,
    /// Upper bound on concurrent probes; `None` probes every service at once
    pub max_concurrent_probes: Option<usize>,
    /// Credential for the external summarizer; unset disables it
    pub external_api_key: Option<String>,
    /// Base URL of the OpenAI-compatible summarization API
    pub external_api_url: String,
    /// Model requested from the summarization API
    pub external_model: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "healthtrail.db".to_string(),
            services_json: "services.json".to_string(),
            health_log_path: "logs/health.log".to_string(),
            probe_cron: "*/5 * * * *".to_string(),
            analysis_cron: "0 2 * * *".to_string(),
            analysis_window_hours: 24,
            max_concurrent_probes: None,
            external_api_key: None,
            external_api_url: "https://api.openai.com/v1".to_string(),
            external_model: "gpt-4o-mini".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables (all prefixed `HEALTHTRAIL_`):
    /// - `HTTP_PORT`, `DB_PATH`, `SERVICES_JSON`, `HEALTH_LOG`
    /// - `PROBE_CRON`, `ANALYSIS_CRON`, `ANALYSIS_WINDOW_HOURS`
    /// - `MAX_CONCURRENT_PROBES`
    /// - `EXTERNAL_API_KEY`, `EXTERNAL_API_URL`, `EXTERNAL_MODEL`
    ///
    /// Values that fail to parse keep their default.
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        let var = |name: &str| {
            lookup(&format!("HEALTHTRAIL_{}", name))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        set_parsed(&mut cfg.http_port, var("HTTP_PORT"));
        set_parsed(&mut cfg.analysis_window_hours, var("ANALYSIS_WINDOW_HOURS"));
        if cfg.analysis_window_hours == 0 {
            cfg.analysis_window_hours = 24;
        }

        if let Some(v) = var("DB_PATH") {
            cfg.db_path = v;
        }
        if let Some(v) = var("SERVICES_JSON") {
            cfg.services_json = v;
        }
        if let Some(v) = var("HEALTH_LOG") {
            cfg.health_log_path = v;
        }
        if let Some(v) = var("PROBE_CRON") {
            cfg.probe_cron = v;
        }
        if let Some(v) = var("ANALYSIS_CRON") {
            cfg.analysis_cron = v;
        }
        if let Some(v) = var("EXTERNAL_API_URL") {
            cfg.external_api_url = v;
        }
        if let Some(v) = var("EXTERNAL_MODEL") {
            cfg.external_model = v;
        }

        cfg.max_concurrent_probes = var("MAX_CONCURRENT_PROBES")
            .and_then(|v| v.parse().ok())
            .filter(|n: &usize| *n > 0);
        cfg.external_api_key = var("EXTERNAL_API_KEY");

        cfg
    }
}

fn set_parsed<T: FromStr>(slot: &mut T, raw: Option<String>) {
    if let Some(value) = raw.and_then(|v| v.parse().ok()) {
        *slot = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load_from(pairs: &[(&str, &str)]) -> ServerConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.db_path, "healthtrail.db");
        assert_eq!(cfg.probe_cron, "*/5 * * * *");
        assert_eq!(cfg.analysis_cron, "0 2 * * *");
        assert_eq!(cfg.analysis_window_hours, 24);
        assert!(cfg.max_concurrent_probes.is_none());
        assert!(cfg.external_api_key.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let cfg = load_from(&[
            ("HEALTHTRAIL_HTTP_PORT", "9090"),
            ("HEALTHTRAIL_PROBE_CRON", "*/1 * * * *"),
            ("HEALTHTRAIL_ANALYSIS_WINDOW_HOURS", "6"),
            ("HEALTHTRAIL_MAX_CONCURRENT_PROBES", "4"),
            ("HEALTHTRAIL_EXTERNAL_API_KEY", "sk-test"),
        ]);
        assert_eq!(cfg.http_port, 9090);
        assert_eq!(cfg.probe_cron, "*/1 * * * *");
        assert_eq!(cfg.analysis_window_hours, 6);
        assert_eq!(cfg.max_concurrent_probes, Some(4));
        assert_eq!(cfg.external_api_key.as_deref(), Some("sk-test"));
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let cfg = load_from(&[
            ("HEALTHTRAIL_HTTP_PORT", "not-a-port"),
            ("HEALTHTRAIL_ANALYSIS_WINDOW_HOURS", "0"),
            ("HEALTHTRAIL_MAX_CONCURRENT_PROBES", "0"),
            ("HEALTHTRAIL_EXTERNAL_API_KEY", "   "),
        ]);
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.analysis_window_hours, 24);
        assert!(cfg.max_concurrent_probes.is_none());
        assert!(cfg.external_api_key.is_none());
    }
}
