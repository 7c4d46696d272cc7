//! Seeding services from a JSON file at startup.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use super::models::{HttpMethod, Service};
use super::store::{Store, StoreError};
use crate::config::ConfigError;

/// One entry of the services file.
#[derive(Debug, Deserialize)]
struct ServiceEntry {
    name: String,
    base_url: String,
    #[serde(default = "default_health_path")]
    health_path: String,
    #[serde(default)]
    method: HttpMethod,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default = "default_timeout")]
    timeout_s: u32,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_timeout() -> u32 {
    5
}

fn default_enabled() -> bool {
    true
}

/// Upsert every service listed in `path`, matching existing services by name.
///
/// Returns the number of newly created services. Stops at the first invalid
/// entry; entries before it stay applied.
pub fn seed_services(store: &Store, path: &Path) -> Result<usize, ConfigError> {
    let display = path.display().to_string();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: display.clone(),
        source,
    })?;
    let entries: Vec<ServiceEntry> =
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })?;

    let mut created = 0;
    for entry in entries {
        let service = Service {
            id: 0,
            name: entry.name,
            base_url: entry.base_url,
            health_path: entry.health_path,
            method: entry.method,
            headers: entry.headers,
            timeout_s: entry.timeout_s,
            enabled: entry.enabled,
        };

        match store.upsert_service(&service) {
            Ok((_, true)) => created += 1,
            Ok((_, false)) => {}
            Err(StoreError::InvalidService(reason)) => {
                return Err(ConfigError::InvalidService {
                    name: service.name,
                    reason,
                })
            }
            Err(e) => {
                return Err(ConfigError::InvalidService {
                    name: service.name,
                    reason: e.to_string(),
                })
            }
        }
    }

    Ok(created)
}
