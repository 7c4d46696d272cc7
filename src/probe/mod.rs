//! Probe module for HTTP health checks.
//!
//! A [`Prober`] performs exactly one request. [`probe_with_retry`] wraps it
//! in the fixed retry policy and produces a [`ProbeOutcome`].

mod http;
mod log;
mod retry;

pub use http::*;
pub use log::*;
pub use retry::*;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::db::Service;

/// Classification of a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    ConnectError,
    ReadError,
    ConnectTimeout,
    ReadTimeout,
    ProtocolError,
    OtherTransport,
    /// Not a network failure at all, e.g. a malformed URL or header.
    NonTransport,
}

impl TransportErrorKind {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportErrorKind::ConnectError
                | TransportErrorKind::ReadError
                | TransportErrorKind::ConnectTimeout
                | TransportErrorKind::ReadTimeout
                | TransportErrorKind::ProtocolError
        )
    }

    #[cfg(test)]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            TransportErrorKind::ConnectTimeout | TransportErrorKind::ReadTimeout
        )
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportErrorKind::ConnectError => "ConnectError",
            TransportErrorKind::ReadError => "ReadError",
            TransportErrorKind::ConnectTimeout => "ConnectTimeout",
            TransportErrorKind::ReadTimeout => "ReadTimeout",
            TransportErrorKind::ProtocolError => "ProtocolError",
            TransportErrorKind::OtherTransport => "TransportError",
            TransportErrorKind::NonTransport => "RequestError",
        };
        f.write_str(name)
    }
}

/// A request that produced no HTTP response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// A received HTTP response, whatever its status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
}

/// Performs a single, timeout-bounded request against a service.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, service: &Service) -> Result<RawResponse, TransportError>;
}
