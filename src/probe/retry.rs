//! Fixed, bounded retry around a [`Prober`].

use std::collections::BTreeMap;
use std::time::Duration;

use super::{Prober, TransportError};
use crate::clock::Clock;
use crate::db::Service;

/// Retries after the first attempt.
pub const MAX_RETRIES: usize = 2;

/// Back-off slept before attempt 2 and attempt 3.
pub const BACKOFFS: [Duration; MAX_RETRIES] =
    [Duration::from_millis(500), Duration::from_millis(1500)];

/// Final outcome of one probe attempt sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub status_code: Option<u16>,
    /// True only for a 2xx/3xx response.
    pub ok: bool,
    /// Start of the first attempt to the final outcome, back-offs included.
    pub latency_ms: f64,
    /// `"<Kind>: <message>"` when no attempt produced a response.
    pub error_text: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub attempts: u32,
}

/// Probe `service`, retrying transient transport failures.
///
/// Any HTTP response ends the sequence, whatever its status. Never fails:
/// exhausted retries come back as an outcome with `error_text` set.
pub async fn probe_with_retry(
    prober: &dyn Prober,
    clock: &dyn Clock,
    service: &Service,
) -> ProbeOutcome {
    let start = clock.monotonic();
    let mut attempts: u32 = 0;

    let result = loop {
        attempts += 1;
        match prober.probe(service).await {
            Ok(response) => break Ok(response),
            Err(err) if err.kind.is_retryable() && (attempts as usize) <= MAX_RETRIES => {
                let backoff = BACKOFFS[attempts as usize - 1];
                tracing::debug!(
                    service = %service.name,
                    attempt = attempts,
                    error = %err,
                    "probe attempt failed, retrying in {:?}",
                    backoff
                );
                clock.sleep(backoff).await;
            }
            Err(err) => break Err(err),
        }
    };

    let latency_ms = round_ms(clock.monotonic().saturating_sub(start));

    match result {
        Ok(response) => ProbeOutcome {
            status_code: Some(response.status_code),
            ok: (200..400).contains(&response.status_code),
            latency_ms,
            error_text: None,
            headers: response.headers,
            attempts,
        },
        Err(TransportError { kind, message }) => ProbeOutcome {
            status_code: None,
            ok: false,
            latency_ms,
            error_text: Some(format!("{}: {}", kind, message)),
            headers: BTreeMap::new(),
            attempts,
        },
    }
}

/// Milliseconds rounded to three decimals.
fn round_ms(elapsed: Duration) -> f64 {
    (elapsed.as_secs_f64() * 1_000_000.0).round() / 1000.0
}
