//! Structured per-probe log.
//!
//! Every probe produces one [`ProbeLogRecord`]. It is emitted as a tracing
//! event and handed to a background writer that appends it as a JSON line to
//! the health log file. Hand-off never blocks: if the buffer is full the
//! record is dropped with a warning.

use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

const LOG_BUFFER: usize = 1024;
const FLUSH_THRESHOLD: usize = 100;
const FLUSH_INTERVAL: Duration = Duration::from_secs(2);

/// One probe, as written to the health log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeLogRecord {
    pub service: String,
    pub status: Option<u16>,
    pub ok: bool,
    pub latency_ms: f64,
    pub error: Option<String>,
    /// Unix seconds.
    pub ts: f64,
}

/// Handle used by the probe engine to emit records.
#[derive(Clone, Default)]
pub struct ProbeLog {
    tx: Option<mpsc::Sender<ProbeLogRecord>>,
}

impl ProbeLog {
    /// Emit records as tracing events only.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Start a background writer appending to `path`.
    ///
    /// The writer exits after every `ProbeLog` clone is dropped and the
    /// remaining records are flushed; await the handle to wait for that.
    pub fn spawn_file_writer(path: impl Into<PathBuf>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(LOG_BUFFER);
        let handle = tokio::spawn(run_log_writer(rx, path.into()));
        (Self { tx: Some(tx) }, handle)
    }

    #[cfg(test)]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ProbeLogRecord>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx: Some(tx) }, rx)
    }

    pub fn emit(&self, record: ProbeLogRecord) {
        match serde_json::to_string(&record) {
            Ok(line) => tracing::info!(target: "healthtrail::health", "{}", line),
            Err(e) => tracing::warn!("Failed to encode probe log record: {}", e),
        }

        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                tracing::warn!("Probe log buffer full, dropping record for {}", record.service);
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("Probe log writer has stopped");
            }
        }
    }
}

/// Accumulate records and append them to the log file in batches.
async fn run_log_writer(mut rx: mpsc::Receiver<ProbeLogRecord>, path: PathBuf) {
    let mut buffer: Vec<ProbeLogRecord> = Vec::with_capacity(FLUSH_THRESHOLD);
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);

    loop {
        tokio::select! {
            record = rx.recv() => {
                match record {
                    Some(r) => {
                        buffer.push(r);
                        if buffer.len() >= FLUSH_THRESHOLD {
                            flush_buffer(&path, &mut buffer).await;
                        }
                    }
                    None => {
                        // Channel closed, flush remaining and exit
                        flush_buffer(&path, &mut buffer).await;
                        break;
                    }
                }
            }
            _ = interval.tick() => {
                flush_buffer(&path, &mut buffer).await;
            }
        }
    }
}

async fn flush_buffer(path: &PathBuf, buffer: &mut Vec<ProbeLogRecord>) {
    if buffer.is_empty() {
        return;
    }

    let mut data = String::new();
    for record in buffer.iter() {
        match serde_json::to_string(record) {
            Ok(line) => {
                data.push_str(&line);
                data.push('\n');
            }
            Err(e) => tracing::warn!("Failed to encode probe log record: {}", e),
        }
    }
    buffer.clear();

    if let Err(e) = append(path, data.as_bytes()).await {
        tracing::error!("Failed to write probe log {}: {}", path.display(), e);
    }
}

async fn append(path: &PathBuf, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(data).await?;
    file.flush().await
}
