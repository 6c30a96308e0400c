//! Fire-and-forget log sinks: a bounded channel plus a background worker.
//! `ErrorLogSink`/`RequestLogSink` implementations must never block or
//! propagate a failure to the caller, so `record` does a non-blocking
//! `try_send` and drops the entry (counted) on backpressure rather than
//! awaiting a full channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use keygate_keys::{ErrorLogRecord, ErrorLogSink, RequestLogRecord, RequestLogSink};
use tokio::sync::mpsc;

const CHANNEL_CAPACITY: usize = 1024;

/// Logs error records as structured `tracing` events on a background task.
/// Persistence to a durable sink (database, file) is a different
/// subsystem's job; this is the write-only sink boundary the key lifecycle
/// code is written against.
pub struct ErrorLogWorker {
    tx: mpsc::Sender<ErrorLogRecord>,
    dropped: Arc<AtomicU64>,
}

impl ErrorLogWorker {
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::channel::<ErrorLogRecord>(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                tracing::warn!(
                    key = entry.key.as_ref().map(|k| k.redacted()),
                    model = entry.model.as_deref(),
                    category = %entry.category,
                    code = entry.code,
                    attempt = entry.attempt_index,
                    raw_error = %entry.raw_error,
                    "upstream error classified"
                );
            }
        });
        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl ErrorLogSink for ErrorLogWorker {
    fn record(&self, entry: ErrorLogRecord) {
        if self.tx.try_send(entry).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Same fire-and-forget contract as [`ErrorLogWorker`], for completed
/// request outcomes.
pub struct RequestLogWorker {
    tx: mpsc::Sender<RequestLogRecord>,
    dropped: Arc<AtomicU64>,
}

impl RequestLogWorker {
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::channel::<RequestLogRecord>(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                tracing::info!(
                    key = %entry.key.redacted(),
                    model = %entry.model,
                    success = entry.success,
                    status_code = entry.status_code,
                    latency_ms = entry.latency_ms,
                    timestamp = %entry.timestamp,
                    "request completed"
                );
            }
        });
        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl RequestLogSink for RequestLogWorker {
    fn record(&self, entry: RequestLogRecord) {
        if self.tx.try_send(entry).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keygate_keys::Key;

    #[tokio::test]
    async fn error_log_records_without_blocking() {
        let worker = ErrorLogWorker::spawn();
        worker.record(ErrorLogRecord {
            key: Some(Key::new("sk-test")),
            model: Some("gemini-x".into()),
            category: "rate_limit".into(),
            code: Some(429),
            raw_error: "status code 429".into(),
            attempt_index: 1,
        });
        assert_eq!(worker.dropped(), 0);
    }

    #[tokio::test]
    async fn error_log_counts_drops_under_backpressure() {
        let (tx, _rx) = mpsc::channel::<ErrorLogRecord>(1);
        let worker = ErrorLogWorker {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        // Channel capacity is 1 and nothing drains it, so the first send
        // fills the slot and subsequent ones overflow.
        for _ in 0..5 {
            worker.record(ErrorLogRecord {
                key: None,
                model: None,
                category: "unknown".into(),
                code: None,
                raw_error: "x".into(),
                attempt_index: 0,
            });
        }
        assert!(worker.dropped() > 0);
    }
}
