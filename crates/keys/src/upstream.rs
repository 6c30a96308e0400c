//! External collaborators the core consumes. These are out of scope
//! for this subsystem's implementation — the HTTP/streaming client, request
//! transformation, and log persistence live elsewhere — but the key
//! lifecycle code is written against these trait boundaries so it never
//! depends on a concrete transport or sink.

use async_trait::async_trait;
use keygate_domain::Result;

use crate::key::Key;

/// A minimal chat-style request, just enough for the key lifecycle
/// subsystem's verification ping and the example call path. Real request
/// shaping/streaming assembly is a different subsystem's job.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub prompt: String,
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub text: String,
}

/// `generate(model, request, key)` — throws on any non-2xx or transport
/// error with an exception whose stringification includes the HTTP status
/// code. Implementations live outside this subsystem (see `UpstreamConfig`
/// for where the concrete HTTP adapter is wired in the gateway binary).
#[async_trait]
pub trait UpstreamChatService: Send + Sync {
    async fn generate(&self, model: &str, request: &ChatRequest, key: &Key) -> Result<ChatResponse>;
}

/// A single classified-error record.
#[derive(Debug, Clone)]
pub struct ErrorLogRecord {
    pub key: Option<Key>,
    pub model: Option<String>,
    pub category: String,
    pub code: Option<u16>,
    pub raw_error: String,
    pub attempt_index: u32,
}

/// Append-only sink for classified errors. Must be fire-and-forget:
/// failures to log must never propagate back to the caller.
pub trait ErrorLogSink: Send + Sync {
    fn record(&self, entry: ErrorLogRecord);
}

/// A single completed-request record.
#[derive(Debug, Clone)]
pub struct RequestLogRecord {
    pub model: String,
    pub key: Key,
    pub success: bool,
    pub status_code: Option<u16>,
    pub latency_ms: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Append-only sink for request outcomes; same fire-and-forget contract as
/// [`ErrorLogSink`].
pub trait RequestLogSink: Send + Sync {
    fn record(&self, entry: RequestLogRecord);
}

/// A sink that drops everything. Useful for tests and for a gateway
/// configuration that hasn't wired persistence yet.
pub struct NullLogSink;

impl ErrorLogSink for NullLogSink {
    fn record(&self, _entry: ErrorLogRecord) {}
}

impl RequestLogSink for NullLogSink {
    fn record(&self, _entry: RequestLogRecord) {}
}
