//! Key lifecycle management for a multi-key upstream proxy: rotation,
//! cooldown, error classification, a TTL'd ready pool, and a background
//! verifier, tied together by a single hot-reloadable lifecycle handle.

pub mod classifier;
pub mod cursor;
pub mod key;
pub mod lifecycle;
pub mod pool;
pub mod registry;
pub mod retry;
pub mod upstream;
pub mod verifier;

pub use classifier::{ErrorCategory, ErrorClassifier};
pub use cursor::RotationCursor;
pub use key::Key;
pub use lifecycle::{Generation, KeyLifecycle};
pub use pool::{PoolStats, ValidKeyEntry, ValidKeyPool, ValidKeyPoolConfig};
pub use registry::{KeyRegistry, KeyStatusSnapshot};
pub use retry::with_retry;
pub use upstream::{
    ChatRequest, ChatResponse, ErrorLogRecord, ErrorLogSink, NullLogSink, RequestLogRecord,
    RequestLogSink, UpstreamChatService,
};
pub use verifier::{ScheduledVerifier, VerifierConfig};
