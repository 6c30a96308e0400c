use std::sync::Arc;

use keygate_domain::config::Config;
use keygate_keys::{KeyLifecycle, UpstreamChatService};

use crate::log_sink::{ErrorLogWorker, RequestLogWorker};

/// Shared application state passed to all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub lifecycle: Arc<KeyLifecycle>,
    pub upstream: Arc<dyn UpstreamChatService>,
    pub error_log: Arc<ErrorLogWorker>,
    pub request_log: Arc<RequestLogWorker>,
    /// SHA-256 hash of the API bearer token (read once at startup).
    /// `None` = dev mode (no auth enforced).
    pub api_token_hash: Option<Vec<u8>>,
}
