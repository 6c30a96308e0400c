pub mod chat;
pub mod health;
pub mod keys;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

/// Build the full API router. Takes `state` only to match the call shape
/// used across the codebase when the router needs it to build middleware;
/// `with_state` is applied by the caller once all layers are attached.
pub fn router(_state: AppState) -> Router<AppState> {
    Router::new()
        .route("/v1/health", get(health::health))
        .route("/v1/keys", get(keys::status))
        .route("/v1/pool/stats", get(keys::pool_stats))
        .route("/v1/chat", post(chat::chat))
}
