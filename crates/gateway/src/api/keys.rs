//! Observability endpoints over the key registry and pool (§6.3). Admin-
//! guarded: these expose failure counters per key, which is operationally
//! sensitive even though keys themselves are redacted before serialization.

use axum::extract::State;
use axum::response::{IntoResponse, Json};
use std::collections::HashMap;

use crate::auth::ApiGuard;
use crate::state::AppState;

pub async fn status(_guard: ApiGuard, State(state): State<AppState>) -> impl IntoResponse {
    let gen = state.lifecycle.current();
    let snapshot = gen.registry.snapshot_by_status();

    let valid: HashMap<String, u32> = snapshot
        .valid
        .into_iter()
        .map(|(k, n)| (k.redacted(), n))
        .collect();
    let invalid: HashMap<String, u32> = snapshot
        .invalid
        .into_iter()
        .map(|(k, n)| (k.redacted(), n))
        .collect();

    Json(serde_json::json!({ "valid": valid, "invalid": invalid }))
}

pub async fn pool_stats(_guard: ApiGuard, State(state): State<AppState>) -> impl IntoResponse {
    let gen = state.lifecycle.current();
    let stats = gen.pool.stats();
    Json(serde_json::json!({
        "pool_size": stats.pool_size,
        "current_size": stats.current_size,
        "utilization": stats.utilization,
        "hits": stats.hits,
        "misses": stats.misses,
        "hit_rate": stats.hit_rate,
        "refills_scheduled": stats.refills_scheduled,
        "expired_evictions": stats.expired_evictions,
        "verification_success": stats.verification_success,
        "verification_failure": stats.verification_failure,
        "verification_success_rate": stats.verification_success_rate,
        "avg_key_age_seconds": stats.avg_key_age_seconds,
        "error_log_dropped": state.error_log.dropped(),
        "request_log_dropped": state.request_log.dropped(),
    }))
}
