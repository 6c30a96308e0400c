//! POST /v1/chat — the end-to-end request path: pull a key from the
//! lifecycle's current generation, drive the upstream call through the
//! bounded retry handler, and record the outcome.

use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};

use keygate_keys::classifier::extract_status_code;
use keygate_keys::{with_retry, ChatRequest, RequestLogRecord};

use crate::auth::ApiGuard;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct ChatBody {
    pub model: String,
    pub prompt: String,
}

#[derive(Serialize)]
struct ChatResult {
    text: String,
}

fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

pub async fn chat(_guard: ApiGuard, State(state): State<AppState>, Json(body): Json<ChatBody>) -> Response {
    let gen = state.lifecycle.current();

    let key = match gen.get_key(Some(&body.model)).await {
        Ok(k) => k,
        Err(e) => return api_error(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    };

    let request = ChatRequest {
        model: body.model.clone(),
        prompt: body.prompt,
    };
    let model = body.model.clone();
    let started = Instant::now();
    let upstream = state.upstream.clone();

    let result = with_retry(
        &gen.registry,
        state.error_log.as_ref(),
        state.config.retry.max_retries,
        key.clone(),
        Some(&model),
        |attempt_key| {
            let request = request.clone();
            let model = model.clone();
            let upstream = upstream.clone();
            async move { upstream.generate(&model, &request, &attempt_key).await }
        },
    )
    .await;

    let latency_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(response) => {
            state.request_log.record(RequestLogRecord {
                model,
                key,
                success: true,
                status_code: Some(200),
                latency_ms,
                timestamp: chrono::Utc::now(),
            });
            Json(ChatResult { text: response.text }).into_response()
        }
        Err(e) => {
            let raw = e.to_string();
            let status_code = extract_status_code(&raw);
            state.request_log.record(RequestLogRecord {
                model,
                key,
                success: false,
                status_code,
                latency_ms,
                timestamp: chrono::Utc::now(),
            });
            api_error(StatusCode::BAD_GATEWAY, raw)
        }
    }
}
