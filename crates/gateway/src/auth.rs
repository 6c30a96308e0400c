//! Bearer-token auth guard — `ApiGuard` Axum extractor.
//!
//! Uses SHA-256 + constant-time comparison so a partial-match timing leak
//! can't be used to recover the token byte by byte. If no token is
//! configured (`api_token_hash` is `None`), every request passes: that's
//! dev mode.

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::Json;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::state::AppState;

pub struct ApiGuard;

#[async_trait]
impl FromRequestParts<AppState> for ApiGuard {
    type Rejection = (StatusCode, Json<serde_json::Value>);

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let expected_hash = match &state.api_token_hash {
            Some(h) => h,
            None => return Ok(ApiGuard),
        };

        let provided = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .unwrap_or("");

        let provided_hash = Sha256::digest(provided.as_bytes());
        if !bool::from(provided_hash.ct_eq(expected_hash.as_slice())) {
            return Err((
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "error": "invalid API token" })),
            ));
        }
        Ok(ApiGuard)
    }
}
