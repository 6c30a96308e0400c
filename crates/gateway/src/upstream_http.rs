//! The real `UpstreamChatService`: a reqwest client hitting the
//! configured generative-AI provider. Request/response shaping here is
//! deliberately minimal — protocol translation and streaming assembly are
//! out of scope for this subsystem.

use std::time::Duration;

use async_trait::async_trait;
use keygate_domain::{Error, Result};
use keygate_keys::{ChatRequest, ChatResponse, Key, UpstreamChatService};
use serde::Deserialize;

pub struct HttpUpstreamChatService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpUpstreamChatService {
    pub fn new(base_url: String, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("building HTTP client: {e}")))?;
        Ok(Self { client, base_url })
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<ErrorDetail>,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: Option<String>,
}

#[async_trait]
impl UpstreamChatService for HttpUpstreamChatService {
    async fn generate(&self, model: &str, request: &ChatRequest, key: &Key) -> Result<ChatResponse> {
        let url = format!(
            "{}/v1beta/models/{model}:generateContent?key={}",
            self.base_url,
            key.as_str()
        );

        let body = serde_json::json!({
            "contents": [{ "parts": [{ "text": request.prompt }] }]
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Http(format!("request to {model}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&text)
                .ok()
                .and_then(|b| b.error)
                .and_then(|e| e.message)
                .unwrap_or(text);
            return Err(Error::Upstream {
                key: key.redacted(),
                message: format!("status code {} - {message}", status.as_u16()),
            });
        }

        let text = response
            .text()
            .await
            .map_err(|e| Error::Http(format!("reading response body: {e}")))?;

        Ok(ChatResponse { text })
    }
}
