//! Local Ollama adapter
//!
//! Speaks `POST {endpoint}/api/chat` with streaming disabled. Token
//! counts come from `prompt_eval_count` and `eval_count`.

use super::{
    build_messages, completed_response, failed_response, http_error, transport_error, CostTable,
    ProviderAdapter, WireMessage,
};
use crate::error::Result;
use crate::types::{HandoffRequest, HandoffResponse, ProviderConfig, TokenUsage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: usize,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    message: OllamaMessage,
    #[serde(default)]
    prompt_eval_count: usize,
    #[serde(default)]
    eval_count: usize,
}

#[derive(Debug, Deserialize)]
struct OllamaMessage {
    content: String,
}

/// Adapter for a local Ollama server
pub struct OllamaAdapter {
    client: reqwest::Client,
    costs: CostTable,
}

impl OllamaAdapter {
    pub fn new(request_timeout: Duration, costs: CostTable) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self { client, costs })
    }
}

#[async_trait]
impl ProviderAdapter for OllamaAdapter {
    async fn health_check(&self, cfg: &ProviderConfig) -> bool {
        let url = format!("{}/api/tags", cfg.endpoint.trim_end_matches('/'));
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Ollama health check failed for {}: {}", cfg.name, e);
                false
            }
        }
    }

    async fn send(&self, req: &HandoffRequest, cfg: &ProviderConfig) -> HandoffResponse {
        let started = Instant::now();
        let url = format!("{}/api/chat", cfg.endpoint.trim_end_matches('/'));

        let body = OllamaRequest {
            model: cfg.model.clone(),
            messages: build_messages(req, true),
            stream: false,
            options: OllamaOptions {
                temperature: req.options.temperature,
                num_predict: req.options.max_tokens,
            },
        };

        let response = match self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return failed_response(req, cfg, started, transport_error(&e)),
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return failed_response(req, cfg, started, http_error(status, &body));
        }

        let data: OllamaResponse = match response.json().await {
            Ok(d) => d,
            Err(e) => {
                return failed_response(
                    req,
                    cfg,
                    started,
                    format!("protocol: failed to parse response: {}", e),
                )
            }
        };

        let tokens = TokenUsage::new(data.prompt_eval_count, data.eval_count);
        completed_response(req, cfg, started, data.message.content, tokens, &self.costs)
    }
}
