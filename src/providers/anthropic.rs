//! Anthropic-style messages adapter
//!
//! Speaks `POST {endpoint}` with `x-api-key` and
//! `anthropic-version: 2023-06-01` headers. System content is extracted
//! out of the message list into the dedicated `system` slot. Token
//! counts come from `usage.input_tokens` / `usage.output_tokens`.

use super::{
    build_messages, completed_response, extract_system, failed_response, http_error,
    transport_error, CostTable, ProviderAdapter, StreamOptions, WireMessage,
};
use crate::error::Result;
use crate::types::{HandoffRequest, HandoffResponse, ProviderConfig, TokenUsage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: usize,
    #[serde(default)]
    output_tokens: usize,
}

/// Streamed event payload; only the delta and usage fields matter here
#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(default)]
    delta: Option<StreamDelta>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    message: Option<StreamMessage>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    #[serde(default)]
    usage: Option<Usage>,
}

/// Adapter for Anthropic-compatible endpoints
pub struct AnthropicAdapter {
    client: reqwest::Client,
    costs: CostTable,
}

impl AnthropicAdapter {
    pub fn new(request_timeout: Duration, costs: CostTable) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self { client, costs })
    }

    fn body(req: &HandoffRequest, cfg: &ProviderConfig, stream: bool) -> AnthropicRequest {
        AnthropicRequest {
            model: cfg.model.clone(),
            max_tokens: req.options.max_tokens,
            system: extract_system(req),
            messages: build_messages(req, false),
            temperature: req.options.temperature,
            stream,
        }
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    async fn health_check(&self, cfg: &ProviderConfig) -> bool {
        // No unauthenticated probe exists; a resolvable key and endpoint
        // is the availability signal.
        cfg.resolve_api_key().is_some() && !cfg.endpoint.is_empty()
    }

    async fn send(&self, req: &HandoffRequest, cfg: &ProviderConfig) -> HandoffResponse {
        let started = Instant::now();

        let Some(api_key) = cfg.resolve_api_key() else {
            return failed_response(
                req,
                cfg,
                started,
                format!("config: no API key for provider '{}'", cfg.name),
            );
        };

        let response = match self
            .client
            .post(&cfg.endpoint)
            .header("x-api-key", &api_key)
            .header("anthropic-version", "2023-06-01")
            .header("Content-Type", "application/json")
            .json(&Self::body(req, cfg, false))
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

        let data: AnthropicResponse = match response.json().await {
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

        let Some(content) = data.content.first().map(|c| c.text.clone()) else {
            return failed_response(
                req,
                cfg,
                started,
                "protocol: empty content in response".to_string(),
            );
        };

        let tokens = TokenUsage::new(data.usage.input_tokens, data.usage.output_tokens);
        completed_response(req, cfg, started, content, tokens, &self.costs)
    }

    async fn stream(
        &self,
        req: &HandoffRequest,
        cfg: &ProviderConfig,
        opts: &StreamOptions,
    ) -> HandoffResponse {
        let started = Instant::now();

        let Some(api_key) = cfg.resolve_api_key() else {
            return failed_response(
                req,
                cfg,
                started,
                format!("config: no API key for provider '{}'", cfg.name),
            );
        };

        let response = match self
            .client
            .post(&cfg.endpoint)
            .header("x-api-key", &api_key)
            .header("anthropic-version", "2023-06-01")
            .header("Content-Type", "application/json")
            .json(&Self::body(req, cfg, true))
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

        let consume = async {
            let mut response = response;
            let mut buffer = String::new();
            let mut content = String::new();
            let mut usage = Usage::default();

            while let Some(chunk) = response.chunk().await? {
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);
                    let Some(payload) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if let Ok(event) = serde_json::from_str::<StreamEvent>(payload) {
                        if let Some(text) = event.delta.and_then(|d| d.text) {
                            content.push_str(&text);
                        }
                        if let Some(u) = event.usage {
                            usage.output_tokens = usage.output_tokens.max(u.output_tokens);
                            usage.input_tokens = usage.input_tokens.max(u.input_tokens);
                        }
                        if let Some(u) = event.message.and_then(|m| m.usage) {
                            usage.input_tokens = usage.input_tokens.max(u.input_tokens);
                        }
                    }
                }
            }
            Ok::<_, reqwest::Error>((content, usage))
        };

        match tokio::time::timeout(opts.timeout, consume).await {
            Ok(Ok((content, usage))) => {
                let tokens = TokenUsage::new(usage.input_tokens, usage.output_tokens);
                completed_response(req, cfg, started, content, tokens, &self.costs)
            }
            Ok(Err(e)) => failed_response(req, cfg, started, transport_error(&e)),
            Err(_) => failed_response(
                req,
                cfg,
                started,
                format!("timeout: stream exceeded {:?}", opts.timeout),
            ),
        }
    }
}
