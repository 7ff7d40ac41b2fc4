//! OpenAI-style chat completions adapter
//!
//! Speaks `POST {endpoint}` with `Authorization: Bearer`. Token counts
//! come from `usage.prompt_tokens` / `usage.completion_tokens`.

use super::{
    build_messages, completed_response, failed_response, http_error, transport_error, CostTable,
    ProviderAdapter, StreamOptions, WireMessage,
};
use crate::error::Result;
use crate::types::{HandoffRequest, HandoffResponse, ProviderConfig, TokenUsage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<WireMessage>,
    max_tokens: usize,
    temperature: f32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: usize,
    #[serde(default)]
    completion_tokens: usize,
    #[serde(default)]
    total_tokens: usize,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Adapter for OpenAI-compatible endpoints
pub struct OpenAiAdapter {
    client: reqwest::Client,
    costs: CostTable,
}

impl OpenAiAdapter {
    pub fn new(request_timeout: Duration, costs: CostTable) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self { client, costs })
    }

    fn body(req: &HandoffRequest, cfg: &ProviderConfig, stream: bool) -> OpenAiRequest {
        OpenAiRequest {
            model: cfg.model.clone(),
            messages: build_messages(req, true),
            max_tokens: req.options.max_tokens,
            temperature: req.options.temperature,
            stream,
        }
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    async fn health_check(&self, cfg: &ProviderConfig) -> bool {
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
            .bearer_auth(&api_key)
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

        let data: OpenAiResponse = match response.json().await {
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

        let Some(content) = data.choices.first().map(|c| c.message.content.clone()) else {
            return failed_response(
                req,
                cfg,
                started,
                "protocol: no choices in response".to_string(),
            );
        };

        let mut tokens = TokenUsage::new(data.usage.prompt_tokens, data.usage.completion_tokens);
        if data.usage.total_tokens > 0 {
            tokens.total = data.usage.total_tokens;
        }
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
            .bearer_auth(&api_key)
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
                    if payload == "[DONE]" {
                        continue;
                    }
                    if let Ok(event) = serde_json::from_str::<StreamChunk>(payload) {
                        if let Some(text) =
                            event.choices.first().and_then(|c| c.delta.content.clone())
                        {
                            content.push_str(&text);
                        }
                        if let Some(u) = event.usage {
                            usage = u;
                        }
                    }
                }
            }
            Ok::<_, reqwest::Error>((content, usage))
        };

        match tokio::time::timeout(opts.timeout, consume).await {
            Ok(Ok((content, usage))) => {
                let tokens = TokenUsage::new(usage.prompt_tokens, usage.completion_tokens);
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
