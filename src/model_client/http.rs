use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::debug;

use super::{ChatMessage, Completion, MessagePart, ModelClient, TokenUsage};
use crate::error::ProviderError;
use crate::evaluation::SamplingParams;

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
pub struct HttpModelClient {
    http_client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpModelClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(4)
            .build()?;
        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

/// Wire body for a chat completion request.
pub fn build_request_body(
    model: &str,
    messages: &[ChatMessage],
    params: &SamplingParams,
) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = messages
        .iter()
        .map(|m| {
            let only_text = m.parts.iter().all(|p| matches!(p, MessagePart::Text { .. }));
            let content = if only_text {
                serde_json::Value::String(m.text())
            } else {
                serde_json::Value::Array(
                    m.parts
                        .iter()
                        .map(|p| match p {
                            MessagePart::Text { text } => {
                                serde_json::json!({"type": "text", "text": text})
                            }
                            MessagePart::File { file_id, reference } => serde_json::json!({
                                "type": "file",
                                "file": {"file_id": file_id, "file_data": reference},
                            }),
                        })
                        .collect(),
                )
            };
            serde_json::json!({"role": m.role, "content": content})
        })
        .collect();

    let mut body = serde_json::json!({
        "model": model,
        "messages": messages,
    });
    if let Some(t) = params.temperature {
        body["temperature"] = t.into();
    }
    if let Some(p) = params.top_p {
        body["top_p"] = p.into();
    }
    if let Some(m) = params.max_tokens {
        body["max_tokens"] = m.into();
    }
    body
}

/// Pull content and usage out of a chat completion response.
pub fn parse_response_body(
    body: &serde_json::Value,
    latency_ms: u64,
) -> Result<Completion, ProviderError> {
    let content = body["choices"][0]["message"]["content"]
        .as_str()
        .ok_or_else(|| ProviderError::InvalidResponse("No choices[0].message.content".into()))?
        .to_string();

    let usage = TokenUsage {
        prompt_tokens: body["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
        completion_tokens: body["usage"]["completion_tokens"].as_u64().unwrap_or(0),
    };

    Ok(Completion {
        content,
        usage,
        latency_ms,
    })
}

#[async_trait]
impl ModelClient for HttpModelClient {
    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        params: &SamplingParams,
    ) -> Result<Completion, ProviderError> {
        let body = build_request_body(model, messages, params);
        let start = Instant::now();

        let mut request = self
            .http_client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let resp = request.send().await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Http { status, body });
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        let latency_ms = start.elapsed().as_millis() as u64;
        debug!("Completion from {} in {}ms", model, latency_ms);

        parse_response_body(&json, latency_ms)
    }
}
