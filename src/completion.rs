//! Chat-completion client with ordered model fallback.
//!
//! Speaks the OpenAI-compatible `/chat/completions` wire format. Two
//! construction modes:
//!
//! - [`CompletionClient::shared`] — the deployment-wide provider with a
//!   fallback chain: the configured primary model followed by the
//!   configured fallback list (primary de-duplicated). Rate limits,
//!   unknown models, and transient unavailability (429/404/503) move to
//!   the next model after a short fixed delay; anything else is raised
//!   immediately.
//! - [`CompletionClient::custom`] — a tenant's own credentials and single
//!   authoritative model. No fallback list.
//!
//! The client has no side effects beyond the network call; token usage
//! and the model that answered are returned for the caller to log.

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::time::Duration;

use crate::config::CompletionConfig;
use crate::models::PromptMessage;

/// Per-call generation options.
#[derive(Debug, Clone, Copy)]
pub struct CompletionOptions {
    pub temperature: f64,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A successful completion: answer text, the model that produced it,
/// and the provider-reported token usage.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub model: String,
    pub usage: TokenUsage,
}

pub struct CompletionClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    models: Vec<String>,
    retry_delay: Duration,
}

enum AttemptOutcome {
    Success(Completion),
    /// 429 / 404 / 503: worth trying the next model in the chain.
    Retryable(anyhow::Error),
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

impl CompletionClient {
    /// Shared provider with the configured fallback chain.
    pub fn shared(config: &CompletionConfig) -> Result<Self> {
        let api_key = config.resolve_api_key()?;

        let mut models = vec![config.model.clone()];
        models.extend(
            config
                .fallback_models
                .iter()
                .filter(|m| **m != config.model)
                .cloned(),
        );

        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            models,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        })
    }

    /// Tenant-supplied provider. The declared model is authoritative, so
    /// the chain has exactly one entry.
    pub fn custom(api_key: &str, base_url: &str, model: &str, timeout_secs: u64) -> Result<Self> {
        if api_key.is_empty() || base_url.is_empty() || model.is_empty() {
            bail!("custom completion config requires api_key, base_url, and model");
        }

        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(timeout_secs))
                .build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            models: vec![model.to_string()],
            retry_delay: Duration::from_millis(0),
        })
    }

    /// Run the completion, walking the model chain on retryable failures.
    pub async fn complete(
        &self,
        messages: &[PromptMessage],
        opts: &CompletionOptions,
    ) -> Result<Completion> {
        let mut last_err = None;
        let total = self.models.len();

        for (i, model) in self.models.iter().enumerate() {
            tracing::debug!(%model, "trying completion model");
            match self.attempt(model, messages, opts).await? {
                AttemptOutcome::Success(completion) => {
                    if i > 0 {
                        tracing::info!(%model, "completion fell back from primary");
                    }
                    return Ok(completion);
                }
                AttemptOutcome::Retryable(e) => {
                    tracing::warn!(%model, error = %e, "completion model failed, trying next");
                    last_err = Some(e);
                    if i + 1 < total {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("no completion models configured")))
    }

    /// One request against one model. Returns `Err` only for failures
    /// that must short-circuit the chain (auth, malformed request,
    /// network); retryable statuses come back as `AttemptOutcome`.
    async fn attempt(
        &self,
        model: &str,
        messages: &[PromptMessage],
        opts: &CompletionOptions,
    ) -> Result<AttemptOutcome> {
        let body = serde_json::json!({
            "model": model,
            "messages": messages,
            "temperature": opts.temperature,
            "max_tokens": opts.max_tokens,
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .context("completion request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            let err = anyhow!("completion failed with {} for {}: {}", status, model, body_text);

            // Rate limited, model not found, or temporarily unavailable:
            // the next model in the chain may still answer.
            return match status.as_u16() {
                429 | 404 | 503 => Ok(AttemptOutcome::Retryable(err)),
                _ => Err(err),
            };
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .context("invalid completion response")?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        let usage = parsed
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: if u.total_tokens > 0 {
                    u.total_tokens
                } else {
                    u.prompt_tokens + u.completion_tokens
                },
            })
            .unwrap_or_default();

        Ok(AttemptOutcome::Success(Completion {
            text,
            model: parsed.model.unwrap_or_else(|| model.to_string()),
            usage,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    const OPTS: CompletionOptions = CompletionOptions {
        temperature: 0.3,
        max_tokens: 1000,
    };

    fn test_config(base_url: String, model: &str, fallbacks: &[&str]) -> CompletionConfig {
        CompletionConfig {
            base_url,
            api_key: Some("test-key".to_string()),
            model: model.to_string(),
            fallback_models: fallbacks.iter().map(|m| m.to_string()).collect(),
            temperature: 0.3,
            max_tokens: 1000,
            retry_delay_ms: 10,
            timeout_secs: 5,
        }
    }

    fn success_body(model: &str, text: &str) -> serde_json::Value {
        serde_json::json!({
            "model": model,
            "choices": [{ "message": { "role": "assistant", "content": text } }],
            "usage": { "prompt_tokens": 30, "completion_tokens": 12, "total_tokens": 42 }
        })
    }

    fn messages() -> Vec<PromptMessage> {
        vec![
            PromptMessage::system("You answer from context."),
            PromptMessage::user("What are your opening hours?"),
        ]
    }

    #[tokio::test]
    async fn rate_limited_primary_falls_back() {
        let server = MockServer::start_async().await;

        let primary = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/chat/completions")
                    .json_body_partial(r#"{ "model": "model-a" }"#);
                then.status(429).body("rate limited");
            })
            .await;
        let fallback = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/chat/completions")
                    .json_body_partial(r#"{ "model": "model-b" }"#);
                then.status(200)
                    .json_body(success_body("model-b", "We open at nine."));
            })
            .await;

        let config = test_config(server.base_url(), "model-a", &["model-b"]);
        let client = CompletionClient::shared(&config).unwrap();
        let completion = client.complete(&messages(), &OPTS).await.unwrap();

        primary.assert_async().await;
        fallback.assert_async().await;
        assert_eq!(completion.text, "We open at nine.");
        assert_eq!(completion.model, "model-b");
        assert_eq!(completion.usage.prompt_tokens, 30);
        assert_eq!(completion.usage.total_tokens, 42);
    }

    #[tokio::test]
    async fn unknown_model_and_unavailable_also_fall_back() {
        let server = MockServer::start_async().await;

        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/chat/completions")
                    .json_body_partial(r#"{ "model": "model-a" }"#);
                then.status(404).body("model not found");
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/chat/completions")
                    .json_body_partial(r#"{ "model": "model-b" }"#);
                then.status(503).body("unavailable");
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/chat/completions")
                    .json_body_partial(r#"{ "model": "model-c" }"#);
                then.status(200).json_body(success_body("model-c", "ok"));
            })
            .await;

        let config = test_config(server.base_url(), "model-a", &["model-b", "model-c"]);
        let client = CompletionClient::shared(&config).unwrap();
        let completion = client.complete(&messages(), &OPTS).await.unwrap();
        assert_eq!(completion.model, "model-c");
    }

    #[tokio::test]
    async fn auth_failure_short_circuits_the_chain() {
        let server = MockServer::start_async().await;

        let primary = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/chat/completions")
                    .json_body_partial(r#"{ "model": "model-a" }"#);
                then.status(401).body("invalid api key");
            })
            .await;
        let fallback = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/chat/completions")
                    .json_body_partial(r#"{ "model": "model-b" }"#);
                then.status(200).json_body(success_body("model-b", "never"));
            })
            .await;

        let config = test_config(server.base_url(), "model-a", &["model-b"]);
        let client = CompletionClient::shared(&config).unwrap();
        let err = client.complete(&messages(), &OPTS).await.unwrap_err();

        assert!(err.to_string().contains("401"));
        primary.assert_hits_async(1).await;
        fallback.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn exhausted_chain_raises_last_error() {
        let server = MockServer::start_async().await;

        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/chat/completions")
                    .json_body_partial(r#"{ "model": "model-a" }"#);
                then.status(429).body("limit a");
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/chat/completions")
                    .json_body_partial(r#"{ "model": "model-b" }"#);
                then.status(429).body("limit b");
            })
            .await;

        let config = test_config(server.base_url(), "model-a", &["model-b"]);
        let client = CompletionClient::shared(&config).unwrap();
        let err = client.complete(&messages(), &OPTS).await.unwrap_err();
        assert!(err.to_string().contains("limit b"));
    }

    #[tokio::test]
    async fn primary_is_deduplicated_from_fallback_list() {
        let server = MockServer::start_async().await;

        let only = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/chat/completions")
                    .json_body_partial(r#"{ "model": "model-a" }"#);
                then.status(429).body("limit");
            })
            .await;

        // model-a appears both as primary and in the fallback list; the
        // chain must try it exactly once.
        let config = test_config(server.base_url(), "model-a", &["model-a"]);
        let client = CompletionClient::shared(&config).unwrap();
        let _ = client.complete(&messages(), &OPTS).await.unwrap_err();
        only.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn custom_client_has_no_fallback() {
        let server = MockServer::start_async().await;

        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/chat/completions")
                    .json_body_partial(r#"{ "model": "tenant-model" }"#);
                then.status(429).body("limit");
            })
            .await;

        let client =
            CompletionClient::custom("tenant-key", &server.base_url(), "tenant-model", 5).unwrap();
        let err = client.complete(&messages(), &OPTS).await.unwrap_err();

        assert!(err.to_string().contains("429"));
        mock.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn missing_usage_defaults_to_zero() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/chat/completions");
                then.status(200).json_body(serde_json::json!({
                    "choices": [{ "message": { "content": "hi" } }]
                }));
            })
            .await;

        let config = test_config(server.base_url(), "model-a", &[]);
        let client = CompletionClient::shared(&config).unwrap();
        let completion = client.complete(&messages(), &OPTS).await.unwrap();
        assert_eq!(completion.usage.total_tokens, 0);
        assert_eq!(completion.model, "model-a");
    }

    #[test]
    fn custom_requires_all_fields() {
        assert!(CompletionClient::custom("", "https://x", "m", 5).is_err());
        assert!(CompletionClient::custom("k", "", "m", 5).is_err());
        assert!(CompletionClient::custom("k", "https://x", "", 5).is_err());
    }
}
