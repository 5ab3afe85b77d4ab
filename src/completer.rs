//! Answer synthesis provider.
//!
//! The query orchestrator hands the composed prompt to a [`Completer`]; when
//! none is configured, or the call fails or exceeds its 20-second cap, the
//! orchestrator produces the deterministic fallback answer instead. Completer
//! trouble therefore never fails a query.
//!
//! [`HttpCompleter`] targets an OpenAI-compatible chat-completions endpoint.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::time::Duration;

/// Hard cap on a single completion call.
pub const COMPLETER_TIMEOUT: Duration = Duration::from_secs(20);

/// Pluggable natural-language response synthesizer.
#[async_trait]
pub trait Completer: Send + Sync {
    /// Model identifier reported in query responses.
    fn model_name(&self) -> &str;

    /// Produce an answer from a system identity string and a composed user
    /// prompt (sources, tool results, question).
    async fn complete(&self, system: &str, user: &str) -> Result<String>;
}

/// Completer calling an OpenAI-compatible chat-completions endpoint.
pub struct HttpCompleter {
    endpoint: String,
    model: String,
    api_key: String,
    client: reqwest::Client,
}

impl HttpCompleter {
    pub fn new(endpoint: &str, model: &str, api_key: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(COMPLETER_TIMEOUT)
            .build()?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            model: model.to_string(),
            api_key: api_key.to_string(),
            client,
        })
    }
}

#[async_trait]
impl Completer for HttpCompleter {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "max_completion_tokens": 1500,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("completions API error {}: {}", status, body_text);
        }

        let json: serde_json::Value = response.json().await?;
        let answer = json
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| anyhow!("invalid completions response: missing message content"))?;
        Ok(answer.trim().to_string())
    }
}

/// Test support: canned completers.
pub mod testing {
    use super::*;

    /// Returns a fixed answer; used to exercise the non-fallback path.
    pub struct StaticCompleter {
        pub answer: String,
    }

    #[async_trait]
    impl Completer for StaticCompleter {
        fn model_name(&self) -> &str {
            "static-test"
        }

        async fn complete(&self, _system: &str, _user: &str) -> Result<String> {
            Ok(self.answer.clone())
        }
    }

    /// Always errors; used to exercise the fallback path.
    pub struct FailingCompleter;

    #[async_trait]
    impl Completer for FailingCompleter {
        fn model_name(&self) -> &str {
            "failing-test"
        }

        async fn complete(&self, _system: &str, _user: &str) -> Result<String> {
            bail!("completer unavailable")
        }
    }
}
