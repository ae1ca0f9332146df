use crate::config::{Config, LlmProviderConfig, Secrets};
use crate::federation::CORRELATION_HEADER;
use crate::prelude::*;
use crate::server::metrics::Metrics;
use reqwest::header::AUTHORIZATION;
use reqwest::Method;
use serde_json::json;
use std::time::{Duration, Instant};

/// Chat-completion client used by the report writer and the reflection step.
/// When no provider is configured every call returns `None` and callers fall
/// back to deterministic templating, so the pipeline works offline.
pub struct LlmClient {
    config: Config,
    secrets: Secrets,
    metrics: Metrics,
}

impl LlmClient {
    pub fn new(config: Config, secrets: Secrets, metrics: Metrics) -> Self {
        LlmClient {
            config,
            secrets,
            metrics,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.config.llm.primary.is_some()
    }

    /// Runs the prompt against the primary provider, failing over to the
    /// backup on any error.
    pub fn complete(&self, prompt: &str, correlation_id: &str) -> Fallible<Option<String>> {
        let start = Instant::now();
        let providers = [&self.config.llm.primary, &self.config.llm.backup];

        let mut last_error = None;
        for provider in providers.into_iter().flatten() {
            match self.complete_with(provider, prompt, correlation_id) {
                Ok(text) => {
                    self.metrics.record_request("llm", "complete", start);
                    return Ok(Some(text));
                }
                Err(err) => {
                    warn!(
                        "[{}] llm provider {} failed: {}",
                        correlation_id, provider.name, err
                    );
                    self.metrics.record_error("llm", "provider_failed");
                    last_error = Some(err);
                }
            }
        }

        match last_error {
            // Every configured provider failed; the caller degrades.
            Some(err) => Err(err),
            None => Ok(None),
        }
    }

    fn complete_with(
        &self,
        provider: &LlmProviderConfig,
        prompt: &str,
        correlation_id: &str,
    ) -> Fallible<String> {
        let key = self
            .secrets
            .get(&provider.api_key_env)
            .ok_or_else(|| anyhow!("{} is not set", provider.api_key_env))?;

        let url = format!("{}/chat/completions", provider.base_url.trim_end_matches('/'));
        let response = crate::utils::http::prepare(Method::POST, &url)
            .timeout(Duration::from_secs(self.config.llm.request_timeout_secs))
            .header(AUTHORIZATION, format!("Bearer {key}"))
            .header(CORRELATION_HEADER, correlation_id)
            .json(&json!({
                "model": provider.model,
                "messages": [{ "role": "user", "content": prompt }],
                "max_tokens": 1024,
            }))
            .send()?;

        let status = response.status();
        if !status.is_success() {
            bail!("{} returned status {}", provider.name, status);
        }

        let body: serde_json::Value = response.json()?;
        body["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.trim().to_string())
            .ok_or_else(|| anyhow!("{} returned an unexpected response shape", provider.name))
    }
}

#[cfg(test)]
mod tests {
    use super::LlmClient;
    use crate::config::{Config, LlmProviderConfig, Secrets};
    use crate::server::metrics::Metrics;

    #[test]
    fn test_unconfigured_client_returns_none() {
        let client = LlmClient::new(Config::default(), Secrets::default(), Metrics::shared());
        assert!(!client.is_configured());
        assert!(client.complete("resuma", "corr-test").unwrap().is_none());
    }

    #[test]
    fn test_missing_key_is_an_error() {
        let mut config = Config::default();
        config.llm.primary = Some(LlmProviderConfig {
            name: "primary".into(),
            base_url: "http://127.0.0.1:9".into(),
            model: "test-model".into(),
            api_key_env: "LUPA_TEST_MISSING_KEY".into(),
        });

        let client = LlmClient::new(config, Secrets::default(), Metrics::shared());
        assert!(client.complete("resuma", "corr-test").is_err());
    }
}
