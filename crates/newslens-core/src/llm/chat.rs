//! OpenAI-compatible chat-completion client.
//!
//! One HTTPS POST per call with bearer authentication, classified retries,
//! and key rotation: on 401/403 with the designated key the call is retried
//! once with the alternate key before `Auth` is reported. Rate limits honour
//! `Retry-After`; transient failures back off exponentially. A global
//! semaphore caps outstanding calls across all concurrent runs.

use super::{normalize_endpoint, ClientMetrics, CompletionClient};
use crate::config::ensemble::{KeySelector, ModelSpec};
use crate::error::ProviderError;
use rand::Rng;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Retry budget per call for rate-limited and transient failures.
const MAX_ATTEMPTS: u32 = 3;

/// Completion length cap; bias verdicts are short JSON objects.
const MAX_TOKENS: u32 = 800;

/// Low temperature keeps verdicts stable across reruns.
const TEMPERATURE: f32 = 0.3;

/// HTTP client for OpenAI-compatible chat-completion endpoints.
pub struct HttpCompletionClient {
    client: reqwest::Client,
    primary_key: Option<String>,
    secondary_key: Option<String>,
    default_base_url: Option<String>,
    limiter: Arc<Semaphore>,
    metrics: Arc<ClientMetrics>,
    backoff_base: Duration,
}

impl HttpCompletionClient {
    /// Create a new client.
    ///
    /// `max_concurrent` caps outstanding calls across all runs to protect
    /// upstream rate limits.
    pub fn new(
        primary_key: Option<String>,
        secondary_key: Option<String>,
        default_base_url: Option<String>,
        timeout: Duration,
        max_concurrent: u32,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            primary_key,
            secondary_key,
            default_base_url,
            limiter: Arc::new(Semaphore::new(max_concurrent as usize)),
            metrics: Arc::new(ClientMetrics::default()),
            backoff_base: Duration::from_secs(1),
        }
    }

    /// Shrink the back-off base. Test-only; production keeps the 1s start.
    #[cfg(any(test, feature = "test-helpers"))]
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Shared counters for provider call outcomes.
    pub fn metrics(&self) -> Arc<ClientMetrics> {
        self.metrics.clone()
    }

    /// The key designated by the model's selector, if configured.
    fn designated_key(&self, selector: KeySelector) -> Option<&str> {
        match selector {
            KeySelector::Primary => self.primary_key.as_deref(),
            KeySelector::Secondary => self.secondary_key.as_deref(),
        }
    }

    /// The other key of the pair, for the single auth-failure swap.
    fn alternate_key(&self, selector: KeySelector) -> Option<&str> {
        match selector {
            KeySelector::Primary => self.secondary_key.as_deref(),
            KeySelector::Secondary => self.primary_key.as_deref(),
        }
    }

    /// Exponential back-off with a little jitter: base, 2·base, 4·base, ...
    async fn backoff(&self, attempt: u32) {
        let factor = 1u64 << attempt.min(4);
        let base = self.backoff_base * u32::try_from(factor).unwrap_or(u32::MAX);
        let jitter = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 4 + 1);
        tokio::time::sleep(base + Duration::from_millis(jitter)).await;
    }

    /// Issue one HTTP attempt and classify the outcome.
    async fn attempt(
        &self,
        endpoint: &str,
        model: &ModelSpec,
        prompt: &str,
        key: Option<&str>,
    ) -> AttemptOutcome {
        let payload = serde_json::json!({
            "model": model.name,
            "messages": [{"role": "user", "content": prompt}],
            "max_tokens": MAX_TOKENS,
            "temperature": TEMPERATURE,
        });

        let mut builder = self.client.post(endpoint).json(&payload);
        if let Some(key) = key {
            builder = builder.bearer_auth(key);
        }

        let response = match builder.send().await {
            Ok(r) => r,
            Err(e) => {
                return AttemptOutcome::Retryable(ProviderError::Transient {
                    message: e.to_string(),
                });
            }
        };

        let status = response.status().as_u16();
        if response.status().is_success() {
            let body = match response.text().await {
                Ok(b) => b,
                Err(e) => {
                    return AttemptOutcome::Fatal(ProviderError::Malformed {
                        message: format!("failed to read response body: {e}"),
                    });
                }
            };
            return match serde_json::from_str::<CompletionEnvelope>(&body) {
                Ok(envelope) => match envelope.first_content() {
                    Some(content) => AttemptOutcome::Ok(content),
                    None => AttemptOutcome::Fatal(ProviderError::Malformed {
                        message: "response envelope has no choices".to_string(),
                    }),
                },
                Err(e) => AttemptOutcome::Fatal(ProviderError::Malformed {
                    message: format!("unparseable completion envelope: {e}"),
                }),
            };
        }

        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let body = response.text().await.unwrap_or_default();

        match status {
            429 => AttemptOutcome::Retryable(ProviderError::RateLimited {
                retry_after_secs: retry_after,
            }),
            402 => AttemptOutcome::Fatal(ProviderError::CreditsExhausted),
            401 | 403 => AttemptOutcome::AuthFailed { status },
            500..=599 => AttemptOutcome::Retryable(ProviderError::Transient {
                message: format!("HTTP {status}: {body}"),
            }),
            // Some providers signal rate exhaustion in 4xx bodies.
            _ if body.contains("rate_limit") || body.contains("rate limit") => {
                AttemptOutcome::Retryable(ProviderError::RateLimited {
                    retry_after_secs: retry_after,
                })
            }
            _ => AttemptOutcome::Fatal(ProviderError::Malformed {
                message: format!("unexpected status {status}: {body}"),
            }),
        }
    }
}

/// Classified result of one HTTP attempt.
enum AttemptOutcome {
    Ok(String),
    /// Retry with back-off if budget remains.
    Retryable(ProviderError),
    /// 401/403 — eligible for a single key swap.
    AuthFailed { status: u16 },
    /// Non-retryable.
    Fatal(ProviderError),
}

#[async_trait::async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn complete(&self, model: &ModelSpec, prompt: &str) -> Result<String, ProviderError> {
        let permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| ProviderError::Cancelled)?;

        let base = if model.url.is_empty() {
            self.default_base_url.as_deref().unwrap_or(&model.url)
        } else {
            &model.url
        };
        let endpoint = normalize_endpoint(base);

        let mut key = self.designated_key(model.key_selector);
        let mut key_swapped = false;
        let mut attempt = 0u32;

        let result = loop {
            let outcome = self.attempt(&endpoint, model, prompt, key).await;

            match outcome {
                AttemptOutcome::Ok(content) => {
                    tracing::debug!(
                        model = %model.name,
                        attempt,
                        chars = content.len(),
                        "provider attempt ok"
                    );
                    break Ok(content);
                }
                AttemptOutcome::AuthFailed { status } => {
                    tracing::debug!(
                        model = %model.name,
                        attempt,
                        status,
                        error_kind = "auth_error",
                        "provider attempt failed"
                    );
                    self.metrics.record_auth_failure();
                    if !key_swapped {
                        if let Some(alternate) = self.alternate_key(model.key_selector) {
                            key = Some(alternate);
                            key_swapped = true;
                            continue;
                        }
                    }
                    break Err(ProviderError::Auth { status });
                }
                AttemptOutcome::Retryable(err) => {
                    tracing::debug!(
                        model = %model.name,
                        attempt,
                        error_kind = err.kind(),
                        "provider attempt failed"
                    );
                    if matches!(err, ProviderError::RateLimited { .. }) {
                        self.metrics.record_rate_limited();
                    }
                    attempt += 1;
                    if attempt >= MAX_ATTEMPTS {
                        break Err(err);
                    }
                    if let ProviderError::RateLimited {
                        retry_after_secs: Some(secs),
                    } = err
                    {
                        tokio::time::sleep(Duration::from_secs(secs)).await;
                    } else {
                        self.backoff(attempt - 1).await;
                    }
                }
                AttemptOutcome::Fatal(err) => {
                    tracing::debug!(
                        model = %model.name,
                        attempt,
                        error_kind = err.kind(),
                        "provider attempt failed"
                    );
                    break Err(err);
                }
            }
        };

        drop(permit);
        self.metrics.record_outcome(result.is_ok());
        result
    }
}

/// The slice of the completion envelope this client actually reads.
/// Token usage and everything else the provider returns is ignored.
#[derive(Deserialize)]
struct CompletionEnvelope {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

impl CompletionEnvelope {
    fn first_content(self) -> Option<String> {
        self.choices.into_iter().next().map(|c| c.message.content)
    }
}

#[derive(Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    message: CompletionMessage,
}

#[derive(Deserialize, Default)]
struct CompletionMessage {
    #[serde(default)]
    content: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ensemble::Perspective;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client(server_uri: &str) -> HttpCompletionClient {
        HttpCompletionClient::new(
            Some("primary-key".to_string()),
            Some("secondary-key".to_string()),
            Some(server_uri.to_string()),
            Duration::from_secs(5),
            8,
        )
        .with_backoff_base(Duration::from_millis(1))
    }

    fn model(url: &str) -> ModelSpec {
        ModelSpec {
            name: "test-model".to_string(),
            url: url.to_string(),
            perspective: Perspective::Center,
            weight: 1.0,
            key_selector: KeySelector::Primary,
        }
    }

    fn ok_body(content: &str) -> serde_json::Value {
        serde_json::json!({
            "choices": [{"message": {"content": content}}],
            "model": "test-model"
        })
    }

    #[tokio::test]
    async fn complete_success_returns_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer primary-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body("{\"score\": 0.1}")))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let content = client
            .complete(&model(&server.uri()), "rate this")
            .await
            .expect("complete");
        assert_eq!(content, "{\"score\": 0.1}");
        assert_eq!(client.metrics().calls_ok(), 1);
    }

    #[tokio::test]
    async fn url_suffix_appended_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body("ok")))
            .expect(2)
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let plain = model(&format!("{}/v1", server.uri()));
        let suffixed = model(&format!("{}/v1/chat/completions", server.uri()));
        client.complete(&plain, "p").await.expect("plain");
        client.complete(&suffixed, "p").await.expect("suffixed");
    }

    #[tokio::test]
    async fn auth_failure_swaps_to_secondary_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer primary-key"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid key"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer secondary-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body("rescued")))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let content = client
            .complete(&model(&server.uri()), "p")
            .await
            .expect("swap should rescue the call");
        assert_eq!(content, "rescued");
        assert_eq!(client.metrics().auth_failures(), 1);
    }

    #[tokio::test]
    async fn auth_failure_on_both_keys_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .expect(2)
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let err = client.complete(&model(&server.uri()), "p").await.unwrap_err();
        assert!(matches!(err, ProviderError::Auth { status: 403 }));
        assert_eq!(client.metrics().auth_failures(), 2);
    }

    #[tokio::test]
    async fn rate_limit_retries_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(429)
                    .append_header("retry-after", "0")
                    .set_body_string("slow down"),
            )
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body("after retry")))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let content = client.complete(&model(&server.uri()), "p").await.expect("retry");
        assert_eq!(content, "after retry");
        assert_eq!(client.metrics().rate_limited(), 1);
    }

    #[tokio::test]
    async fn rate_limit_exhausts_budget() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).append_header("retry-after", "0"))
            .expect(3)
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let err = client.complete(&model(&server.uri()), "p").await.unwrap_err();
        assert!(matches!(err, ProviderError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn credits_exhausted_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(402).set_body_string("payment required"))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let err = client.complete(&model(&server.uri()), "p").await.unwrap_err();
        assert!(matches!(err, ProviderError::CreditsExhausted));
    }

    #[tokio::test]
    async fn server_errors_retry_up_to_budget() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .expect(3)
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let err = client.complete(&model(&server.uri()), "p").await.unwrap_err();
        assert!(matches!(err, ProviderError::Transient { .. }));
        assert_eq!(client.metrics().calls_failed(), 1);
    }

    #[tokio::test]
    async fn malformed_envelope_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json at all"))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let err = client.complete(&model(&server.uri()), "p").await.unwrap_err();
        assert!(matches!(err, ProviderError::Malformed { .. }));
    }

    #[tokio::test]
    async fn empty_choices_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"choices": []})),
            )
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let err = client.complete(&model(&server.uri()), "p").await.unwrap_err();
        assert!(matches!(err, ProviderError::Malformed { .. }));
    }
}
