//! LLM provider abstraction for the scoring pipeline.
//!
//! Provides an object-safe trait for a single chat-completion call plus the
//! HTTP implementation with key rotation, retry classification, and a global
//! concurrency cap.

pub mod chat;

use crate::config::ensemble::ModelSpec;
use crate::error::ProviderError;
use std::sync::atomic::{AtomicU64, Ordering};

pub use chat::HttpCompletionClient;

/// Trait abstracting one chat-completion call against one model.
///
/// The production implementation is [`HttpCompletionClient`]; tests swap in
/// scripted fakes. The trait is object-safe for use as
/// `Arc<dyn CompletionClient>`.
#[async_trait::async_trait]
pub trait CompletionClient: Send + Sync {
    /// Execute a single completion and return the inner content string.
    ///
    /// Retries, key rotation, and back-off are the implementation's
    /// business; callers only see the final classified outcome.
    async fn complete(&self, model: &ModelSpec, prompt: &str) -> Result<String, ProviderError>;
}

/// Cheap atomic counters for provider call outcomes.
///
/// Not a metrics registry — just enough observability for logs and tests.
#[derive(Debug, Default)]
pub struct ClientMetrics {
    /// Authentication failures that triggered a key swap or an `Auth` error.
    pub auth_failures: AtomicU64,
    /// Rate-limit responses observed (including retried ones).
    pub rate_limited: AtomicU64,
    /// Calls that returned usable content.
    pub calls_ok: AtomicU64,
    /// Calls that ended in a classified error.
    pub calls_failed: AtomicU64,
}

impl ClientMetrics {
    /// Current auth-failure count.
    pub fn auth_failures(&self) -> u64 {
        self.auth_failures.load(Ordering::Relaxed)
    }

    /// Current rate-limited count.
    pub fn rate_limited(&self) -> u64 {
        self.rate_limited.load(Ordering::Relaxed)
    }

    /// Current successful-call count.
    pub fn calls_ok(&self) -> u64 {
        self.calls_ok.load(Ordering::Relaxed)
    }

    /// Current failed-call count.
    pub fn calls_failed(&self) -> u64 {
        self.calls_failed.load(Ordering::Relaxed)
    }

    pub(crate) fn record_auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_outcome(&self, ok: bool) {
        if ok {
            self.calls_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.calls_failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Append `/chat/completions` to a base URL unless it already ends with it.
pub fn normalize_endpoint(base_url: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');
    if trimmed.ends_with("/chat/completions") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/chat/completions")
    }
}
