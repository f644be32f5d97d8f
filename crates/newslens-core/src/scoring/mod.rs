//! The scoring subsystem: ensemble dispatch, verdict parsing, composite
//! calculation, caching, progress, and orchestration.
//!
//! Submodules:
//! - [`parser`]: tolerant extraction of `{score, explanation, confidence}`
//!   from raw model output.
//! - [`calculator`]: pure composite score + confidence computation.
//! - [`cache`]: single-flight fingerprint cache for settled composites.
//! - [`progress`]: per-article progress state with pub/sub subscribers.
//! - [`engine`]: bounded fan-out across the configured models.
//! - [`manager`]: top-level orchestrator binding everything together.

pub mod cache;
pub mod calculator;
pub mod engine;
pub mod manager;
pub mod parser;
pub mod progress;

use crate::config::ensemble::Perspective;
use serde::{Deserialize, Serialize};

/// One model's validated verdict for one article.
///
/// Produced by the engine, consumed by the calculator, persisted by the
/// storage gateway under the `(article_id, model)` uniqueness rule.
#[derive(Debug, Clone, Serialize)]
pub struct ModelScore {
    /// Configured model name, also the persistence key.
    pub model: String,
    /// The lens this model was configured with.
    pub perspective: Perspective,
    /// Configured formula weight.
    pub weight: f64,
    /// Bias verdict in [-1, 1].
    pub score: f64,
    /// Self-reported confidence in [0, 1].
    pub confidence: f64,
    /// The model's reasoning, free text.
    pub explanation: String,
    /// Extra fields persisted alongside the row (imputation and repair
    /// markers, perspective, weight).
    pub metadata: serde_json::Value,
}

/// Where a composite score came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreSource {
    /// Fused from ensemble verdicts.
    Ensemble,
    /// Set by an operator through the API.
    Manual,
    /// Zero-composite fallback under the `default_zero` policy.
    Default,
}

impl ScoreSource {
    /// Lowercase name as persisted on the article row.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ensemble => "ensemble",
            Self::Manual => "manual",
            Self::Default => "default",
        }
    }

    /// Parse the persisted form back.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ensemble" => Some(Self::Ensemble),
            "manual" => Some(Self::Manual),
            "default" => Some(Self::Default),
            _ => None,
        }
    }
}

/// The fused verdict for one article.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeScore {
    /// The scored article.
    pub article_id: i64,
    /// Composite bias in [-1, 1].
    pub score: f64,
    /// Composite confidence in [0, 1].
    pub confidence: f64,
    /// Provenance of the composite.
    pub source: ScoreSource,
    /// ISO-8601 UTC timestamp of scoring.
    pub scored_at: String,
}
