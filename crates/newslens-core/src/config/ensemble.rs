//! Ensemble configuration: the JSON document describing which models score
//! an article and how their verdicts are fused.
//!
//! Unknown top-level keys are ignored with a warning for forward
//! compatibility; unknown *values* for the tagged enums are rejected at load
//! time. A SHA-256 hash over the canonicalised document participates in the
//! score-cache fingerprint, so any config change invalidates cached
//! composites.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::{Arc, RwLock};

/// The lens a model is prompted to adopt or judged to represent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Perspective {
    Left,
    Center,
    Right,
    Neutral,
}

impl Perspective {
    /// Fixed iteration order for perspective grouping: center, left,
    /// neutral, right.
    pub const ORDER: [Perspective; 4] = [
        Perspective::Center,
        Perspective::Left,
        Perspective::Neutral,
        Perspective::Right,
    ];

    /// Lowercase name as it appears in config and metadata.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Left => "left",
            Self::Center => "center",
            Self::Right => "right",
            Self::Neutral => "neutral",
        }
    }
}

/// Which provider credential a model call is signed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeySelector {
    #[default]
    Primary,
    Secondary,
}

/// Composite score formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Formula {
    #[default]
    WeightedAverage,
    PerspectiveAverage,
    ConfidenceWeighted,
}

/// How the composite confidence is derived from per-model confidences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceMethod {
    Min,
    #[default]
    Mean,
    SpreadInverse,
}

/// What to do with results whose score fails validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidPolicy {
    #[default]
    Ignore,
    DefaultZero,
    Fail,
}

/// One model participating in the ensemble.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelSpec {
    /// Provider-side model name, also the persistence key.
    pub name: String,

    /// Provider base URL; `/chat/completions` is appended if absent.
    pub url: String,

    /// The lens this model represents.
    pub perspective: Perspective,

    /// Weight in the composite formula. Must be finite and non-negative.
    #[serde(default = "default_weight")]
    pub weight: f64,

    /// Which credential to sign calls with.
    #[serde(default)]
    pub key_selector: KeySelector,
}

/// The prompt template and few-shot anchors shared by all models in a run.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PromptVariant {
    /// Identifier participating in the cache fingerprint.
    pub id: String,

    /// Template text; `{title}` and `{content}` are substituted.
    pub template: String,

    /// Few-shot example blocks appended after the filled template.
    #[serde(default)]
    pub examples: Vec<String>,
}

impl PromptVariant {
    /// Fill the template with an article's title and content, then append
    /// the few-shot examples in order.
    pub fn render(&self, title: &str, content: &str) -> String {
        let mut prompt = self
            .template
            .replace("{title}", title)
            .replace("{content}", content);
        for example in &self.examples {
            prompt.push_str("\n\n");
            prompt.push_str(example);
        }
        prompt
    }
}

/// The full ensemble configuration document. Unknown keys are dropped with
/// a warning before deserialization.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EnsembleConfig {
    /// Models to fan out to.
    #[serde(default)]
    pub models: Vec<ModelSpec>,

    /// Prompt variant used for every model call.
    #[serde(default)]
    pub prompt_variant: PromptVariant,

    /// Composite formula.
    #[serde(default)]
    pub formula: Formula,

    /// Composite confidence derivation.
    #[serde(default)]
    pub confidence_method: ConfidenceMethod,

    /// Invalid-result policy.
    #[serde(default)]
    pub handle_invalid: InvalidPolicy,

    /// Per-run fan-out concurrency.
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,

    /// Positive-cache TTL for settled composites.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_seconds: u64,

    /// Negative-cache TTL for settled errors.
    #[serde(default = "default_error_cache_ttl")]
    pub error_cache_ttl_seconds: u64,

    /// Whole-run deadline.
    #[serde(default = "default_run_deadline")]
    pub run_deadline_seconds: u64,

    /// Whether a parse failure triggers one strictness-reinforcing repair
    /// call before the model is counted as failed.
    #[serde(default = "default_repair")]
    pub repair_on_parse_failure: bool,

    /// SHA-256 over the canonicalised source document. Computed on load,
    /// never read from the file.
    #[serde(skip)]
    pub version: String,
}

fn default_weight() -> f64 {
    1.0
}
fn default_concurrency() -> u32 {
    4
}
fn default_cache_ttl() -> u64 {
    900
}
fn default_error_cache_ttl() -> u64 {
    30
}
fn default_run_deadline() -> u64 {
    120
}
fn default_repair() -> bool {
    true
}

/// Keys the loader recognises at the top level.
const RECOGNISED_KEYS: &[&str] = &[
    "models",
    "prompt_variant",
    "formula",
    "confidence_method",
    "handle_invalid",
    "concurrency",
    "cache_ttl_seconds",
    "error_cache_ttl_seconds",
    "run_deadline_seconds",
    "repair_on_parse_failure",
];

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            models: Vec::new(),
            prompt_variant: PromptVariant::default(),
            formula: Formula::default(),
            confidence_method: ConfidenceMethod::default(),
            handle_invalid: InvalidPolicy::default(),
            concurrency: default_concurrency(),
            cache_ttl_seconds: default_cache_ttl(),
            error_cache_ttl_seconds: default_error_cache_ttl(),
            run_deadline_seconds: default_run_deadline(),
            repair_on_parse_failure: default_repair(),
            version: String::new(),
        }
    }
}

impl EnsembleConfig {
    /// Parse an ensemble config from its JSON text.
    ///
    /// Unknown top-level keys are logged and dropped; enum values outside
    /// the recognised sets are rejected. The canonical version hash is
    /// computed from the full source document, unknown keys included, so
    /// any edit invalidates cached composites.
    pub fn from_json(json: &str) -> Result<Self, Vec<ConfigError>> {
        let value: serde_json::Value = serde_json::from_str(json).map_err(|e| {
            vec![ConfigError::EnsembleParse {
                message: e.to_string(),
            }]
        })?;

        let serde_json::Value::Object(mut map) = value else {
            return Err(vec![ConfigError::EnsembleParse {
                message: "document root must be a JSON object".to_string(),
            }]);
        };

        let version = version_hash(&map);

        let unknown: Vec<String> = map
            .keys()
            .filter(|k| !RECOGNISED_KEYS.contains(&k.as_str()))
            .cloned()
            .collect();
        for key in &unknown {
            tracing::warn!(key = %key, "ignoring unknown ensemble config key");
            map.remove(key);
        }

        let mut config: EnsembleConfig =
            serde_json::from_value(serde_json::Value::Object(map)).map_err(|e| {
                vec![ConfigError::EnsembleParse {
                    message: e.to_string(),
                }]
            })?;
        config.version = version;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse an ensemble config file.
    pub fn load(path: &str) -> Result<Self, Vec<ConfigError>> {
        let contents = std::fs::read_to_string(path).map_err(|_| {
            vec![ConfigError::FileNotFound {
                path: path.to_string(),
            }]
        })?;
        Self::from_json(&contents)
    }

    /// Validate the configuration, returning all errors found (not just
    /// the first).
    pub fn validate(&self) -> Result<(), Vec<ConfigError>> {
        let mut errors = Vec::new();

        if self.models.is_empty() {
            errors.push(ConfigError::MissingField {
                field: "models".to_string(),
            });
        }
        for (i, model) in self.models.iter().enumerate() {
            if model.name.is_empty() {
                errors.push(ConfigError::MissingField {
                    field: format!("models[{i}].name"),
                });
            }
            if model.url.is_empty() {
                errors.push(ConfigError::MissingField {
                    field: format!("models[{i}].url"),
                });
            }
            if !model.weight.is_finite() || model.weight < 0.0 {
                errors.push(ConfigError::InvalidValue {
                    field: format!("models[{i}].weight"),
                    message: "must be a finite non-negative number".to_string(),
                });
            }
        }
        if self.prompt_variant.id.is_empty() {
            errors.push(ConfigError::MissingField {
                field: "prompt_variant.id".to_string(),
            });
        }
        if self.prompt_variant.template.is_empty() {
            errors.push(ConfigError::MissingField {
                field: "prompt_variant.template".to_string(),
            });
        }
        if self.concurrency == 0 {
            errors.push(ConfigError::InvalidValue {
                field: "concurrency".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.run_deadline_seconds == 0 {
            errors.push(ConfigError::InvalidValue {
                field: "run_deadline_seconds".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// SHA-256 over the canonicalised (recursively key-sorted) JSON document.
fn version_hash(map: &serde_json::Map<String, serde_json::Value>) -> String {
    let canonical = canonicalise(&serde_json::Value::Object(map.clone()));
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Rebuild a JSON value with all object keys in sorted order.
fn canonicalise(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = serde_json::Map::new();
            for key in keys {
                out.insert(key.clone(), canonicalise(&map[key]));
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonicalise).collect())
        }
        other => other.clone(),
    }
}

/// Shared handle to the active ensemble config.
///
/// A reload swaps the inner `Arc` atomically; in-flight runs keep the
/// config they started with.
#[derive(Debug)]
pub struct EnsembleHandle {
    inner: RwLock<Arc<EnsembleConfig>>,
}

impl EnsembleHandle {
    /// Wrap an initial configuration.
    pub fn new(config: EnsembleConfig) -> Self {
        Self {
            inner: RwLock::new(Arc::new(config)),
        }
    }

    /// The currently active configuration.
    pub fn current(&self) -> Arc<EnsembleConfig> {
        self.inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Replace the active configuration. Only runs started afterwards
    /// observe the new value.
    pub fn swap(&self, config: EnsembleConfig) {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = Arc::new(config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> String {
        serde_json::json!({
            "models": [
                {"name": "gpt-4o-mini", "url": "https://api.example.com/v1",
                 "perspective": "left", "weight": 1.0},
                {"name": "claude-haiku", "url": "https://api.example.com/v1",
                 "perspective": "right", "weight": 1.0, "key_selector": "secondary"}
            ],
            "prompt_variant": {
                "id": "v1",
                "template": "Rate the political bias of: {title}\n{content}",
                "examples": ["Example: ..."]
            },
            "formula": "weighted_average",
            "confidence_method": "mean"
        })
        .to_string()
    }

    #[test]
    fn parse_minimal_config() {
        let config = EnsembleConfig::from_json(&minimal_json()).expect("parse");
        assert_eq!(config.models.len(), 2);
        assert_eq!(config.models[0].perspective, Perspective::Left);
        assert_eq!(config.models[1].key_selector, KeySelector::Secondary);
        assert_eq!(config.formula, Formula::WeightedAverage);
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.cache_ttl_seconds, 900);
        assert_eq!(config.run_deadline_seconds, 120);
        assert!(config.repair_on_parse_failure);
        assert_eq!(config.version.len(), 64);
    }

    #[test]
    fn unknown_top_level_keys_are_ignored() {
        let mut value: serde_json::Value =
            serde_json::from_str(&minimal_json()).expect("json");
        value["some_future_knob"] = serde_json::json!(true);
        let config = EnsembleConfig::from_json(&value.to_string()).expect("parse");
        assert_eq!(config.models.len(), 2);
    }

    #[test]
    fn unknown_formula_value_is_rejected() {
        let mut value: serde_json::Value =
            serde_json::from_str(&minimal_json()).expect("json");
        value["formula"] = serde_json::json!("median");
        let errors = EnsembleConfig::from_json(&value.to_string()).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ConfigError::EnsembleParse { .. })));
    }

    #[test]
    fn version_hash_ignores_key_order() {
        let a = r#"{"models":[{"name":"m","url":"u","perspective":"center"}],
                    "prompt_variant":{"id":"v1","template":"{title} {content}"}}"#;
        let b = r#"{"prompt_variant":{"template":"{title} {content}","id":"v1"},
                    "models":[{"perspective":"center","url":"u","name":"m"}]}"#;
        let ca = EnsembleConfig::from_json(a).expect("a");
        let cb = EnsembleConfig::from_json(b).expect("b");
        assert_eq!(ca.version, cb.version);
    }

    #[test]
    fn version_hash_changes_with_content() {
        let base = EnsembleConfig::from_json(&minimal_json()).expect("base");
        let mut value: serde_json::Value =
            serde_json::from_str(&minimal_json()).expect("json");
        value["concurrency"] = serde_json::json!(8);
        let changed = EnsembleConfig::from_json(&value.to_string()).expect("changed");
        assert_ne!(base.version, changed.version);
    }

    #[test]
    fn empty_models_rejected() {
        let errors = EnsembleConfig::from_json(
            r#"{"models":[],"prompt_variant":{"id":"v1","template":"t"}}"#,
        )
        .unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ConfigError::MissingField { field } if field == "models")));
    }

    #[test]
    fn negative_weight_rejected() {
        let mut value: serde_json::Value =
            serde_json::from_str(&minimal_json()).expect("json");
        value["models"][0]["weight"] = serde_json::json!(-0.5);
        let errors = EnsembleConfig::from_json(&value.to_string()).unwrap_err();
        assert!(errors.iter().any(
            |e| matches!(e, ConfigError::InvalidValue { field, .. } if field == "models[0].weight")
        ));
    }

    #[test]
    fn validate_returns_all_errors_at_once() {
        let mut config = EnsembleConfig::default();
        config.concurrency = 0;
        config.run_deadline_seconds = 0;
        // Empty models, empty prompt id and template, zero concurrency,
        // zero deadline: every check should report.
        let errors = config.validate().unwrap_err();
        assert!(
            errors.len() >= 5,
            "expected at least 5 errors, got {}: {:?}",
            errors.len(),
            errors
        );
    }

    #[test]
    fn render_substitutes_and_appends_examples() {
        let variant = PromptVariant {
            id: "v1".to_string(),
            template: "Title: {title}\nBody: {content}".to_string(),
            examples: vec!["{\"score\": -0.5}".to_string()],
        };
        let prompt = variant.render("Headline", "Some text");
        assert!(prompt.starts_with("Title: Headline\nBody: Some text"));
        assert!(prompt.ends_with("{\"score\": -0.5}"));
    }

    #[test]
    fn handle_swap_only_affects_new_reads() {
        let handle = EnsembleHandle::new(EnsembleConfig::default());
        let before = handle.current();
        let mut next = EnsembleConfig::default();
        next.concurrency = 9;
        handle.swap(next);
        assert_eq!(before.concurrency, 4);
        assert_eq!(handle.current().concurrency, 9);
    }

    #[test]
    fn perspective_order_is_fixed() {
        let names: Vec<&str> = Perspective::ORDER.iter().map(|p| p.as_str()).collect();
        assert_eq!(names, vec!["center", "left", "neutral", "right"]);
    }
}
