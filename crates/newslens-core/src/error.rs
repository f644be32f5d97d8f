//! Error types for the newslens core library.
//!
//! Each module has its own error enum to provide clear error boundaries.
//! The library uses `thiserror` for structured, typed errors. Run-level
//! errors carry a stable machine-readable code for API responses.

/// Errors raised while loading or validating the service and ensemble
/// configuration documents.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A field the service cannot run without was left unset.
    #[error("config field '{field}' is required but unset")]
    MissingField {
        /// Dotted path of the absent field.
        field: String,
    },

    /// A field was present but its value is unusable.
    #[error("config field '{field}' rejected: {message}")]
    InvalidValue {
        /// Dotted path of the offending field.
        field: String,
        /// Why the value was rejected.
        message: String,
    },

    /// Nothing readable at the resolved config path.
    #[error("no config file at {path}")]
    FileNotFound {
        /// The path that was tried.
        path: String,
    },

    /// The service TOML did not deserialize.
    #[error("unreadable config file: {source}")]
    ParseError {
        /// The underlying TOML parse error.
        #[source]
        source: toml::de::Error,
    },

    /// The ensemble JSON did not deserialize.
    #[error("unreadable ensemble config: {message}")]
    EnsembleParse {
        /// The JSON-level failure, flattened to text.
        message: String,
    },
}

/// Classified outcomes of a single provider call, per attempt policy.
///
/// The ensemble engine branches on these kinds — never on message text.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Provider returned HTTP 429 (or a rate-limit body marker) and the
    /// retry budget is exhausted.
    #[error("provider rate limited{}", match .retry_after_secs {
        Some(secs) => format!(", retry after {secs}s"),
        None => String::new(),
    })]
    RateLimited {
        /// Seconds to wait before retrying, if the provider said so.
        retry_after_secs: Option<u64>,
    },

    /// Provider returned HTTP 402; it is dead for the remainder of the run.
    #[error("provider credits exhausted")]
    CreditsExhausted,

    /// Authentication failed with both the designated and the alternate key.
    #[error("provider authentication failed (HTTP {status})")]
    Auth {
        /// The final HTTP status code (401 or 403).
        status: u16,
    },

    /// 5xx, connection reset, or timeout after the retry budget.
    #[error("provider transient failure: {message}")]
    Transient {
        /// Details of the last failed attempt.
        message: String,
    },

    /// 2xx response whose body is not a parseable completion envelope.
    #[error("provider returned malformed response: {message}")]
    Malformed {
        /// Details of the envelope-level failure.
        message: String,
    },

    /// The call was cancelled before completing.
    #[error("provider call cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Stable machine-readable kind, used in progress messages and
    /// structured 503 bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::CreditsExhausted => "credits_exhausted",
            Self::Auth { .. } => "auth_error",
            Self::Transient { .. } => "transient",
            Self::Malformed { .. } => "malformed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the engine may retry this model later in the same run.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Transient { .. })
    }
}

/// Errors from the tolerant response parser.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    /// No JSON object could be located in the response text.
    #[error("no JSON object found in response")]
    NoJsonObject,

    /// A candidate JSON substring was found but did not deserialize.
    #[error("invalid JSON in response: {message}")]
    InvalidJson {
        /// The underlying serde_json failure, flattened to text.
        message: String,
    },

    /// The JSON object carries no recognisable score field.
    #[error("response JSON has no score field")]
    MissingScore,

    /// A numeric field was present but not coercible to a number.
    #[error("field '{field}' is not numeric: {value}")]
    NotNumeric {
        /// The field that failed coercion.
        field: String,
        /// The offending raw value.
        value: String,
    },

    /// The score was numeric but outside the clamp tolerance.
    #[error("score {value} outside tolerated range [-1.5, 1.5]")]
    ScoreOutOfRange {
        /// The out-of-tolerance value.
        value: f64,
    },

    /// The confidence was numeric but outside the clamp tolerance.
    #[error("confidence {value} outside tolerated range [-0.5, 1.5]")]
    ConfidenceOutOfRange {
        /// The out-of-tolerance value.
        value: f64,
    },
}

/// Failures from the SQLite persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The database file could not be opened or the pool could not connect.
    #[error("cannot open database: {source}")]
    Connection {
        /// The underlying SQLx failure.
        #[source]
        source: sqlx::Error,
    },

    /// The embedded migrations did not apply.
    #[error("schema migration failed: {source}")]
    Migration {
        /// The underlying migration failure.
        #[source]
        source: sqlx::migrate::MigrateError,
    },

    /// A single statement failed to execute.
    #[error("query failed: {source}")]
    Query {
        /// The underlying SQLx failure.
        #[source]
        source: sqlx::Error,
    },

    /// A write transaction kept conflicting past its retry budget.
    #[error("write transaction gave up after {attempts} attempts: {source}")]
    Transaction {
        /// How many times the transaction was tried.
        attempts: u32,
        /// The SQLx failure from the last attempt.
        #[source]
        source: sqlx::Error,
    },
}

/// Errors from the composite score calculator.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CalculatorError {
    /// No valid per-model result remained after filtering.
    #[error("no valid per-model results to aggregate")]
    NoValidResults,

    /// An invalid result was seen while `handle_invalid = fail`.
    #[error("model '{model}' produced an invalid result (score {score})")]
    InvalidResult {
        /// The offending model.
        model: String,
        /// Its out-of-range score.
        score: f64,
    },
}

/// One model's failure within a scoring run, for structured error bodies.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ModelFailure {
    /// Configured model name.
    pub model: String,
    /// Stable failure kind (`ProviderError::kind` or `parse_failure`).
    pub kind: String,
    /// Human-readable detail.
    pub message: String,
    /// Provider `Retry-After` hint, present only on rate-limit failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

/// Run-level errors surfaced by the score manager.
#[derive(Debug, thiserror::Error)]
pub enum ScoreError {
    /// Article id unknown.
    #[error("article {article_id} not found")]
    NotFound {
        /// The requested article id.
        article_id: i64,
    },

    /// Input failed validation.
    #[error("invalid input: {message}")]
    Invalid {
        /// What was wrong with the input.
        message: String,
    },

    /// Every configured model failed; no valid result to aggregate.
    #[error("no model produced a valid result ({} failures)", .failures.len())]
    ProviderUnavailable {
        /// Per-model failure kinds for the structured 503 body.
        failures: Vec<ModelFailure>,
    },

    /// Every configured model was rate limited; retry later.
    #[error("all providers rate limited{}", match .retry_after_secs {
        Some(secs) => format!(", retry after {secs}s"),
        None => String::new(),
    })]
    RateLimited {
        /// Largest Retry-After hint observed, if any.
        retry_after_secs: Option<u64>,
    },

    /// The run stopped before finishing, either because its deadline fired
    /// or because the caller (or service shutdown) cancelled it.
    #[error("scoring run {}", match .by_deadline {
        true => "deadline exceeded",
        false => "cancelled",
    })]
    Cancelled {
        /// True when the run's own deadline fired; false for explicit
        /// cancellation.
        by_deadline: bool,
    },

    /// Database write failed after retries; the run is marked failed.
    #[error("persistence failure: {0}")]
    Persistence(#[from] StorageError),

    /// The background rescore worker is disabled.
    #[error("background scoring is disabled")]
    ScoringDisabled,

    /// The rescore queue is at capacity.
    #[error("rescore queue is full")]
    QueueFull,

    /// A failure replayed from the negative cache for a coalesced caller.
    #[error("{message}")]
    Cached {
        /// The original run's stable error code.
        code: String,
        /// The original run's human message.
        message: String,
    },
}

impl ScoreError {
    /// Stable machine-readable code for API error envelopes.
    pub fn code(&self) -> &str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::Invalid { .. } => "invalid",
            Self::ProviderUnavailable { .. } => "provider_unavailable",
            Self::RateLimited { .. } => "rate_limited",
            Self::Cancelled { .. } => "cancelled",
            Self::Persistence(_) => "persistence",
            Self::ScoringDisabled => "scoring_disabled",
            Self::QueueFull => "rate_limited",
            Self::Cached { code, .. } => code,
        }
    }
}
