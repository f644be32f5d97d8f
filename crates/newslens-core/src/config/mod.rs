//! Configuration management for newslens.
//!
//! Two documents are involved:
//! 1. The service config (TOML): server binding, storage path, provider
//!    credentials, scoring knobs. Loaded once at startup with environment
//!    variable overrides.
//! 2. The ensemble config (JSON, [`ensemble`]): which models score an
//!    article and how verdicts are fused. Hot-reloadable via [`watch`].

pub mod ensemble;
pub mod watch;

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level service configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// HTTP server binding.
    #[serde(default)]
    pub server: ServerConfig,

    /// Data storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,

    /// LLM provider credentials and transport settings.
    #[serde(default)]
    pub llm: LlmConfig,

    /// Scoring subsystem knobs.
    #[serde(default)]
    pub scoring: ScoringConfig,
}

/// HTTP server binding.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Data storage configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// LLM provider credentials and transport settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    /// Primary provider API key.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Fall-back key tried once on authentication failure.
    #[serde(default)]
    pub api_key_secondary: Option<String>,

    /// Default provider base URL for models that don't carry their own.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Per-call HTTP timeout in seconds.
    #[serde(default = "default_http_timeout")]
    pub http_timeout_seconds: u64,

    /// Global cap on outstanding provider calls across all runs.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_key_secondary: None,
            base_url: None,
            http_timeout_seconds: default_http_timeout(),
            max_concurrent_requests: default_max_concurrent(),
        }
    }
}

impl LlmConfig {
    /// Per-call HTTP timeout as a `Duration`.
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_seconds)
    }
}

/// Scoring subsystem knobs.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScoringConfig {
    /// Path to the ensemble JSON config.
    #[serde(default = "default_ensemble_path")]
    pub ensemble_path: String,

    /// Whether the background rescore worker runs.
    #[serde(default = "default_auto_analyze")]
    pub auto_analyze: bool,

    /// Seconds a terminal progress entry is retained after its last update.
    #[serde(default = "default_progress_retention")]
    pub progress_retention_seconds: u64,

    /// Seconds between progress/cache sweeper passes.
    #[serde(default = "default_progress_sweep")]
    pub progress_sweep_seconds: u64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            ensemble_path: default_ensemble_path(),
            auto_analyze: default_auto_analyze(),
            progress_retention_seconds: default_progress_retention(),
            progress_sweep_seconds: default_progress_sweep(),
        }
    }
}

// --- Default value functions for serde ---

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8090
}
fn default_db_path() -> String {
    "~/.newslens/newslens.db".to_string()
}
fn default_http_timeout() -> u64 {
    30
}
fn default_max_concurrent() -> u32 {
    32
}
fn default_ensemble_path() -> String {
    "~/.newslens/ensemble.json".to_string()
}
fn default_auto_analyze() -> bool {
    true
}
fn default_progress_retention() -> u64 {
    300
}
fn default_progress_sweep() -> u64 {
    60
}

impl Config {
    /// Load configuration from a TOML file with environment overrides.
    ///
    /// The loading sequence:
    /// 1. Determine config file path (argument > `NEWSLENS_CONFIG` env var
    ///    > default)
    /// 2. Parse TOML file (or use defaults if the default path is absent)
    /// 3. Apply environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Config, ConfigError> {
        let (path, explicit) = Self::resolve_config_path(config_path);

        let mut config = match std::fs::read_to_string(&path) {
            Ok(contents) => toml::from_str::<Config>(&contents)
                .map_err(|e| ConfigError::ParseError { source: e })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if explicit {
                    return Err(ConfigError::FileNotFound {
                        path: path.display().to_string(),
                    });
                }
                Config::default()
            }
            Err(_) => {
                return Err(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                });
            }
        };

        config.apply_env_overrides()?;

        Ok(config)
    }

    /// Resolve the config file path from arguments, env vars, or default.
    fn resolve_config_path(config_path: Option<&str>) -> (PathBuf, bool) {
        if let Some(path) = config_path {
            return (expand_tilde(path), true);
        }

        if let Ok(env_path) = env::var("NEWSLENS_CONFIG") {
            return (expand_tilde(&env_path), true);
        }

        (expand_tilde("~/.newslens/config.toml"), false)
    }

    /// Apply environment variable overrides.
    ///
    /// The provider variables use the flat names the deployment environment
    /// already exports (`LLM_API_KEY`, `LLM_BASE_URL`, ...), not a prefixed
    /// scheme.
    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = env::var("LLM_API_KEY") {
            self.llm.api_key = Some(val);
        }
        if let Ok(val) = env::var("LLM_API_KEY_SECONDARY") {
            self.llm.api_key_secondary = Some(val);
        }
        if let Ok(val) = env::var("LLM_BASE_URL") {
            self.llm.base_url = Some(val);
        }
        if let Ok(val) = env::var("LLM_HTTP_TIMEOUT") {
            self.llm.http_timeout_seconds =
                parse_env_duration_secs("LLM_HTTP_TIMEOUT", &val)?;
        }
        if let Ok(val) = env::var("NO_AUTO_ANALYZE") {
            if parse_env_bool("NO_AUTO_ANALYZE", &val)? {
                self.scoring.auto_analyze = false;
            }
        }
        if let Ok(val) = env::var("NEWSLENS_DB_PATH") {
            self.storage.db_path = val;
        }
        if let Ok(val) = env::var("NEWSLENS_ENSEMBLE_PATH") {
            self.scoring.ensemble_path = val;
        }
        Ok(())
    }
}

/// Resolve a leading `~` in a path against the user's home directory.
///
/// Paths without a tilde (or when no home directory is known) pass through
/// unchanged.
pub fn expand_tilde(path: &str) -> PathBuf {
    match (path, dirs::home_dir()) {
        ("~", Some(home)) => home,
        (p, Some(home)) if p.starts_with("~/") => home.join(&p[2..]),
        _ => PathBuf::from(path),
    }
}

/// Parse a duration value as seconds.
///
/// Accepts a bare number of seconds or a number with an `s`/`m`/`h` suffix.
fn parse_env_duration_secs(var_name: &str, val: &str) -> Result<u64, ConfigError> {
    let trimmed = val.trim();
    let (digits, multiplier) = match trimmed.chars().last() {
        Some('s') => (&trimmed[..trimmed.len() - 1], 1),
        Some('m') => (&trimmed[..trimmed.len() - 1], 60),
        Some('h') => (&trimmed[..trimmed.len() - 1], 3600),
        _ => (trimmed, 1),
    };
    digits
        .parse::<u64>()
        .map(|n| n * multiplier)
        .map_err(|_| ConfigError::InvalidValue {
            field: var_name.to_string(),
            message: format!("'{val}' is not a valid duration (use 30, 30s, 2m, 1h)"),
        })
}

/// Interpret an environment variable as a boolean switch.
///
/// `true`/`yes`/`1` enable and `false`/`no`/`0` disable, case-insensitively.
/// Anything else is an error so a typo doesn't silently pick a default.
fn parse_env_bool(var_name: &str, val: &str) -> Result<bool, ConfigError> {
    let normalized = val.trim().to_ascii_lowercase();
    if ["true", "yes", "1"].contains(&normalized.as_str()) {
        return Ok(true);
    }
    if ["false", "no", "0"].contains(&normalized.as_str()) {
        return Ok(false);
    }
    Err(ConfigError::InvalidValue {
        field: var_name.to_string(),
        message: format!("expected a boolean switch (true/false, yes/no, 1/0), got '{val}'"),
    })
}
