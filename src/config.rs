//! Engine configuration
//!
//! Read from the environment (with `.env` support). Every value has a
//! default except the LLM API key and database URL, which are only needed
//! by the components that use them.

use crate::error::{QueryBuilderError, Result};
use crate::generation::GenerationSettings;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmSettings {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub llm: LlmSettings,
    pub generation: GenerationSettings,
    pub strict_blocklist: bool,
    pub fragments_path: Option<PathBuf>,
    pub view_catalog_path: Option<PathBuf>,
    pub database_url: Option<String>,
    pub max_rows: usize,
    pub statement_timeout: Duration,
    pub bind_addr: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            llm: LlmSettings::default(),
            generation: GenerationSettings::default(),
            strict_blocklist: true,
            fragments_path: None,
            view_catalog_path: None,
            database_url: None,
            max_rows: 1000,
            statement_timeout: Duration::from_secs(15),
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
        }
    }
}

impl EngineConfig {
    /// Load `.env` if present, then read the process environment
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let llm = LlmSettings {
            api_key: get("OPENAI_API_KEY"),
            model: get("OPENAI_MODEL").unwrap_or(defaults.llm.model),
            base_url: get("OPENAI_BASE_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or(defaults.llm.base_url),
        };

        let max_attempts = parse_number(&get, "QUERY_MAX_ATTEMPTS", defaults.generation.max_attempts)?;
        if max_attempts == 0 {
            return Err(QueryBuilderError::Config(
                "QUERY_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        let generation = GenerationSettings {
            max_attempts,
            attempt_timeout: Duration::from_secs(parse_number(
                &get,
                "QUERY_ATTEMPT_TIMEOUT_SECS",
                defaults.generation.attempt_timeout.as_secs(),
            )?),
            max_consecutive_unavailable: parse_number(
                &get,
                "QUERY_MAX_CONSECUTIVE_UNAVAILABLE",
                defaults.generation.max_consecutive_unavailable,
            )?
            .max(1),
        };

        Ok(Self {
            llm,
            generation,
            strict_blocklist: parse_bool(&get, "QUERY_STRICT_BLOCKLIST", defaults.strict_blocklist)?,
            fragments_path: get("FRAGMENTS_PATH").map(PathBuf::from),
            view_catalog_path: get("VIEW_CATALOG_PATH").map(PathBuf::from),
            database_url: get("DATABASE_URL"),
            max_rows: parse_number(&get, "QUERY_MAX_ROWS", defaults.max_rows)?,
            statement_timeout: Duration::from_secs(parse_number(
                &get,
                "QUERY_STATEMENT_TIMEOUT_SECS",
                defaults.statement_timeout.as_secs(),
            )?),
            bind_addr: get("SERVER_ADDR").unwrap_or(defaults.bind_addr),
        })
    }
}

fn parse_number<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.parse::<T>().map_err(|_| {
            QueryBuilderError::Config(format!("{} must be a non-negative integer, got '{}'", key, raw))
        }),
    }
}

fn parse_bool<G>(get: &G, key: &str, default: bool) -> Result<bool>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).map(|v| v.to_lowercase()) {
        None => Ok(default),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => Err(QueryBuilderError::Config(format!(
            "{} must be true or false, got '{}'",
            key, v
        ))),
    }
}
