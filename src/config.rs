//! Process configuration loaded from the environment (and `.env`)

use crate::error::ReconciliationError;
use crate::Result;
use std::env;
use std::time::Duration;

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_TIMEOUT_SECS: u64 = 45;
pub const DEFAULT_MAX_PROMPT_CHARS: usize = 15_000;
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub gemini_api_key: String,
    pub gemini_model: String,
    pub port: u16,
    pub database_url: Option<String>,
    pub collaborator_timeout_secs: u64,
    pub max_prompt_chars: usize,
    pub max_upload_bytes: usize,
    pub redact_pii: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            gemini_api_key: String::new(),
            gemini_model: DEFAULT_MODEL.to_string(),
            port: DEFAULT_PORT,
            database_url: None,
            collaborator_timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_prompt_chars: DEFAULT_MAX_PROMPT_CHARS,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            redact_pii: true,
        }
    }
}

impl AppConfig {
    /// Read configuration from process environment. Call `dotenv` first.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let first = |keys: &[&str]| {
            keys.iter()
                .filter_map(|k| lookup(k))
                .map(|v| v.trim().to_string())
                .find(|v| !v.is_empty())
        };

        let gemini_api_key = first(&["GEMINI_API_KEY", "GOOGLE_API_KEY"]).unwrap_or_default();
        let gemini_model = first(&["GEMINI_MODEL"]).unwrap_or(defaults.gemini_model);
        let database_url = first(&["DATABASE_URL", "POSTGRES_URL"]);

        let port = parse_or(first(&["PORT", "API_PORT"]), "PORT", defaults.port)?;
        let collaborator_timeout_secs = parse_or(
            first(&["COLLABORATOR_TIMEOUT_SECS"]),
            "COLLABORATOR_TIMEOUT_SECS",
            defaults.collaborator_timeout_secs,
        )?;
        let max_prompt_chars = parse_or(
            first(&["MAX_PROMPT_CHARS"]),
            "MAX_PROMPT_CHARS",
            defaults.max_prompt_chars,
        )?;
        let max_upload_bytes = parse_or(
            first(&["MAX_UPLOAD_BYTES"]),
            "MAX_UPLOAD_BYTES",
            defaults.max_upload_bytes,
        )?;

        let redact_pii = match first(&["REDACT_PII"]) {
            None => defaults.redact_pii,
            Some(v) => match v.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    return Err(ReconciliationError::Config(format!(
                        "REDACT_PII must be a boolean, got '{}'",
                        other
                    )))
                }
            },
        };

        if collaborator_timeout_secs == 0 {
            return Err(ReconciliationError::Config(
                "COLLABORATOR_TIMEOUT_SECS must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            gemini_api_key,
            gemini_model,
            port,
            database_url,
            collaborator_timeout_secs,
            max_prompt_chars,
            max_upload_bytes,
            redact_pii,
        })
    }

    pub fn collaborator_timeout(&self) -> Duration {
        Duration::from_secs(self.collaborator_timeout_secs)
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, key: &str, default: T) -> Result<T> {
    match value {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| {
            ReconciliationError::Config(format!("{} has an invalid value: '{}'", key, raw))
        }),
    }
}
