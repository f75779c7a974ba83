use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";
pub const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub endpoint: String,
    pub timeout: Duration,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            timeout: Duration::from_secs(120),
        }
    }
}

impl GeneratorConfig {
    /// Fills a missing key from a secrets file. A key already set wins.
    pub fn with_secrets_file(mut self, path: &Path) -> Result<Self, ConfigError> {
        if self.api_key.is_none() {
            let secrets = Secrets::load(path)?;
            self.api_key = secrets.api_key();
        }
        Ok(self)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub retry_on_rate_limit: bool,
    pub rate_limit_backoff: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry_on_rate_limit: true,
            rate_limit_backoff: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read secrets file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse secrets file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// `secrets.toml` layout: a top-level key, optionally nested under `[gemini]`.
#[derive(Debug, Default, Deserialize)]
pub struct Secrets {
    #[serde(rename = "GEMINI_API_KEY", default)]
    gemini_api_key: Option<String>,
    #[serde(default)]
    gemini: Option<GeminiSecrets>,
}

#[derive(Debug, Default, Deserialize)]
struct GeminiSecrets {
    api_key: Option<String>,
}

impl Secrets {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    pub fn api_key(&self) -> Option<String> {
        self.gemini_api_key
            .as_deref()
            .or_else(|| self.gemini.as_ref().and_then(|g| g.api_key.as_deref()))
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_level_key_is_read() {
        let secrets = Secrets::parse("GEMINI_API_KEY = \"abc123\"\n").unwrap();
        assert_eq!(secrets.api_key().as_deref(), Some("abc123"));
    }

    #[test]
    fn nested_table_is_read() {
        let secrets = Secrets::parse("[gemini]\napi_key = \" xyz \"\n").unwrap();
        assert_eq!(secrets.api_key().as_deref(), Some("xyz"));
    }

    #[test]
    fn blank_key_counts_as_missing() {
        let secrets = Secrets::parse("GEMINI_API_KEY = \"\"\nother = 1\n").unwrap();
        assert!(secrets.api_key().is_none());
    }

    #[test]
    fn explicit_key_beats_secrets_file() {
        let config = GeneratorConfig {
            api_key: Some("flag".to_string()),
            ..GeneratorConfig::default()
        };
        let config = config
            .with_secrets_file(Path::new("/definitely/missing/secrets.toml"))
            .unwrap();
        assert_eq!(config.api_key.as_deref(), Some("flag"));
    }

    #[test]
    fn missing_secrets_file_is_an_error() {
        let err = GeneratorConfig::default()
            .with_secrets_file(Path::new("/definitely/missing/secrets.toml"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
