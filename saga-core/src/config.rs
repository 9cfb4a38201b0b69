//! Engine and per-story configuration.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default database location when `SAGA_DATABASE_URL` is unset.
const DEFAULT_DATABASE_URL: &str = "sqlite://saga.db?mode=rwc";

/// Errors from loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

/// Process-wide engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// SQLite connection string for the story store.
    pub database_url: String,

    /// Model override for oracle calls.
    pub model: Option<String>,

    /// Maximum tokens for turn responses.
    pub max_tokens: usize,

    /// Temperature for turn generation.
    pub temperature: Option<f32>,

    /// Whether new stories start in tactical (grid) mode unless told otherwise.
    pub tactical_mode_default: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            model: None,
            max_tokens: 4096,
            temperature: Some(0.8),
            tactical_mode_default: false,
        }
    }
}

impl EngineConfig {
    /// Load settings from `SAGA_*` environment variables (and `.env`).
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let mut config = Self::default();

        if let Ok(url) = std::env::var("SAGA_DATABASE_URL") {
            config.database_url = url;
        }
        if let Ok(model) = std::env::var("SAGA_MODEL") {
            config.model = Some(model);
        }
        if let Ok(value) = std::env::var("SAGA_MAX_TOKENS") {
            config.max_tokens = value.parse().map_err(|_| ConfigError::InvalidValue {
                key: "SAGA_MAX_TOKENS",
                value,
            })?;
        }
        if let Ok(value) = std::env::var("SAGA_TEMPERATURE") {
            config.temperature = Some(value.parse().map_err(|_| ConfigError::InvalidValue {
                key: "SAGA_TEMPERATURE",
                value,
            })?);
        }
        if let Ok(value) = std::env::var("SAGA_TACTICAL_MODE") {
            config.tactical_mode_default = parse_flag(&value).ok_or(ConfigError::InvalidValue {
                key: "SAGA_TACTICAL_MODE",
                value,
            })?;
        }

        Ok(config)
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_tokens(mut self, tokens: usize) -> Self {
        self.max_tokens = tokens;
        self
    }

    pub fn with_temperature(mut self, temp: f32) -> Self {
        self.temperature = Some(temp);
        self
    }

    /// Apply model/token/temperature settings to an oracle request.
    pub fn apply(&self, mut request: oracle::Request) -> oracle::Request {
        request = request.with_max_tokens(self.max_tokens);
        if let Some(ref model) = self.model {
            request = request.with_model(model);
        }
        if let Some(temp) = self.temperature {
            request = request.with_temperature(temp);
        }
        request
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// The short configuration a new story is bootstrapped from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryConfig {
    pub title: String,
    pub genre: String,
    #[serde(default)]
    pub premise: String,
    pub player_name: String,
    #[serde(default)]
    pub player_concept: String,
    #[serde(default)]
    pub tactical_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl StoryConfig {
    /// Create a config with a title and sensible defaults.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            genre: "fantasy".to_string(),
            premise: String::new(),
            player_name: "Wanderer".to_string(),
            player_concept: String::new(),
            tactical_mode: false,
            language: None,
        }
    }

    pub fn with_genre(mut self, genre: impl Into<String>) -> Self {
        self.genre = genre.into();
        self
    }

    pub fn with_premise(mut self, premise: impl Into<String>) -> Self {
        self.premise = premise.into();
        self
    }

    pub fn with_player(mut self, name: impl Into<String>, concept: impl Into<String>) -> Self {
        self.player_name = name.into();
        self.player_concept = concept.into();
        self
    }

    pub fn with_tactical_mode(mut self, enabled: bool) -> Self {
        self.tactical_mode = enabled;
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_story_config_builder() {
        let config = StoryConfig::new("Ashes")
            .with_genre("noir")
            .with_player("Vex", "disgraced detective")
            .with_tactical_mode(true);

        assert_eq!(config.genre, "noir");
        assert_eq!(config.player_name, "Vex");
        assert!(config.tactical_mode);
    }

    #[test]
    fn test_engine_config_applies_to_request() {
        let config = EngineConfig::default()
            .with_model("small-model")
            .with_max_tokens(512);
        let request = config.apply(oracle::Request::new("hi"));
        assert_eq!(request.model.as_deref(), Some("small-model"));
        assert_eq!(request.max_tokens, 512);
        assert_eq!(request.temperature, Some(0.8));
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("Yes"), Some(true));
        assert_eq!(parse_flag("off"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }
}
