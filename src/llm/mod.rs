//! LLM integration.
//!
//! Supports:
//! - **Anthropic**: Messages API over reqwest
//! - **OpenAI**: Chat Completions API over reqwest
//!
//! `LlmAssistant` turns any `LlmProvider` into the pipeline's `LanguageModel`.

mod anthropic;
mod assistant;
mod openai;
pub mod provider;

pub use anthropic::AnthropicProvider;
pub use assistant::LlmAssistant;
pub use openai::OpenAiProvider;
pub use provider::*;

use std::str::FromStr;
use std::sync::Arc;

use secrecy::SecretString;

use crate::config::{VarLookup, optional_var, parse_var};
use crate::error::ConfigError;

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LlmBackend {
    #[default]
    Anthropic,
    OpenAi,
}

impl LlmBackend {
    pub fn default_model(self) -> &'static str {
        match self {
            Self::Anthropic => "claude-sonnet-4-20250514",
            Self::OpenAi => "gpt-4o",
        }
    }
}

impl FromStr for LlmBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "openai" | "open_ai" => Ok(Self::OpenAi),
            other => Err(format!("unknown backend '{other}', expected anthropic or openai")),
        }
    }
}

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: SecretString,
    pub model: String,
}

impl LlmConfig {
    pub fn from_vars(vars: VarLookup<'_>) -> Result<Self, ConfigError> {
        let backend: LlmBackend = parse_var(vars, "LLM_BACKEND", LlmBackend::default())?;
        let api_key = optional_var(vars, "LLM_API_KEY")
            .ok_or_else(|| ConfigError::MissingEnvVar("LLM_API_KEY".into()))?;
        let model = optional_var(vars, "LLM_MODEL")
            .unwrap_or_else(|| backend.default_model().to_string());
        Ok(Self {
            backend,
            api_key: SecretString::from(api_key),
            model,
        })
    }
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig, client: reqwest::Client) -> Arc<dyn LlmProvider> {
    match config.backend {
        LlmBackend::Anthropic => {
            tracing::info!("Using Anthropic (model: {})", config.model);
            Arc::new(AnthropicProvider::new(
                client,
                config.api_key.clone(),
                &config.model,
            ))
        }
        LlmBackend::OpenAi => {
            tracing::info!("Using OpenAI (model: {})", config.model);
            Arc::new(OpenAiProvider::new(
                client,
                config.api_key.clone(),
                &config.model,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn config_requires_api_key() {
        let vars = lookup(&[]);
        let err = LlmConfig::from_vars(&vars).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k == "LLM_API_KEY"));
    }

    #[test]
    fn config_defaults_model_per_backend() {
        let vars = lookup(&[("LLM_API_KEY", "sk-test"), ("LLM_BACKEND", "OpenAI")]);
        let config = LlmConfig::from_vars(&vars).unwrap();
        assert_eq!(config.backend, LlmBackend::OpenAi);
        assert_eq!(config.model, "gpt-4o");
        assert_eq!(config.api_key.expose_secret(), "sk-test");
    }

    #[test]
    fn config_rejects_unknown_backend() {
        let vars = lookup(&[("LLM_API_KEY", "k"), ("LLM_BACKEND", "llama")]);
        assert!(matches!(
            LlmConfig::from_vars(&vars),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn create_provider_uses_configured_model() {
        let config = LlmConfig {
            backend: LlmBackend::Anthropic,
            api_key: SecretString::from("test-key"),
            model: "claude-test".to_string(),
        };
        let provider = create_provider(&config, reqwest::Client::new());
        assert_eq!(provider.model_name(), "claude-test");
    }
}
