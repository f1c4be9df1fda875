use reqwest::Client;

use super::anthropic::AnthropicProvider;
use super::openai::OpenAiProvider;
use super::{LlmProvider, OLLAMA_PREFIX, ProviderError, ProviderKind};
use crate::config::{ProviderSettings, ProvidersConfig};

/// Picks the provider for a model. The runner calls this once per run.
pub trait ProviderSource: Send + Sync {
    fn provider_for(&self, model: &str) -> Result<Box<dyn LlmProvider>, ProviderError>;
}

/// Providers built from the daemon configuration.
pub struct ConfiguredProviders {
    config: ProvidersConfig,
}

impl ConfiguredProviders {
    pub fn new(config: ProvidersConfig) -> Self {
        Self { config }
    }
}

fn http_client(kind: ProviderKind, settings: &ProviderSettings) -> Result<Client, ProviderError> {
    Client::builder()
        .timeout(settings.timeout())
        .build()
        .map_err(|e| ProviderError::RequestFailed {
            provider: kind.to_string(),
            reason: e.to_string(),
        })
}

fn require_key<'a>(
    kind: ProviderKind,
    settings: &'a ProviderSettings,
    env_var: &'static str,
) -> Result<&'a str, ProviderError> {
    settings.api_key().ok_or_else(|| ProviderError::MissingApiKey {
        provider: kind.to_string(),
        env_var,
    })
}

impl ProviderSource for ConfiguredProviders {
    fn provider_for(&self, model: &str) -> Result<Box<dyn LlmProvider>, ProviderError> {
        let kind = ProviderKind::from_model(model)
            .ok_or_else(|| ProviderError::UnsupportedModel(model.to_string()))?;

        let provider: Box<dyn LlmProvider> = match kind {
            ProviderKind::Anthropic => {
                let settings = &self.config.anthropic;
                let key = require_key(kind, settings, "ANTHROPIC_API_KEY")?;
                Box::new(AnthropicProvider::new(
                    http_client(kind, settings)?,
                    &settings.base_url,
                    key,
                    model,
                ))
            }
            ProviderKind::OpenAi => {
                let settings = &self.config.openai;
                let key = require_key(kind, settings, "OPENAI_API_KEY")?;
                Box::new(OpenAiProvider::new(
                    http_client(kind, settings)?,
                    kind,
                    &settings.base_url,
                    Some(key),
                    model,
                ))
            }
            ProviderKind::Ollama => {
                let settings = &self.config.ollama;
                let wire_model = model.strip_prefix(OLLAMA_PREFIX).unwrap_or(model);
                Box::new(OpenAiProvider::new(
                    http_client(kind, settings)?,
                    kind,
                    &settings.base_url,
                    settings.api_key(),
                    wire_model,
                ))
            }
        };
        Ok(provider)
    }
}
