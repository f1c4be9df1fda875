use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::tools::ServerConfig;
use crate::platform::{NativePlatform, Platform};

pub const CONFIG_FILE: &str = "config.toml";
pub const DEFAULT_API_PORT: u16 = 17920;

/// Daemon configuration, read from `<data_dir>/config.toml`.
/// Every field has a default so a missing or partial file is valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub api: ApiConfig,
    pub runner: RunnerConfig,
    pub providers: ProvidersConfig,
    pub servers: Vec<NamedServerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_API_PORT,
        }
    }
}

impl ApiConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub max_iterations: usize,
    pub max_tokens: u32,
    pub result_preview_chars: usize,
    pub retry: RetryConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            max_tokens: 4096,
            result_preview_chars: 500,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub fallback_delay_secs: u64,
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            fallback_delay_secs: 5,
            max_delay_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub anthropic: ProviderSettings,
    pub openai: ProviderSettings,
    pub ollama: ProviderSettings,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            anthropic: ProviderSettings::hosted("https://api.anthropic.com/v1"),
            openai: ProviderSettings::hosted("https://api.openai.com/v1"),
            ollama: ProviderSettings {
                api_key: None,
                base_url: "http://127.0.0.1:11434/v1".to_string(),
                timeout_secs: 600,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    pub base_url: String,
    pub timeout_secs: u64,
}

impl ProviderSettings {
    fn hosted(base_url: &str) -> Self {
        Self {
            api_key: None,
            base_url: base_url.to_string(),
            timeout_secs: 120,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// The configured key, ignoring blank strings.
    pub fn api_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }
}

/// One `[[servers]]` entry: a tool server spawned at daemon start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedServerConfig {
    pub name: String,
    #[serde(flatten)]
    pub server: ServerConfig,
}

impl DaemonConfig {
    /// Load `config.toml` from `data_dir` and apply environment overrides.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(CONFIG_FILE);
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            Self::parse(&raw).with_context(|| format!("invalid {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("ANTHROPIC_API_KEY") {
            self.providers.anthropic.api_key = Some(key);
        }
        if let Some(key) = lookup("OPENAI_API_KEY") {
            self.providers.openai.api_key = Some(key);
        }
        if let Some(url) = lookup("OLLAMA_BASE_URL") {
            self.providers.ollama.base_url = url;
        }
        if let Some(port) = lookup("AGENTD_API_PORT").and_then(|p| p.parse().ok()) {
            self.api.port = port;
        }
    }
}

pub fn data_dir() -> PathBuf {
    NativePlatform::data_dir()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_apply_when_file_is_empty() {
        let config = DaemonConfig::parse("").unwrap();
        assert_eq!(config.api.port, DEFAULT_API_PORT);
        assert_eq!(config.runner.max_iterations, 20);
        assert_eq!(config.runner.retry.max_attempts, 3);
        assert_eq!(config.providers.anthropic.timeout_secs, 120);
        assert_eq!(config.providers.ollama.timeout_secs, 600);
        assert!(config.servers.is_empty());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let raw = r#"
            [runner]
            max_iterations = 5

            [runner.retry]
            fallback_delay_secs = 1

            [[servers]]
            name = "fs"
            command = "npx"
            args = ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"]

            [servers.env]
            LOG_LEVEL = "debug"
        "#;
        let config = DaemonConfig::parse(raw).unwrap();
        assert_eq!(config.runner.max_iterations, 5);
        assert_eq!(config.runner.max_tokens, 4096);
        assert_eq!(config.runner.retry.fallback_delay_secs, 1);
        assert_eq!(config.runner.retry.max_attempts, 3);
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.servers[0].name, "fs");
        assert_eq!(config.servers[0].server.command, "npx");
        assert_eq!(config.servers[0].server.args.len(), 3);
        assert_eq!(
            config.servers[0].server.env.get("LOG_LEVEL").map(String::as_str),
            Some("debug")
        );
    }

    #[test]
    fn environment_overrides_keys_and_port() {
        let env: HashMap<&str, &str> = [
            ("ANTHROPIC_API_KEY", "sk-ant"),
            ("OLLAMA_BASE_URL", "http://gpu-box:11434/v1"),
            ("AGENTD_API_PORT", "18000"),
        ]
        .into_iter()
        .collect();
        let mut config = DaemonConfig::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.providers.anthropic.api_key(), Some("sk-ant"));
        assert_eq!(config.providers.openai.api_key(), None);
        assert_eq!(config.providers.ollama.base_url, "http://gpu-box:11434/v1");
        assert_eq!(config.api.port, 18000);
    }

    #[test]
    fn blank_api_key_counts_as_missing() {
        let mut settings = ProviderSettings::hosted("https://example.invalid");
        settings.api_key = Some("   ".to_string());
        assert_eq!(settings.api_key(), None);
    }
}
