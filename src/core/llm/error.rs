use std::time::Duration;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("{provider} rate limited the request")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },
    #[error("{provider} server error (HTTP {status}): {message}")]
    Server {
        provider: String,
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("{provider} rejected the credentials: {message}")]
    Auth { provider: String, message: String },
    #[error("{provider} API error (HTTP {status}): {message}")]
    Api {
        provider: String,
        status: u16,
        message: String,
    },
    #[error("{provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },
    #[error("{provider} returned an invalid response: {reason}")]
    InvalidResponse { provider: String, reason: String },
    #[error("unsupported model '{0}': expected a claude-*, gpt-*, o1/o3/o4, chatgpt-* or ollama/* model")]
    UnsupportedModel(String),
    #[error("no API key configured for {provider} (set {env_var})")]
    MissingApiKey {
        provider: String,
        env_var: &'static str,
    },
}

impl ProviderError {
    /// Rate limits and 5xx responses; everything else fails immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. } | ProviderError::Server { .. }
        )
    }

    /// The provider's own retry hint, when it sent one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after, .. }
            | ProviderError::Server { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
