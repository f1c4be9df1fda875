use chrono::{DateTime, Utc};
use reqwest::RequestBuilder;
use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;
use std::time::Duration;

use super::ProviderError;

const MESSAGE_LIMIT: usize = 300;
const MAX_RETRY_AFTER_SECS: f64 = 86_400.0;

/// Send a JSON request and decode the success body, mapping HTTP failures
/// onto [`ProviderError`] classes.
pub(super) async fn send_json<T: DeserializeOwned>(
    provider: &str,
    request: RequestBuilder,
) -> Result<T, ProviderError> {
    let response = request
        .send()
        .await
        .map_err(|e| ProviderError::RequestFailed {
            provider: provider.to_string(),
            reason: if e.is_timeout() {
                "request timed out".to_string()
            } else {
                e.to_string()
            },
        })?;

    let status = response.status();
    if !status.is_success() {
        let retry_after = parse_retry_after(response.headers(), Utc::now());
        let body = response.text().await.unwrap_or_default();
        return Err(classify(provider, status.as_u16(), &body, retry_after));
    }

    let body = response
        .text()
        .await
        .map_err(|e| ProviderError::RequestFailed {
            provider: provider.to_string(),
            reason: e.to_string(),
        })?;
    serde_json::from_str(&body).map_err(|e| ProviderError::InvalidResponse {
        provider: provider.to_string(),
        reason: e.to_string(),
    })
}

pub(super) fn classify(
    provider: &str,
    status: u16,
    body: &str,
    retry_after: Option<Duration>,
) -> ProviderError {
    let provider = provider.to_string();
    let message = error_message(body);
    match status {
        429 => ProviderError::RateLimited {
            provider,
            retry_after,
        },
        500..=599 => ProviderError::Server {
            provider,
            status,
            message,
            retry_after,
        },
        401 | 403 => ProviderError::Auth { provider, message },
        _ => ProviderError::Api {
            provider,
            status,
            message,
        },
    }
}

/// `error.message` from a JSON error body, else the raw body, truncated.
fn error_message(body: &str) -> String {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string());
    if message.chars().count() > MESSAGE_LIMIT {
        let cut: String = message.chars().take(MESSAGE_LIMIT).collect();
        format!("{}...", cut)
    } else {
        message
    }
}

/// `retry-after-ms`, then `retry-after` as seconds or an HTTP date.
pub(super) fn parse_retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let header = |name: &str| headers.get(name).and_then(|h| h.to_str().ok()).map(str::trim);

    if let Some(ms) = header("retry-after-ms").and_then(|v| v.parse::<f64>().ok())
        && ms.is_finite()
        && ms >= 0.0
    {
        return Some(Duration::from_millis(ms as u64));
    }

    let value = header("retry-after")?;
    if let Ok(secs) = value.parse::<f64>() {
        return (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs.min(MAX_RETRY_AFTER_SECS)));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_str(v).unwrap());
        }
        map
    }

    #[test]
    fn status_classes() {
        assert!(classify("openai", 429, "", None).is_transient());
        assert!(classify("anthropic", 529, "overloaded", None).is_transient());
        assert!(classify("openai", 503, "", None).is_transient());
        assert!(!classify("openai", 400, "", None).is_transient());
        assert!(matches!(
            classify("openai", 401, "", None),
            ProviderError::Auth { .. }
        ));
    }

    #[test]
    fn json_error_message_is_extracted() {
        let err = classify(
            "anthropic",
            400,
            r#"{"type":"error","error":{"type":"invalid_request_error","message":"max_tokens: too large"}}"#,
            None,
        );
        assert_eq!(
            err.to_string(),
            "anthropic API error (HTTP 400): max_tokens: too large"
        );
    }

    #[test]
    fn retry_after_forms() {
        let now = Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap();
        assert_eq!(
            parse_retry_after(&headers(&[("retry-after", "7")]), now),
            Some(Duration::from_secs(7))
        );
        assert_eq!(
            parse_retry_after(&headers(&[("retry-after-ms", "1500"), ("retry-after", "9")]), now),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(
            parse_retry_after(&headers(&[("retry-after", "Fri, 16 Oct 2026 12:00:30 GMT")]), now),
            Some(Duration::from_secs(30))
        );
        assert_eq!(parse_retry_after(&headers(&[("retry-after", "soon")]), now), None);
        assert_eq!(parse_retry_after(&HeaderMap::new(), now), None);
    }
}
