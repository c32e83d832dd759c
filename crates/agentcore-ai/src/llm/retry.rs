//! Provider-level retry policy. Only requests that have not produced a
//! single chunk are retried.

use std::time::Duration;

use reqwest::Response;

use crate::error::AiError;

const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Clone)]
pub struct LlmRetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for LlmRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 200,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl LlmRetryConfig {
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based). A server supplied
    /// `retry-after` wins over the exponential schedule.
    pub fn delay_for(&self, attempt: u32, retry_after_secs: Option<u64>) -> Duration {
        if let Some(seconds) = retry_after_secs {
            return Duration::from_secs(seconds);
        }

        let exponent = attempt.saturating_sub(1) as i32;
        let delay = (self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent)) as u64;
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    pub fn should_retry(&self, error: &AiError, attempt: u32) -> bool {
        attempt < self.max_retries && error.is_retryable()
    }
}

pub fn parse_retry_after(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
}

/// Turn a non-success response into an error, keeping at most
/// [`MAX_ERROR_BODY`] bytes of the body.
pub async fn response_to_error(response: Response, provider: &str) -> AiError {
    let status = response.status().as_u16();
    let retry_after = parse_retry_after(&response);
    let body = response.text().await.unwrap_or_default();

    AiError::LlmHttp {
        provider: provider.to_string(),
        status,
        message: truncate_body(body),
        retry_after_secs: retry_after,
    }
}

fn truncate_body(body: String) -> String {
    if body.len() <= MAX_ERROR_BODY {
        return body;
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [truncated]", &body[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http_error(status: u16) -> AiError {
        AiError::LlmHttp {
            provider: "Test".to_string(),
            status,
            message: String::new(),
            retry_after_secs: None,
        }
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let config = LlmRetryConfig::default();
        assert_eq!(config.delay_for(1, None), Duration::from_millis(200));
        assert_eq!(config.delay_for(3, None), Duration::from_millis(800));
        assert_eq!(config.delay_for(9, None), Duration::from_millis(5000));
        assert_eq!(config.delay_for(2, Some(7)), Duration::from_secs(7));
    }

    #[test]
    fn test_should_retry_only_transient_errors() {
        let config = LlmRetryConfig::default();
        assert!(config.should_retry(&http_error(429), 0));
        assert!(config.should_retry(&http_error(503), 2));
        assert!(!config.should_retry(&http_error(503), 3));
        assert!(!config.should_retry(&http_error(400), 0));
        assert!(!LlmRetryConfig::disabled().should_retry(&http_error(500), 0));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let body = "é".repeat(400);
        let truncated = truncate_body(body);
        assert!(truncated.ends_with("[truncated]"));
        assert!(truncated.len() < 600);
    }
}
