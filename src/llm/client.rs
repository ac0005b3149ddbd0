use super::{GenerationError, Provider};
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

/// Maximum length for upstream bodies quoted in error messages
const MAX_ERROR_CONTENT_LEN: usize = 200;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 1000;
const BACKOFF_MULTIPLIER: u32 = 2;
const DEFAULT_ATTEMPT_TIMEOUT_SECS: u64 = 90;

/// Retry budget for one generation call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    /// Wall-clock limit applied to each attempt
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: Duration::from_millis(DEFAULT_INITIAL_BACKOFF_MS),
            attempt_timeout: Duration::from_secs(DEFAULT_ATTEMPT_TIMEOUT_SECS),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = BACKOFF_MULTIPLIER.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor)
    }
}

/// Run `op` under `policy`: each attempt gets its own timeout, transient
/// failures are retried with doubling delay, anything else returns at once.
pub async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    provider: Provider,
    mut op: F,
) -> Result<T, GenerationError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GenerationError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let result = match timeout(policy.attempt_timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(GenerationError::Timeout {
                provider,
                secs: policy.attempt_timeout.as_secs(),
            }),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let delay = policy.backoff(attempt);
                tracing::warn!(
                    provider = %provider,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "generation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Create a configured HTTP client for model requests
pub fn create_http_client(timeout_secs: u64) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))
}

/// Request URLs can carry credentials, so they never reach the message.
pub(crate) fn map_transport_error(provider: Provider, err: reqwest::Error) -> GenerationError {
    let err = err.without_url();
    if err.is_decode() {
        return GenerationError::Decode {
            provider,
            message: err.to_string(),
        };
    }
    let message = if err.is_timeout() {
        format!("{} request timed out", provider)
    } else if err.is_connect() {
        format!("could not connect to {}", provider)
    } else {
        err.to_string()
    };
    GenerationError::Transport {
        provider,
        message,
        retryable: err.is_timeout() || err.is_connect() || err.is_request() || err.is_body(),
    }
}

/// Sanitize API response content for error messages to prevent credential leakage.
pub(crate) fn sanitize_api_response(content: &str) -> String {
    const SECRET_PATTERNS: &[&str] = &[
        "api_key",
        "apikey",
        "key=",
        "secret",
        "password",
        "credential",
        "bearer",
        "sk-",
        "aiza",
    ];

    let truncated = truncate_str(content, MAX_ERROR_CONTENT_LEN);

    let lower = truncated.to_lowercase();
    if SECRET_PATTERNS.iter().any(|pattern| lower.contains(pattern)) {
        return "(response details redacted - may contain sensitive data)".to_string();
    }

    truncated.to_string()
}

/// Truncate a string for display (Unicode-safe)
pub(crate) fn truncate_str(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &s[..byte_idx],
        None => s,
    }
}
