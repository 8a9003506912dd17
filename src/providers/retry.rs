//! Retry policy for LLM API calls.
//!
//! All call sites share one combinator, [`with_retry`], parameterized by a
//! string classifier. Quota exhaustion never retries; rate limits and
//! transient server errors back off exponentially, with a 60s floor when the
//! provider message mentions a per-minute window.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const MAX_ATTEMPTS: u32 = 5;
const BASE_DELAY_SECS: f64 = 2.0;

/// Coarse classification of an API failure, driving the retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Account out of credits/quota. Fatal for the whole run, never retried.
    FatalQuota,
    /// HTTP 429 and friends. Retried with backoff.
    RateLimit,
    /// Timeouts, 5xx, socket errors. Retried with backoff.
    Transient,
    /// Anything else. Not retried.
    Other,
}

/// Terminal failure after the retry policy gave up (or refused to start).
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct RetryError {
    pub class: ErrorClass,
    pub attempts: u32,
    pub message: String,
}

/// Detect "out of credits / insufficient balance" errors across providers.
/// Some proxies localize the message, so a few non-English phrasings are
/// matched verbatim.
fn is_insufficient_balance(message: &str) -> bool {
    let lower = message.to_lowercase();
    if lower.contains("402") || lower.contains("insufficient balance") {
        return true;
    }
    const KEYWORDS: &[&str] = &[
        "insufficient_quota",
        "insufficient quota",
        "insufficient_balance",
        "exceeded your current quota",
        "quota exceeded",
        "payment required",
        "billing",
        "recharge",
        "top up",
        "out of credit",
        "no credit",
    ];
    if KEYWORDS.iter().any(|k| lower.contains(k)) {
        return true;
    }
    // Localized provider messages seen behind some proxies.
    message.contains("余额不足") || message.contains("欠费")
}

/// Classify an API error message into a retry class.
pub fn classify_api_error(message: &str) -> ErrorClass {
    if is_insufficient_balance(message) {
        return ErrorClass::FatalQuota;
    }
    let lower = message.to_lowercase();
    if lower.contains("429") || lower.contains("rate limit") {
        return ErrorClass::RateLimit;
    }
    if lower.contains("timeout")
        || lower.contains("500")
        || lower.contains("502")
        || lower.contains("503")
        || lower.contains("connection")
    {
        return ErrorClass::Transient;
    }
    ErrorClass::Other
}

/// Backoff before retry `attempt` (1-based): `2 * 2^(attempt-1)` seconds.
/// Rate limits quoting a per-minute window wait at least 60s to cross the
/// provider's reset boundary.
pub fn retry_wait(attempt: u32, message: &str, class: ErrorClass) -> Duration {
    let mut wait = BASE_DELAY_SECS * f64::from(1u32 << (attempt.saturating_sub(1)).min(16));
    if class == ErrorClass::RateLimit {
        let lower = message.to_lowercase();
        if ["per min", "tpm", "rpm"].iter().any(|m| lower.contains(m)) {
            wait = wait.max(60.0);
        }
    }
    Duration::from_secs_f64(wait)
}

/// Run `op` with the shared retry policy. Successful attempts return the
/// value; quota exhaustion and non-retryable errors return immediately;
/// retryable errors back off up to [`MAX_ATTEMPTS`] total attempts.
///
/// `cancel` aborts the backoff sleep early; a cancelled wait surfaces as a
/// `Transient` error so the caller's deadline check decides what happens.
pub async fn with_retry<T, F, Fut>(
    label: &str,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let message = format!("{err:#}");
                let class = classify_api_error(&message);
                match class {
                    ErrorClass::FatalQuota => {
                        tracing::warn!(%label, "LLM API credits/quota exhausted: {message}");
                        return Err(RetryError {
                            class,
                            attempts: attempt,
                            message,
                        });
                    }
                    ErrorClass::Other => {
                        tracing::error!(%label, "LLM API call failed (non-retryable): {message}");
                        return Err(RetryError {
                            class,
                            attempts: attempt,
                            message,
                        });
                    }
                    ErrorClass::RateLimit | ErrorClass::Transient => {
                        if attempt >= MAX_ATTEMPTS {
                            tracing::error!(
                                %label,
                                attempts = attempt,
                                "LLM API call failed after retries: {message}"
                            );
                            return Err(RetryError {
                                class,
                                attempts: attempt,
                                message,
                            });
                        }
                        let wait = retry_wait(attempt, &message, class);
                        tracing::warn!(
                            %label,
                            attempt,
                            wait_secs = wait.as_secs(),
                            "LLM API call failed, retrying: {message}"
                        );
                        tokio::select! {
                            () = cancel.cancelled() => {
                                return Err(RetryError {
                                    class: ErrorClass::Transient,
                                    attempts: attempt,
                                    message: format!("cancelled while backing off: {message}"),
                                });
                            }
                            () = tokio::time::sleep(wait) => {}
                        }
                    }
                }
            }
        }
    }
}
