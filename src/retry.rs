//! Retry policy for adapter reads
//!
//! Raw provider failures are sorted into classes once, at the adapter
//! boundary ([`rpc_failure`]), and [`with_retry`] re-runs reads whose class
//! is worth another try. Irreversible submissions never go through here;
//! their retry is an explicit workflow command.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::env_or;
use crate::error::{AdapterError, AdapterErrorKind, AdapterResult};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry; doubles per attempt
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    /// `ADAPTER_MAX_RETRIES` / `ADAPTER_RETRY_BACKOFF_MS`
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_retries: env_or("ADAPTER_MAX_RETRIES", defaults.max_retries),
            base_delay: Duration::from_millis(env_or(
                "ADAPTER_RETRY_BACKOFF_MS",
                defaults.base_delay.as_millis() as u64,
            )),
            ..defaults
        }
    }

    /// Single attempt
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay after failed attempt `attempt` (0-indexed), capped at `max_delay`
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

/// What a provider failure message says about trying again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Timeout,
    RateLimited,
    /// Node, gateway or replica hiccup
    Transient,
    /// The call itself is wrong; repeating it gives the same answer
    Permanent,
    Unknown,
}

impl ErrorClass {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorClass::Permanent)
    }
}

const TIMEOUT_MARKERS: &[&str] = &["timeout", "timed out", "deadline"];
const RATE_LIMIT_MARKERS: &[&str] = &["rate limit", "ratelimit", "too many requests", "429", "quota"];
const TRANSIENT_MARKERS: &[&str] = &[
    "connection",
    "network",
    "502",
    "503",
    "504",
    "unavailable",
    "canister is stopping",
    "node is behind",
];
const PERMANENT_MARKERS: &[&str] = &[
    "revert",
    "nonexistent token",
    "invalid argument",
    "canister not found",
    "method not found",
    "invalid param",
];

/// Classify a provider failure by its message
pub fn classify_error(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();
    let has = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));

    if has(TIMEOUT_MARKERS) {
        ErrorClass::Timeout
    } else if has(RATE_LIMIT_MARKERS) {
        ErrorClass::RateLimited
    } else if has(PERMANENT_MARKERS) {
        ErrorClass::Permanent
    } else if has(TRANSIENT_MARKERS) {
        ErrorClass::Transient
    } else {
        ErrorClass::Unknown
    }
}

/// Adapter error for a raw provider failure, with its kind taken from the
/// message class
pub fn rpc_failure(source: &str, message: impl Into<String>) -> AdapterError {
    let message = message.into();
    let kind = match classify_error(&message) {
        ErrorClass::Timeout => AdapterErrorKind::Timeout,
        ErrorClass::RateLimited => AdapterErrorKind::RateLimited,
        ErrorClass::Transient | ErrorClass::Permanent | ErrorClass::Unknown => AdapterErrorKind::Rpc,
    };
    AdapterError::new(kind, source, message)
}

fn worth_retrying(error: &AdapterError) -> bool {
    error.is_transient() && classify_error(&error.message).is_retryable()
}

/// Run a read until it succeeds, fails for good, or retries run out.
/// `operation` receives the 0-indexed attempt number.
pub async fn with_retry<F, T, Fut>(config: &RetryConfig, mut operation: F) -> AdapterResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = AdapterResult<T>>,
{
    let mut attempt = 0;
    loop {
        let error = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        if attempt >= config.max_retries || !worth_retrying(&error) {
            debug!(source = %error.source_name, attempts = attempt + 1, error = %error, "Read failed");
            return Err(error);
        }
        let delay = config.delay_after(attempt);
        warn!(
            source = %error.source_name,
            attempt = attempt + 1,
            max_retries = config.max_retries,
            ?delay,
            error = %error,
            "Read failed, retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
