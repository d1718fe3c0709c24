//! Retry executor with exponential backoff and jitter.
//!
//! Every outbound backend call goes through [`RetryExecutor::attempt`]. The
//! call is bounded by a timeout; 4xx and malformed requests fail at once,
//! while 5xx, timeouts and transport failures are retried up to
//! `max_retries` times.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::types::DeliveryOutcome;

/// Longest response body kept in an error, in bytes.
const MAX_ERROR_BODY: usize = 512;

/// Lower bound of the jitter factor.
const JITTER_MIN: f64 = 0.75;

/// Upper bound of the jitter factor.
const JITTER_MAX: f64 = 1.25;

/// Failure of a single network call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    /// The server answered with a non-success status.
    #[error("HTTP {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },

    /// The call exceeded its timeout and was cancelled.
    #[error("call timed out")]
    Timeout,

    /// Connection, DNS or protocol failure.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The request could not be built or the response could not be read.
    #[error("malformed request: {0}")]
    Malformed(String),
}

impl CallError {
    /// Build a status error, truncating the body.
    pub fn status(status: u16, body: &str) -> Self {
        Self::Status {
            status,
            body: truncate_body(body),
        }
    }

    /// Whether a later attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => (500..600).contains(status),
            Self::Timeout | Self::Transport(_) => true,
            Self::Malformed(_) => false,
        }
    }
}

impl From<reqwest::Error> for CallError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_builder() {
            Self::Malformed(e.to_string())
        } else if let Some(status) = e.status() {
            Self::status(status.as_u16(), &e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

/// Cut `body` to at most [`MAX_ERROR_BODY`] bytes on a char boundary.
pub fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY {
        return body.to_owned();
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    format!("{}...", &body[..end])
}

/// Why [`RetryExecutor::attempt`] gave up.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetryFailure {
    /// Non-retryable error; no retry was attempted after it.
    #[error("rejected: {0}")]
    Rejected(CallError),

    /// Every allowed retry failed with a retryable error.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        /// Calls made, including the first.
        attempts: u32,
        /// Error from the final call.
        last: CallError,
    },
}

impl RetryFailure {
    /// Terminal queue outcome for this failure.
    pub fn outcome(&self) -> DeliveryOutcome {
        match self {
            Self::Rejected(_) => DeliveryOutcome::RejectedByBackend,
            Self::Exhausted { .. } => DeliveryOutcome::Exhausted,
        }
    }
}

/// Backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed after the first call.
    pub max_retries: u32,
    /// Delay before the first retry, before jitter.
    pub base_delay: Duration,
    /// Growth factor per retry.
    pub multiplier: f64,
    /// Ceiling on the un-jittered delay.
    pub max_delay: Duration,
    /// Timeout for each individual call.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Un-jittered delay for retry `n` (0-indexed):
    /// `min(base_delay * multiplier^n, max_delay)`.
    pub fn base_delay_for(&self, n: u32) -> Duration {
        let exponent = i32::try_from(n).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let max = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs >= max {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Delay for retry `n` with a uniform jitter factor in `[0.75, 1.25]`.
    pub fn backoff_delay(&self, n: u32) -> Duration {
        let factor = rand::thread_rng().gen_range(JITTER_MIN..=JITTER_MAX);
        self.base_delay_for(n).mul_f64(factor)
    }
}

/// Runs network calls under a [`RetryPolicy`].
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// Create an executor.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Active policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Call `op` until it succeeds, fails permanently, or retries run out.
    ///
    /// `retries` is the caller's retry state: it is read as the index of the
    /// next backoff step and incremented once per retry performed. `label`
    /// identifies the call in logs.
    ///
    /// # Errors
    ///
    /// [`RetryFailure::Rejected`] on the first non-retryable error,
    /// [`RetryFailure::Exhausted`] when the retry budget is spent.
    pub async fn attempt<T, F, Fut>(
        &self,
        label: &str,
        retries: &mut u32,
        mut op: F,
    ) -> Result<T, RetryFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let mut calls: u32 = 0;
        loop {
            calls = calls.saturating_add(1);
            let result = match tokio::time::timeout(self.policy.call_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(CallError::Timeout),
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(RetryFailure::Rejected(e)),
                Err(e) => e,
            };

            if *retries >= self.policy.max_retries {
                return Err(RetryFailure::Exhausted {
                    attempts: calls,
                    last: err,
                });
            }

            let delay = self.policy.backoff_delay(*retries);
            *retries = retries.saturating_add(1);
            warn!(
                call = label,
                attempt = *retries,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "retrying after transient failure"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
