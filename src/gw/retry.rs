//! Bounded retries with exponential jittered backoff.
//!
//! Applied to every HTTP call against the gateway. Transient failures
//! (5xx gateway statuses, timeouts, connection EOF) are retried up to a
//! configured number of attempts; anything else surfaces immediately.

use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::GwError;
use crate::conf::Config;

/// Retry configuration for gateway HTTP calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay floor for the first retry.
    pub base_delay: Duration,
    /// Delay ceiling.
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &dyn Config) -> RetryPolicy {
        RetryPolicy {
            max_attempts: cfg.gw_max_attempts(),
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_millis(cfg.gw_max_backoff()),
        }
    }

    /// The delay before the given (1-based) retry: exponential growth
    /// from the base, jittered uniformly, never below the base and
    /// never above the ceiling.
    fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as u64;
        let ceiling = self.max_delay.as_millis() as u64;

        let exp = base.saturating_mul(1u64 << attempt.saturating_sub(1).min(32)).min(ceiling);
        if exp <= base {
            return Duration::from_millis(base.min(ceiling));
        }

        let jittered = rand::thread_rng().gen_range(base..=exp);
        Duration::from_millis(jittered)
    }
}

fn retryable_status(status: reqwest::StatusCode) -> bool {
    matches!(status.as_u16(), 500 | 502 | 503 | 504)
}

fn is_eof_error(err: &reqwest::Error) -> bool {
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::UnexpectedEof {
                return true;
            }
        }
        source = cause.source();
    }
    false
}

fn retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || is_eof_error(err)
}

/// Sends a request, retrying per the policy. The request is rebuilt for
/// each attempt via `build`. Returns the final response (success or a
/// non-retryable status) or the final error.
pub(crate) async fn send_with_retries<B>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    method: &str,
    url: &str,
    build: B,
) -> Result<reqwest::Response, GwError>
where
    B: Fn() -> Result<reqwest::RequestBuilder, GwError>,
{
    let mut attempt: u32 = 1;

    loop {
        if token.is_cancelled() {
            return Err(GwError::Cancelled);
        }

        let request = build()?;
        let outcome = tokio::select! {
            _ = token.cancelled() => return Err(GwError::Cancelled),
            outcome = request.send() => outcome,
        };
        let may_retry = attempt < policy.max_attempts;

        match outcome {
            Ok(resp) if may_retry && retryable_status(resp.status()) => {
                warn!(
                    method,
                    url,
                    status = %resp.status(),
                    attempt,
                    "Retrying failed request"
                );
            }
            Ok(resp) => {
                debug!(method, url, status = %resp.status(), "Not retrying request");
                return Ok(resp);
            }
            Err(err) if may_retry && retryable_error(&err) => {
                warn!(method, url, error = %err, attempt, "Retrying failed request");
            }
            Err(err) => {
                return Err(GwError::Request {
                    method: method.to_string(),
                    url: url.to_string(),
                    source: err,
                });
            }
        }

        let delay = policy.delay_for(attempt);
        tokio::select! {
            _ = token.cancelled() => return Err(GwError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}
