//! Shared HTTP plumbing: the outcome taxonomy for upstream requests and the
//! retry helper every outbound call goes through.
//!
//! Outcomes fall into three buckets: success, retryable (transport failures
//! and 5xx responses) and permanent (4xx, signing failures, API error codes).
//! The bucket is a tag on the error value so callers can branch without
//! string matching.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36 Edg/125.0.0.0";
pub const ORIGIN: &str = "https://www.bilibili.com";
pub const REFERER: &str = "https://www.bilibili.com/";

/// Transport timeout for a single HTTP call.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// One outcome of talking to the upstream API.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server error: HTTP {0}")]
    Server(u16),
    #[error("client error: HTTP {0}")]
    Client(u16),
    #[error("signing request failed: {0}")]
    Signing(String),
    #[error("api error code {code}: {message}")]
    Api { code: i64, message: String },
    #[error("decoding response body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("request cancelled")]
    Cancelled,
}

impl RequestError {
    /// Transport failures and 5xx responses are worth another attempt;
    /// everything else aborts the request immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Server(_))
    }

    /// Maps a non-success HTTP status to the matching error bucket.
    pub fn from_status(status: reqwest::StatusCode) -> Option<Self> {
        if status.is_server_error() {
            Some(Self::Server(status.as_u16()))
        } else if status.is_client_error() {
            Some(Self::Client(status.as_u16()))
        } else {
            None
        }
    }
}

/// Knobs for [`retry_request`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_ms: 800,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff capped at `max_delay`, plus a uniform jitter so
    /// parallel workers do not re-hit the API in lockstep.
    pub fn backoff_delay(&self, attempt: usize) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32 << attempt.min(16) as u32)
            .min(self.max_delay);
        if self.jitter_ms == 0 {
            return exp;
        }
        exp + Duration::from_millis(rand::thread_rng().gen_range(0..self.jitter_ms))
    }
}

/// Runs `op` until it succeeds, fails permanently, is cancelled, or
/// `max_attempts` retryable failures have been burned through. Every failed
/// attempt is logged together with the delay chosen before the next one.
pub async fn retry_request<T, F, Fut>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    what: &str,
    mut op: F,
) -> Result<T, RequestError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RequestError>>,
{
    let mut attempt = 0;
    loop {
        if token.is_cancelled() {
            return Err(RequestError::Cancelled);
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if !err.is_retryable() || attempt >= policy.max_attempts {
                    return Err(err);
                }
                let delay = policy.backoff_delay(attempt - 1);
                warn!(
                    error = %err,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "{what} failed, retrying after backoff"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = token.cancelled() => return Err(RequestError::Cancelled),
                }
            }
        }
    }
}

/// Builds the shared client with browser-like headers and the transport
/// timeout. The cookie is attached per request because it varies by caller.
pub fn build_client() -> anyhow::Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    headers.insert("Origin", HeaderValue::from_static(ORIGIN));
    headers.insert("Referer", HeaderValue::from_static(REFERER));

    let client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .default_headers(headers)
        .timeout(HTTP_TIMEOUT)
        .gzip(true)
        .build()?;
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            jitter_ms: 0,
        }
    }

    #[test]
    fn classifies_retryable_outcomes() {
        assert!(RequestError::Server(502).is_retryable());
        assert!(!RequestError::Client(404).is_retryable());
        assert!(!RequestError::Signing("no keys".into()).is_retryable());
        assert!(
            !RequestError::Api {
                code: -352,
                message: "risk control".into()
            }
            .is_retryable()
        );
        assert!(!RequestError::Cancelled.is_retryable());
    }

    #[test]
    fn maps_status_codes_to_buckets() {
        let server = RequestError::from_status(reqwest::StatusCode::BAD_GATEWAY);
        assert!(matches!(server, Some(RequestError::Server(502))));
        let client = RequestError::from_status(reqwest::StatusCode::FORBIDDEN);
        assert!(matches!(client, Some(RequestError::Client(403))));
        assert!(RequestError::from_status(reqwest::StatusCode::OK).is_none());
    }

    /// The backoff curve doubles per attempt and never exceeds the cap.
    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3),
            jitter_ms: 0,
        };
        assert_eq!(policy.backoff_delay(0), Duration::from_secs(1));
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(3));
        assert_eq!(policy.backoff_delay(10), Duration::from_secs(3));
    }

    #[test]
    fn backoff_jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_ms: 500,
        };
        for _ in 0..50 {
            let delay = policy.backoff_delay(0);
            assert!(delay >= Duration::from_secs(1));
            assert!(delay < Duration::from_millis(1500));
        }
    }

    #[tokio::test]
    async fn retries_transient_errors_up_to_limit() {
        let calls = AtomicUsize::new(0);
        let token = CancellationToken::new();
        let result: Result<(), _> = retry_request(&fast_policy(), &token, "test call", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(RequestError::Server(503)) }
        })
        .await;
        assert!(matches!(result, Err(RequestError::Server(503))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_abort_immediately() {
        let calls = AtomicUsize::new(0);
        let token = CancellationToken::new();
        let result: Result<(), _> = retry_request(&fast_policy(), &token, "test call", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(RequestError::Client(412)) }
        })
        .await;
        assert!(matches!(result, Err(RequestError::Client(412))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let calls = AtomicUsize::new(0);
        let token = CancellationToken::new();
        let result = retry_request(&fast_policy(), &token, "test call", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(RequestError::Server(500))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.expect("should succeed on third attempt"), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let token = CancellationToken::new();
        token.cancel();
        let result: Result<(), _> = retry_request(&fast_policy(), &token, "test call", || async {
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(RequestError::Cancelled)));
    }
}
