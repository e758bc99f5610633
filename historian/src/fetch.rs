//! Outbound HTTP with per-attempt timeouts, status classification and backoff
//!
//! Every upstream call goes through [`RetryingFetcher::fetch`]:
//!
//! - 2xx returns the response.
//! - 4xx other than 429 fails immediately with [`FetchError::Client`].
//! - 429 waits for `Retry-After` seconds when present, otherwise exponential
//!   backoff capped at [`FetchPolicy::rate_limit_cap`].
//! - 5xx, transport failures and per-attempt timeouts back off exponentially,
//!   capped at [`FetchPolicy::server_error_cap`].
//!
//! The final attempt surfaces its own failure instead of sleeping again.

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP {status}: {body}")]
    Client { status: u16, body: String },

    #[error("HTTP {status}: {body}")]
    Exhausted { status: u16, body: String },

    #[error("Request timeout after {after:?}")]
    Timeout { after: Duration },

    #[error("Network error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Max retries exceeded")]
    MaxRetriesExceeded,

    #[error("Request cannot be replayed for retry")]
    NotCloneable,
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Client { status, .. } | FetchError::Exhausted { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self.status(), Some(401) | Some(403))
    }
}

pub type FetchResult<T> = Result<T, FetchError>;

/// How a response status is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    /// Non-transient client error, never retried
    ClientError,
    RateLimited,
    /// 5xx and anything else unexpected
    Retryable,
}

impl StatusClass {
    pub fn of(status: StatusCode) -> Self {
        if status.is_success() {
            StatusClass::Success
        } else if status == StatusCode::TOO_MANY_REQUESTS {
            StatusClass::RateLimited
        } else if status.is_client_error() {
            StatusClass::ClientError
        } else {
            StatusClass::Retryable
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchPolicy {
    pub max_retries: u32,
    pub timeout: Duration,
    pub base_delay: Duration,
    pub server_error_cap: Duration,
    pub rate_limit_cap: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout: Duration::from_secs(30),
            base_delay: Duration::from_secs(1),
            server_error_cap: Duration::from_secs(5),
            rate_limit_cap: Duration::from_secs(10),
        }
    }
}

impl FetchPolicy {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Delay before the attempt following `attempt` (zero-based).
    pub fn backoff(&self, attempt: u32, class: StatusClass, retry_after: Option<Duration>) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let exponential = self.base_delay.saturating_mul(factor);
        match class {
            StatusClass::RateLimited => {
                retry_after.unwrap_or_else(|| exponential.min(self.rate_limit_cap))
            }
            _ => exponential.min(self.server_error_cap),
        }
    }
}

/// `Retry-After` in whole seconds. HTTP-date values are not honoured.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[derive(Debug, Clone)]
pub struct RetryingFetcher {
    client: reqwest::Client,
    policy: FetchPolicy,
}

impl RetryingFetcher {
    /// The client-level timeout also bounds reading the response body, which
    /// continues after [`fetch`](Self::fetch) has returned.
    pub fn new(policy: FetchPolicy) -> FetchResult<Self> {
        let client = reqwest::Client::builder().timeout(policy.timeout).build()?;
        Ok(Self::with_client(client, policy))
    }

    pub fn with_client(client: reqwest::Client, policy: FetchPolicy) -> Self {
        Self { client, policy }
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn policy(&self) -> &FetchPolicy {
        &self.policy
    }

    pub async fn fetch(&self, request: RequestBuilder) -> FetchResult<Response> {
        let max_retries = self.policy.max_retries;

        for attempt in 0..max_retries {
            let last_attempt = attempt + 1 == max_retries;
            let builder = request.try_clone().ok_or(FetchError::NotCloneable)?;

            let response = match tokio::time::timeout(self.policy.timeout, builder.send()).await {
                Ok(Ok(response)) => response,
                Ok(Err(e)) if !e.is_timeout() => {
                    if last_attempt {
                        return Err(FetchError::Transport(e));
                    }
                    let delay = self.policy.backoff(attempt, StatusClass::Retryable, None);
                    warn!(attempt, ?delay, "Request failed, retrying: {}", e);
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Ok(Err(_)) | Err(_) => {
                    if last_attempt {
                        return Err(FetchError::Timeout {
                            after: self.policy.timeout,
                        });
                    }
                    let delay = self.policy.backoff(attempt, StatusClass::Retryable, None);
                    warn!(attempt, ?delay, "Request timed out, retrying");
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let status = response.status();
            let class = StatusClass::of(status);
            match class {
                StatusClass::Success => {
                    debug!(attempt, %status, url = %response.url(), "Request succeeded");
                    return Ok(response);
                }
                StatusClass::ClientError => {
                    let body = response.text().await.unwrap_or_default();
                    return Err(FetchError::Client {
                        status: status.as_u16(),
                        body,
                    });
                }
                StatusClass::RateLimited | StatusClass::Retryable => {
                    if last_attempt {
                        let body = response.text().await.unwrap_or_default();
                        return Err(FetchError::Exhausted {
                            status: status.as_u16(),
                            body,
                        });
                    }

                    let retry_after = match class {
                        StatusClass::RateLimited => parse_retry_after(response.headers()),
                        _ => None,
                    };
                    let delay = self.policy.backoff(attempt, class, retry_after);

                    // drain the failed body so the connection can be reused
                    let _ = response.bytes().await;

                    warn!(attempt, %status, ?delay, "Upstream returned retryable status");
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Err(FetchError::MaxRetriesExceeded)
    }
}
