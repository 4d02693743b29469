//! Retrying HTTP fetch primitive.
//!
//! Every upstream call goes through [`fetch`]: one classification of what went
//! wrong ([`FetchError`]), one retry loop ([`fetch_with_retry`]) parameterized
//! by the closure that executes a single attempt, one backoff schedule
//! ([`RetryPolicy::backoff_delay`]). Call sites never hand-roll retries.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, warn};

/// Statuses worth another attempt: rate limiting and transient server faults.
pub const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Ceiling on a single backoff sleep, however large the schedule grows.
const BACKOFF_CAP: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum FetchError {
    /// Non-2xx response from the upstream.
    #[error("http status {status}")]
    Http { status: u16 },
    /// Could not reach the upstream at all.
    #[error("connection failed: {detail}")]
    Connection { detail: String },
    /// The attempt exceeded the per-request timeout.
    #[error("request timed out: {detail}")]
    Timeout { detail: String },
    /// Any other transport fault (bad URL, body decode, TLS, ...). Terminal.
    #[error("request failed: {detail}")]
    Request { detail: String },
}

impl FetchError {
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Http { .. } => "http",
            FetchError::Connection { .. } => "connection",
            FetchError::Timeout { .. } => "timeout",
            FetchError::Request { .. } => "request",
        }
    }

    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Http { status } => RETRYABLE_STATUSES.contains(status),
            FetchError::Connection { .. } | FetchError::Timeout { .. } => true,
            FetchError::Request { .. } => false,
        }
    }
}

/// A completed 2xx fetch.
#[derive(Clone, Debug)]
pub struct FetchSuccess {
    pub status: u16,
    pub body: String,
}

pub type FetchOutcome = Result<FetchSuccess, FetchError>;

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts = `max_retries + 1`.
    pub max_retries: u32,
    /// Base of the exponential schedule, in seconds.
    pub backoff_factor: f64,
    /// Per-attempt request timeout.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_factor: 0.3,
            timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Sleep scheduled after the failed zero-indexed `attempt`:
    /// `backoff_factor * 2^attempt` seconds, capped at [`BACKOFF_CAP`].
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let secs = self.backoff_factor * 2f64.powi(attempt.min(30) as i32);
        if !(secs > 0.0) {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(secs).min(BACKOFF_CAP)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// Everything needed to build one attempt of a request. Owned data so the
/// same spec can back every retry of a call.
#[derive(Clone, Debug)]
pub struct RequestSpec {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub json_body: Option<serde_json::Value>,
}

impl RequestSpec {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            headers: Vec::new(),
            query: Vec::new(),
            json_body: None,
        }
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self {
            method: Method::Post,
            ..Self::get(url)
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.json_body = Some(body);
        self
    }
}

fn classify_transport(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout {
            detail: e.to_string(),
        }
    } else if e.is_connect() {
        FetchError::Connection {
            detail: e.to_string(),
        }
    } else {
        FetchError::Request {
            detail: e.to_string(),
        }
    }
}

/// Execute one attempt of `spec` and classify the result. No retries here.
pub async fn send_request(
    client: &reqwest::Client,
    spec: &RequestSpec,
    timeout: Duration,
) -> FetchOutcome {
    let mut req = match spec.method {
        Method::Get => client.get(&spec.url),
        Method::Post => client.post(&spec.url),
    };
    req = req.timeout(timeout);
    for (name, value) in &spec.headers {
        req = req.header(name.as_str(), value.as_str());
    }
    if !spec.query.is_empty() {
        req = req.query(&spec.query);
    }
    if let Some(body) = &spec.json_body {
        req = req.json(body);
    }

    let resp = req.send().await.map_err(classify_transport)?;
    let status = resp.status().as_u16();
    if !resp.status().is_success() {
        return Err(FetchError::Http { status });
    }
    let body = resp.text().await.map_err(classify_transport)?;
    Ok(FetchSuccess { status, body })
}

/// Drive `attempt_fn` until it succeeds, fails terminally, or exhausts the
/// policy. Retryable failures sleep the backoff schedule between attempts.
pub async fn fetch_with_retry<T, F, Fut>(policy: &RetryPolicy, mut attempt_fn: F) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match attempt_fn().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.backoff_delay(attempt);
                warn!(
                    error = %e,
                    kind = e.kind(),
                    attempt = attempt + 1,
                    max_attempts = policy.total_attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "fetch attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_retryable() {
                    error!(
                        error = %e,
                        kind = e.kind(),
                        attempts = policy.total_attempts(),
                        "fetch failed after final retry"
                    );
                } else {
                    error!(error = %e, kind = e.kind(), "fetch failed, not retryable");
                }
                return Err(e);
            }
        }
    }
}

/// Fetch `spec` under `policy`: the standard entry point for upstream calls.
pub async fn fetch(
    client: &reqwest::Client,
    spec: &RequestSpec,
    policy: &RetryPolicy,
) -> FetchOutcome {
    fetch_with_retry(policy, || send_request(client, spec, policy.timeout)).await
}
