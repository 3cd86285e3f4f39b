//! Resilient HTTP session: per-request retry/backoff policy, transport error
//! classification, and a process-wide named rate limiter.
//!
//! Grounded on `web_monitoring.internetarchive.WaybackSession` for the
//! retry/backoff/classification logic, and on the corpus's own rate-limiting
//! idiom (`tokio::sync::Semaphore`-backed gates, as used throughout the
//! `tokio`-based example repos) for the shared limiter.

use reqwest::{Client, Method, Response, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{interval, sleep, MissedTickBehavior};

pub const DEFAULT_USER_AGENT_PREFIX: &str = "edgi.web_monitoring.WaybackClient";

/// Status codes Wayback intermittently returns for transient failures. A
/// response carrying `Memento-Datetime` is never retried against this set:
/// the error was the captured page, not a transport problem.
const RETRYABLE_STATUSES: &[u16] = &[413, 421, 429, 500, 502, 503, 504, 599];

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("retried {attempts} times over {elapsed:?} (cause: {cause})")]
    RetryExhausted {
        attempts: u32,
        elapsed: Duration,
        #[source]
        cause: Box<SessionError>,
    },
}

/// A timeout, either a single value applied to the whole request or a
/// (connect, read) pair -- mirrors the Python session's `int | float | tuple`
/// timeout argument.
#[derive(Clone, Copy, Debug)]
pub enum SessionTimeout {
    Total(Duration),
    ConnectRead(Duration, Duration),
}

impl SessionTimeout {
    fn request_timeout(&self) -> Duration {
        match self {
            SessionTimeout::Total(d) => *d,
            // reqwest has no separate connect/read timeout knob per-request;
            // use the read timeout as the effective overall budget, since
            // that's the dominant cost for a memento fetch.
            SessionTimeout::ConnectRead(_, read) => *read.max(&Duration::from_millis(1)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub retries: u32,
    pub backoff: f64,
    pub timeout: Option<SessionTimeout>,
    pub user_agent: String,
}

impl SessionConfig {
    pub fn new(retries: u32, backoff: f64, timeout: Option<SessionTimeout>) -> Self {
        Self {
            retries,
            backoff,
            timeout,
            user_agent: format!("{DEFAULT_USER_AGENT_PREFIX}/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Normal-mode pipeline session: `retries=4, backoff=2, timeout=(30.5, 2)`.
    pub fn normal() -> Self {
        Self::new(
            4,
            2.0,
            Some(SessionTimeout::ConnectRead(
                Duration::from_secs_f64(30.5),
                Duration::from_secs(2),
            )),
        )
    }

    /// Escalated-mode retry-pass session: `retries=8, backoff=4, timeout=60.5`.
    pub fn escalated() -> Self {
        Self::new(8, 4.0, Some(SessionTimeout::Total(Duration::from_secs_f64(60.5))))
    }

    /// CDX-listing session: `retries=10, backoff=4`, no timeout.
    pub fn cdx_listing() -> Self {
        Self::new(10, 4.0, None)
    }
}

/// Wraps a `reqwest::Client` with the send-with-retry policy described in the
/// spec's resilient session component.
pub struct ResilientSession {
    client: Client,
    config: SessionConfig,
}

impl ResilientSession {
    pub fn new(config: SessionConfig) -> Result<Self, SessionError> {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Send a GET request to `url` with the configured retry/backoff policy,
    /// not following redirects automatically (the caller, e.g. the memento
    /// fetcher, decides whether and how to follow onward hops).
    pub async fn get_no_redirect(&self, url: &str) -> Result<Response, SessionError> {
        self.send_with_retry(Method::GET, url).await
    }

    async fn send_with_retry(&self, method: Method, url: &str) -> Result<Response, SessionError> {
        let maximum = self.config.retries;
        let mut attempt: u32 = 0;
        let started = std::time::Instant::now();

        loop {
            if attempt > 0 {
                let seconds = self.config.backoff * 2f64.powi(attempt as i32 - 1);
                log::debug!("retrying {method} {url}, attempt {attempt}, sleeping {seconds}s");
                sleep(Duration::from_secs_f64(seconds)).await;
            }

            let mut req = self
                .client
                .request(method.clone(), url)
                .header(reqwest::header::USER_AGENT, &self.config.user_agent);
            if let Some(timeout) = self.config.timeout {
                req = req.timeout(timeout.request_timeout());
            }

            match req.send().await {
                Ok(response) => {
                    if attempt >= maximum || !should_retry_response(&response) {
                        return Ok(response);
                    }
                }
                Err(error) => {
                    if attempt >= maximum {
                        let cause = SessionError::Http(error);
                        return Err(SessionError::RetryExhausted {
                            attempts: attempt + 1,
                            elapsed: started.elapsed(),
                            cause: Box::new(cause),
                        });
                    }
                    if !should_retry_error(&error) {
                        return Err(SessionError::Http(error));
                    }
                }
            }

            attempt += 1;
        }
    }
}

/// A memento may actually be a capture of an error, so don't retry it.
fn should_retry_response(response: &Response) -> bool {
    if response.headers().contains_key("Memento-Datetime") {
        return false;
    }
    RETRYABLE_STATUSES.contains(&response.status().as_u16())
}

fn should_retry_error(error: &reqwest::Error) -> bool {
    if error.is_timeout() || error.is_connect() {
        return true;
    }
    let text = error.to_string();
    text.contains("NewConnectionError") || text.contains("Max retries")
}

pub fn is_not_found(status: StatusCode) -> bool {
    status == StatusCode::NOT_FOUND
}

/// A process-wide registry of named, shared rate limiters, passed explicitly
/// into the components that need pacing rather than kept as a singleton (per
/// the spec's "model as an explicit registry" design note).
pub struct RateLimiterRegistry {
    limiters: Mutex<HashMap<String, Arc<RateLimiter>>>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self {
            limiters: Mutex::new(HashMap::new()),
        }
    }

    /// Get (creating if necessary) the named limiter, capped at
    /// `calls_per_second`.
    pub async fn get(&self, group: &str, calls_per_second: u32) -> Arc<RateLimiter> {
        let mut limiters = self.limiters.lock().await;
        limiters
            .entry(group.to_string())
            .or_insert_with(|| Arc::new(RateLimiter::new(calls_per_second)))
            .clone()
    }
}

impl Default for RateLimiterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Blocks callers so that, across all concurrent users, at most
/// `calls_per_second` permits are granted each second.
pub struct RateLimiter {
    semaphore: Arc<tokio::sync::Semaphore>,
    _refill: tokio::task::JoinHandle<()>,
}

impl RateLimiter {
    fn new(calls_per_second: u32) -> Self {
        let permits = calls_per_second.max(1) as usize;
        let semaphore = Arc::new(tokio::sync::Semaphore::new(permits));
        let refill_semaphore = semaphore.clone();
        let refill = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(1));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let available = refill_semaphore.available_permits();
                if available < permits {
                    refill_semaphore.add_permits(permits - available);
                }
            }
        });
        Self {
            semaphore,
            _refill: refill,
        }
    }

    /// Acquire one permit, blocking the caller until the rate allows it.
    pub async fn acquire(&self) {
        let permit = self.semaphore.acquire().await.expect("semaphore not closed");
        permit.forget();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_mode_matches_spec_defaults() {
        let config = SessionConfig::normal();
        assert_eq!(config.retries, 4);
        assert_eq!(config.backoff, 2.0);
    }

    #[test]
    fn escalated_mode_matches_spec_defaults() {
        let config = SessionConfig::escalated();
        assert_eq!(config.retries, 8);
        assert_eq!(config.backoff, 4.0);
    }

    #[test]
    fn user_agent_has_expected_prefix() {
        let config = SessionConfig::normal();
        assert!(config.user_agent.starts_with(DEFAULT_USER_AGENT_PREFIX));
    }
}
