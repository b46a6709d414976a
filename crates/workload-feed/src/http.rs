//! Retrying JSON fetcher shared by every HTTP-backed feed.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info_span, warn, Instrument};

/// Longest server-requested pause honoured before a retry.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

/// How the fetcher reacts to a non-success response from the rental system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusAction {
    /// Rate limited; `Some` carries the server's `Retry-After`.
    Throttled(Option<Duration>),
    ServerFault,
    /// Wrong subdomain or token. No later request in the pass can succeed.
    Unauthorized,
    Refused,
}

impl StatusAction {
    pub fn of(status: StatusCode, retry_after: Option<Duration>) -> Self {
        match status {
            StatusCode::TOO_MANY_REQUESTS => StatusAction::Throttled(retry_after),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StatusAction::Unauthorized,
            s if s.is_server_error() => StatusAction::ServerFault,
            _ => StatusAction::Refused,
        }
    }

    fn retries(self) -> bool {
        matches!(self, StatusAction::Throttled(_) | StatusAction::ServerFault)
    }
}

/// Delta-seconds form only; HTTP-date values fall back to the backoff schedule.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let seconds = headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()?;
    Some(Duration::from_secs(seconds))
}

/// Connection-level failures worth another attempt. Body and decode errors are not.
fn is_network_blip(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Pause before retry number `attempt` (0-based). A server hint wins over the doubling
    /// schedule, within [`MAX_RETRY_AFTER`].
    pub fn pause(&self, attempt: usize, server_hint: Option<Duration>) -> Duration {
        if let Some(hint) = server_hint {
            return hint.min(MAX_RETRY_AFTER);
        }
        let doubling = u32::try_from(attempt)
            .ok()
            .and_then(|n| 2u32.checked_pow(n))
            .unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(doubling)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Sent on every request, e.g. the feed's subdomain and auth token headers.
    pub default_headers: Vec<(String, String)>,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            default_headers: Vec::new(),
            global_concurrency: 8,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("feed credentials rejected with {status} for {url}")]
    Unauthorized { status: u16, url: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response from {url} is not JSON: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    /// Network trouble, throttling or a server fault that outlived the retry budget.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Request(err) => is_network_blip(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(|s| StatusAction::of(s, None).retries())
                .unwrap_or(false),
            FetchError::Unauthorized { .. } | FetchError::Decode { .. } => false,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, FetchError::Unauthorized { .. })
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.default_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid header name {name}"))?;
            let mut value = HeaderValue::from_str(value)
                .with_context(|| format!("invalid value for header {name}"))?;
            value.set_sensitive(true);
            headers.insert(name, value);
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    /// GET `url` with `query` and decode the body as JSON, retrying transient failures.
    pub async fn get_json(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<JsonValue, FetchError> {
        let span = info_span!("http_fetch", url);
        self.get_json_inner(url, query).instrument(span).await
    }

    async fn get_json_inner(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<JsonValue, FetchError> {
        // The semaphore is owned by `self` and never closed.
        let _permit = self.global_limit.acquire().await.ok();

        let mut attempt = 0;
        loop {
            let outcome = self.client.get(url).query(query).send().await;
            let (retry, hint) = match outcome {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?;
                        return serde_json::from_slice(&body).map_err(|source| {
                            FetchError::Decode {
                                url: final_url,
                                source,
                            }
                        });
                    }

                    let action = StatusAction::of(status, retry_after(resp.headers()));
                    match action {
                        StatusAction::Unauthorized => {
                            return Err(FetchError::Unauthorized {
                                status: status.as_u16(),
                                url: final_url,
                            })
                        }
                        StatusAction::Refused => {
                            return Err(FetchError::HttpStatus {
                                status: status.as_u16(),
                                url: final_url,
                            })
                        }
                        StatusAction::Throttled(hint) => (
                            FetchError::HttpStatus {
                                status: status.as_u16(),
                                url: final_url,
                            },
                            hint,
                        ),
                        StatusAction::ServerFault => (
                            FetchError::HttpStatus {
                                status: status.as_u16(),
                                url: final_url,
                            },
                            None,
                        ),
                    }
                }
                Err(err) if is_network_blip(&err) => (FetchError::Request(err), None),
                Err(err) => return Err(FetchError::Request(err)),
            };

            if attempt >= self.backoff.max_retries {
                return Err(retry);
            }
            let delay = self.backoff.pause(attempt, hint);
            warn!(attempt, ?delay, error = %retry, "retrying feed request");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
