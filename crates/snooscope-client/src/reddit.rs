use crate::parse::{parse_listing, parse_user, ParsedListing};
use crate::retry::backoff_delay;
use reqwest::StatusCode;
use serde_json::Value;
use snooscope_admission::{AdmissionToken, Outcome};
use snooscope_circuit::CircuitBreaker;
use snooscope_core::{ScrapeError, Sort, TimeFilter, User};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Page size ceiling imposed by the listing endpoint.
pub const MAX_PAGE_SIZE: u32 = 100;

/// Configuration for [`RedditClient`].
#[derive(Debug, Clone)]
pub struct RedditClientConfig {
    pub(crate) base_url: String,
    pub(crate) user_agent: String,
    pub(crate) timeout: Duration,
    pub(crate) max_retries: u32,
    pub(crate) retry_base: Duration,
    pub(crate) client_id: Option<String>,
    pub(crate) client_secret: Option<String>,
}

impl RedditClientConfig {
    pub fn builder() -> RedditClientConfigBuilder {
        RedditClientConfigBuilder::new()
    }
}

/// Builder for [`RedditClientConfig`].
#[derive(Debug, Clone)]
pub struct RedditClientConfigBuilder {
    base_url: String,
    user_agent: String,
    timeout: Duration,
    max_retries: u32,
    retry_base: Duration,
    client_id: Option<String>,
    client_secret: Option<String>,
}

impl Default for RedditClientConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RedditClientConfigBuilder {
    /// Creates a new builder with defaults.
    ///
    /// Defaults:
    /// - base_url: `https://www.reddit.com`
    /// - timeout: 30 seconds per request
    /// - max_retries: 3 after the initial attempt
    /// - retry_base: 1 second
    pub fn new() -> Self {
        Self {
            base_url: "https://www.reddit.com".to_string(),
            user_agent: concat!("snooscope/", env!("CARGO_PKG_VERSION")).to_string(),
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_base: Duration::from_secs(1),
            client_id: None,
            client_secret: None,
        }
    }

    /// Overrides the API origin (tests point this at a mock server).
    pub fn base_url<S: Into<String>>(mut self, base_url: S) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn user_agent<S: Into<String>>(mut self, user_agent: S) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Per-request deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Retries after the initial attempt for transient failures.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// First backoff interval; subsequent ones double.
    pub fn retry_base(mut self, retry_base: Duration) -> Self {
        self.retry_base = retry_base;
        self
    }

    /// API credentials. Held for the authenticated endpoints and kept out
    /// of every log line.
    pub fn credentials<S: Into<String>>(mut self, client_id: S, client_secret: S) -> Self {
        self.client_id = Some(client_id.into());
        self.client_secret = Some(client_secret.into());
        self
    }

    pub fn build(self) -> RedditClientConfig {
        RedditClientConfig {
            base_url: self.base_url,
            user_agent: self.user_agent,
            timeout: self.timeout,
            max_retries: self.max_retries,
            retry_base: self.retry_base,
            client_id: self.client_id,
            client_secret: self.client_secret,
        }
    }
}

/// Client for the forum's documented JSON API.
///
/// Every request runs circuit check, then admission, then one HTTP
/// attempt. The circuit check comes first so an open circuit costs no
/// admission slot.
#[derive(Clone)]
pub struct RedditClient {
    http: reqwest::Client,
    config: RedditClientConfig,
    admission: AdmissionToken,
    circuit: CircuitBreaker,
    cancel: Option<CancellationToken>,
}

impl RedditClient {
    pub fn new(
        config: RedditClientConfig,
        admission: AdmissionToken,
        circuit: CircuitBreaker,
    ) -> Result<Self, ScrapeError> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout)
            .build()
            .map_err(|e| ScrapeError::fatal(format!("http client init: {e}")))?;
        Ok(Self {
            http,
            config,
            admission,
            circuit,
            cancel: None,
        })
    }

    /// A clone of this client whose admission and backoff waits abort
    /// when `cancel` fires. In-flight HTTP attempts are left to finish;
    /// only pending waits are cut short.
    pub fn scoped(&self, cancel: CancellationToken) -> Self {
        let mut scoped = self.clone();
        scoped.cancel = Some(cancel);
        scoped
    }

    /// The circuit protecting this endpoint, for the engine's
    /// error-budget checks.
    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    /// The admission token pacing this endpoint.
    pub fn admission(&self) -> &AdmissionToken {
        &self.admission
    }

    /// Fetches one listing page, at most [`MAX_PAGE_SIZE`] items.
    pub async fn list_posts(
        &self,
        subreddit: &str,
        sort: Sort,
        time_filter: TimeFilter,
        limit: u32,
        after: Option<&str>,
    ) -> Result<ParsedListing, ScrapeError> {
        let mut url = format!(
            "{}/r/{}/{}.json?raw_json=1&limit={}",
            self.config.base_url,
            subreddit,
            sort.as_str(),
            limit.min(MAX_PAGE_SIZE)
        );
        if sort == Sort::Top {
            url.push_str(&format!("&t={}", time_filter.as_str()));
        }
        if let Some(after) = after {
            url.push_str(&format!("&after={after}"));
        }
        let value = self.fetch_json(&url, &format!("r/{subreddit}")).await?;
        parse_listing(&value)
    }

    /// Fetches one user profile. Deleted or suspended accounts surface as
    /// `NotFound`.
    pub async fn get_user(&self, username: &str) -> Result<User, ScrapeError> {
        let url = format!(
            "{}/user/{}/about.json?raw_json=1",
            self.config.base_url, username
        );
        let value = self.fetch_json(&url, &format!("u/{username}")).await?;
        parse_user(&value)
    }

    /// Circuit → admission → single attempt, with jittered exponential
    /// backoff on transients. `CircuitOpen` surfaces immediately; the
    /// worker loop owns that wait.
    async fn fetch_json(&self, url: &str, what: &str) -> Result<Value, ScrapeError> {
        let mut attempt = 0u32;
        loop {
            self.circuit.try_acquire()?;
            self.wait_cancellable(self.admission.acquire()).await??;

            match self.attempt(url, what).await {
                Ok(value) => {
                    self.admission.record_outcome(Outcome::Ok);
                    self.circuit.record_success();
                    return Ok(value);
                }
                Err(err) => {
                    match &err {
                        ScrapeError::RateLimited { .. } => {
                            self.admission.record_outcome(Outcome::RateLimited);
                            self.circuit.record_failure();
                        }
                        ScrapeError::Transient { .. } => {
                            self.admission.record_outcome(Outcome::Error);
                            self.circuit.record_failure();
                        }
                        // the endpoint answered; it just said no
                        _ => {
                            self.admission.record_outcome(Outcome::Ok);
                            self.circuit.record_success();
                        }
                    }
                    if err.is_transient() && attempt < self.config.max_retries {
                        let delay = backoff_delay(self.config.retry_base, attempt);
                        attempt += 1;
                        tracing::debug!(
                            %what,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            %err,
                            "transient fetch failure, backing off"
                        );
                        self.wait_cancellable(sleep(delay)).await?;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Races a pending wait against the session's cancellation token.
    /// The slot or sleep being abandoned costs nothing.
    async fn wait_cancellable<F: std::future::Future>(
        &self,
        fut: F,
    ) -> Result<F::Output, ScrapeError> {
        match &self.cancel {
            None => Ok(fut.await),
            Some(cancel) => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(ScrapeError::Cancelled),
                    out = fut => Ok(out),
                }
            }
        }
    }

    async fn attempt(&self, url: &str, what: &str) -> Result<Value, ScrapeError> {
        let mut request = self.http.get(url);
        if let (Some(id), Some(secret)) = (&self.config.client_id, &self.config.client_secret) {
            request = request.basic_auth(id, Some(secret));
        }
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ScrapeError::transient(format!("{what}: request deadline exceeded"))
            } else {
                ScrapeError::transient(format!("{what}: {e}"))
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<Value>()
                .await
                .map_err(|e| ScrapeError::transient(format!("{what}: invalid body: {e}")));
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(ScrapeError::RateLimited { retry_after });
        }
        if status.is_server_error() {
            return Err(ScrapeError::transient(format!("{what}: http {status}")));
        }
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(ScrapeError::NotFound { what: what.into() });
        }
        Err(ScrapeError::permanent(format!("{what}: http {status}")))
    }
}
