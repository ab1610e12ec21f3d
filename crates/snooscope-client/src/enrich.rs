//! Link-content enrichment.
//!
//! The open web is a different failure domain from the forum API, so the
//! enricher carries its own admission token and circuit breaker. It is
//! strictly best-effort: any failure leaves the post unenriched and is
//! never fatal to the session.

use scraper::{Html, Selector};
use snooscope_admission::{AdmissionToken, Outcome};
use snooscope_circuit::CircuitBreaker;
use snooscope_core::{LinkPreview, ScrapeError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Tuning for a [`ContentEnricher`]. One instance serves one session.
#[derive(Debug, Clone)]
pub struct EnricherConfig {
    /// Concurrent fetches in flight.
    pub max_in_flight: usize,
    /// Per-page deadline.
    pub timeout: Duration,
    /// Attempts allowed per URL within this session (initial + retry).
    pub max_attempts_per_url: u8,
    pub user_agent: String,
}

impl Default for EnricherConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 5,
            timeout: Duration::from_secs(10),
            max_attempts_per_url: 2,
            user_agent: concat!("snooscope/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Fetches external link targets and extracts head metadata.
#[derive(Clone)]
pub struct ContentEnricher {
    http: reqwest::Client,
    admission: AdmissionToken,
    circuit: CircuitBreaker,
    permits: Arc<Semaphore>,
    attempts: Arc<Mutex<HashMap<String, u8>>>,
    config: EnricherConfig,
}

impl ContentEnricher {
    pub fn new(
        config: EnricherConfig,
        admission: AdmissionToken,
        circuit: CircuitBreaker,
    ) -> Result<Self, ScrapeError> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout)
            .build()
            .map_err(|e| ScrapeError::fatal(format!("enricher http client init: {e}")))?;
        Ok(Self {
            http,
            admission,
            circuit,
            permits: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            attempts: Arc::new(Mutex::new(HashMap::new())),
            config,
        })
    }

    /// Fetches `url` and extracts a preview. Returns `None` on any
    /// failure or when the page yields nothing useful.
    pub async fn enrich(&self, url: &str) -> Option<LinkPreview> {
        loop {
            if !self.take_attempt(url) {
                return None;
            }
            let _permit = self.permits.acquire().await.ok()?;
            match self.fetch(url).await {
                Ok(preview) if !preview.is_empty() => return Some(preview),
                Ok(_) => return None,
                Err(err) if err.is_transient() && !err.is_circuit_open() => {
                    tracing::debug!(%url, %err, "enrichment attempt failed");
                    // loop once more if the per-URL budget allows
                }
                Err(err) => {
                    tracing::debug!(%url, %err, "enrichment abandoned");
                    return None;
                }
            }
        }
    }

    fn take_attempt(&self, url: &str) -> bool {
        let mut attempts = self.attempts.lock().unwrap();
        let count = attempts.entry(url.to_string()).or_insert(0);
        if *count >= self.config.max_attempts_per_url {
            return false;
        }
        *count += 1;
        true
    }

    async fn fetch(&self, url: &str) -> Result<LinkPreview, ScrapeError> {
        self.circuit.try_acquire()?;
        self.admission.acquire().await?;

        let result = self.attempt(url).await;
        match &result {
            Ok(_) => {
                self.admission.record_outcome(Outcome::Ok);
                self.circuit.record_success();
            }
            Err(ScrapeError::RateLimited { .. }) => {
                self.admission.record_outcome(Outcome::RateLimited);
                self.circuit.record_failure();
            }
            Err(err) if err.is_transient() => {
                self.admission.record_outcome(Outcome::Error);
                self.circuit.record_failure();
            }
            Err(_) => {
                self.admission.record_outcome(Outcome::Ok);
                self.circuit.record_success();
            }
        }
        result
    }

    async fn attempt(&self, url: &str) -> Result<LinkPreview, ScrapeError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| ScrapeError::transient(format!("fetch {url}: {e}")))?;
        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ScrapeError::RateLimited { retry_after: None });
        }
        if status.is_server_error() {
            return Err(ScrapeError::transient(format!("fetch {url}: http {status}")));
        }
        if !status.is_success() {
            return Err(ScrapeError::permanent(format!("fetch {url}: http {status}")));
        }
        let body = response
            .text()
            .await
            .map_err(|e| ScrapeError::transient(format!("read {url}: {e}")))?;
        Ok(extract_preview(&body))
    }
}

/// Pulls title/description/author/snippet/published-at out of a page.
pub(crate) fn extract_preview(html: &str) -> LinkPreview {
    let doc = Html::parse_document(html);

    let meta = |selector: &str| -> Option<String> {
        let sel = Selector::parse(selector).ok()?;
        doc.select(&sel)
            .find_map(|el| el.value().attr("content"))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };

    let title = meta(r#"meta[property="og:title"]"#).or_else(|| {
        let sel = Selector::parse("title").ok()?;
        doc.select(&sel)
            .next()
            .map(|el| el.text().collect::<String>().trim().to_string())
            .filter(|s| !s.is_empty())
    });
    let description =
        meta(r#"meta[property="og:description"]"#).or_else(|| meta(r#"meta[name="description"]"#));
    let author =
        meta(r#"meta[name="author"]"#).or_else(|| meta(r#"meta[property="article:author"]"#));
    let published_at = meta(r#"meta[property="article:published_time"]"#);

    let snippet = Selector::parse("p").ok().and_then(|sel| {
        doc.select(&sel)
            .map(|el| {
                el.text()
                    .collect::<String>()
                    .split_whitespace()
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .find(|text| text.len() >= 40)
            .map(|mut text| {
                if text.len() > 300 {
                    let mut end = 300;
                    while !text.is_char_boundary(end) {
                        end -= 1;
                    }
                    text.truncate(end);
                }
                text
            })
    });

    LinkPreview {
        title,
        description,
        author,
        snippet,
        published_at,
    }
}
