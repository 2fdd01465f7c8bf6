//! Upstream source adapter seam.
//!
//! Every upstream provider is reached through the [`SourceClient`] trait so
//! the sync pipeline never depends on a concrete scraper. Errors are
//! classified at this boundary (network / parse / rate-limit) and only the
//! classification crosses into the job layer.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One chapter as reported by an upstream source, before normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawChapter {
    /// Chapter number as the source prints it ("12", "12.5", "Prologue", ...)
    pub number: String,
    pub title: Option<String>,
    pub volume: Option<i32>,
    pub published_at: Option<DateTime<Utc>>,
    /// The source's own identifier for the chapter page.
    pub source_chapter_id: Option<String>,
    pub url: String,
}

/// Classified upstream failure.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("network error: {message}")]
    Network { message: String },

    #[error("parse error: {message}")]
    Parse { message: String },

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
}

impl SourceError {
    /// Whether the surrounding job should retry this failure.
    ///
    /// Parse failures retry too: upstream HTML/JSON churn is usually
    /// transient (a deploy mid-scrape) and the attempt cap bounds the damage.
    pub fn is_retryable(&self) -> bool {
        match self {
            SourceError::Network { .. } => true,
            SourceError::Parse { .. } => true,
            SourceError::RateLimited { .. } => true,
        }
    }
}

/// Capability to fetch the current chapter list for one upstream entity.
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Fetch the full chapter list the source currently serves for
    /// `source_id`. Never assumed reachable; callers go through the job
    /// retry/backoff path and the per-source circuit breaker.
    async fn fetch_chapters(
        &self,
        source_name: &str,
        source_id: &str,
        source_url: &str,
    ) -> Result<Vec<RawChapter>, SourceError>;
}

/// Generic JSON adapter: sources that expose their chapter list as a JSON
/// array of [`RawChapter`] records. Provider-specific scrapers plug in behind
/// the same trait and live outside this crate.
pub struct HttpSourceClient {
    client: reqwest::Client,
}

impl HttpSourceClient {
    pub fn new(timeout: Duration, user_agent: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent.to_string())
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

#[async_trait]
impl SourceClient for HttpSourceClient {
    async fn fetch_chapters(
        &self,
        _source_name: &str,
        _source_id: &str,
        source_url: &str,
    ) -> Result<Vec<RawChapter>, SourceError> {
        let response = self
            .client
            .get(source_url)
            .send()
            .await
            .map_err(|e| SourceError::Network {
                message: e.to_string(),
            })?;

        if response.status().as_u16() == 429 {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(SourceError::RateLimited { retry_after });
        }

        let response = response.error_for_status().map_err(|e| SourceError::Network {
            message: e.to_string(),
        })?;

        response
            .json::<Vec<RawChapter>>()
            .await
            .map_err(|e| SourceError::Parse {
                message: e.to_string(),
            })
    }
}

/// Fixture client for tests: serves scripted chapter lists (or scripted
/// failures) keyed by `(source_name, source_id)`.
#[derive(Default)]
pub struct StaticSourceClient {
    responses: Mutex<HashMap<(String, String), Result<Vec<RawChapter>, SourceError>>>,
}

impl StaticSourceClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_chapters(&self, source_name: &str, source_id: &str, chapters: Vec<RawChapter>) {
        self.responses.lock().unwrap().insert(
            (source_name.to_string(), source_id.to_string()),
            Ok(chapters),
        );
    }

    pub fn set_error(&self, source_name: &str, source_id: &str, error: SourceError) {
        self.responses.lock().unwrap().insert(
            (source_name.to_string(), source_id.to_string()),
            Err(error),
        );
    }
}

#[async_trait]
impl SourceClient for StaticSourceClient {
    async fn fetch_chapters(
        &self,
        source_name: &str,
        source_id: &str,
        _source_url: &str,
    ) -> Result<Vec<RawChapter>, SourceError> {
        match self
            .responses
            .lock()
            .unwrap()
            .get(&(source_name.to_string(), source_id.to_string()))
        {
            Some(result) => result.clone(),
            None => Err(SourceError::Network {
                message: format!("no fixture for {}/{}", source_name, source_id),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_source_errors_are_retryable() {
        assert!(SourceError::Network {
            message: "timeout".into()
        }
        .is_retryable());
        assert!(SourceError::Parse {
            message: "bad json".into()
        }
        .is_retryable());
        assert!(SourceError::RateLimited { retry_after: None }.is_retryable());
    }

    #[tokio::test]
    async fn static_client_serves_fixtures() {
        let client = StaticSourceClient::new();
        client.set_chapters(
            "mangahost",
            "abc",
            vec![RawChapter {
                number: "1".into(),
                title: None,
                volume: None,
                published_at: None,
                source_chapter_id: None,
                url: "https://mangahost.example/abc/1".into(),
            }],
        );

        let chapters = client
            .fetch_chapters("mangahost", "abc", "https://mangahost.example/abc")
            .await
            .unwrap();
        assert_eq!(chapters.len(), 1);

        let missing = client
            .fetch_chapters("mangahost", "missing", "https://mangahost.example/missing")
            .await;
        assert!(missing.is_err());
    }
}
