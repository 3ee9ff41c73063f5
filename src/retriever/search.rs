//! Web search providers.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::RetrievalError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub url: String,
    pub title: String,
    /// Short excerpt from the result page; used when the page can't be fetched.
    pub snippet: String,
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Up to `limit` hits, best first.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, RetrievalError>;
}

/// SearxNG instance queried through its JSON API.
#[derive(Debug, Clone)]
pub struct SearxSearch {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct SearxResponse {
    #[serde(default)]
    results: Vec<SearxResult>,
}

#[derive(Deserialize)]
struct SearxResult {
    url: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

impl SearxSearch {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RetrievalError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("crossprompt/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl SearchProvider for SearxSearch {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, RetrievalError> {
        let response = self
            .client
            .get(format!("{}/search", self.base_url))
            .query(&[("q", query), ("format", "json")])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RetrievalError::Search(format!(
                "search endpoint returned HTTP {}",
                status.as_u16()
            )));
        }

        let parsed: SearxResponse = response
            .json()
            .await
            .map_err(|e| RetrievalError::Search(format!("invalid search response: {e}")))?;

        let mut seen = HashSet::new();
        let hits = parsed
            .results
            .into_iter()
            .filter_map(|r| {
                let url = r.url.filter(|u| !u.trim().is_empty())?;
                Some(SearchHit {
                    url,
                    title: r.title.unwrap_or_default(),
                    snippet: r.content.unwrap_or_default(),
                })
            })
            .filter(|hit| seen.insert(hit.url.clone()))
            .take(limit)
            .collect();
        Ok(hits)
    }
}

/// Provider used when no search endpoint is configured. Every call fails,
/// so requests degrade to an empty web context.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSearch;

#[async_trait]
impl SearchProvider for NoSearch {
    async fn search(&self, _query: &str, _limit: usize) -> Result<Vec<SearchHit>, RetrievalError> {
        Err(RetrievalError::Unconfigured("no search endpoint configured"))
    }
}
