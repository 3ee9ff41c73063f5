//! Web context retrieval.
//!
//! A [`WebRetriever`] answers a query with the bodies of up to `k` web
//! documents joined by `"\n"`, in search order. Every answered query and every
//! fetched document is kept in a [`SimilarityIndex`]; a later query whose
//! embedding is close enough to an earlier one is answered from the index
//! without touching the network, and known URLs are never fetched twice.

pub mod embed;
pub mod fetch;
pub mod index;
pub mod search;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

pub use embed::{cosine_similarity, ApiEmbedder, Embedder, HashingEmbedder};
pub use fetch::{html_to_text, DocumentFetcher, HttpFetcher};
pub use index::{IndexError, IndexStats, IndexedDocument, SimilarityIndex};
pub use search::{NoSearch, SearchHit, SearchProvider, SearxSearch};

/// Supporting text assembled from retrieved documents. May be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WebContext(String);

impl WebContext {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for WebContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Recoverable retrieval failure. Callers substitute an empty context.
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("retrieval unconfigured: {0}")]
    Unconfigured(&'static str),
    #[error("search failed: {0}")]
    Search(String),
    #[error("fetch of {url} failed: {reason}")]
    Fetch { url: String, reason: String },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("embedding failed: {0}")]
    Embedding(String),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("retrieval timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait ContextRetriever: Send + Sync {
    async fn retrieve(&self, query: &str, k: usize) -> Result<WebContext, RetrievalError>;
}

/// Retrieve, turning any failure into an empty context plus the reason.
pub async fn retrieve_or_empty(
    retriever: &dyn ContextRetriever,
    query: &str,
    k: usize,
) -> (WebContext, Option<RetrievalError>) {
    match retriever.retrieve(query, k).await {
        Ok(ctx) => (ctx, None),
        Err(err) => {
            tracing::warn!(error = %err, "retrieval failed, continuing without web context");
            (WebContext::empty(), Some(err))
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetrieverConfig {
    /// Minimum cosine similarity for answering a query from the index.
    pub reuse_threshold: f32,
    /// Whole-call deadline. `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            reuse_threshold: 0.92,
            timeout: None,
        }
    }
}

pub struct WebRetriever {
    search: Arc<dyn SearchProvider>,
    fetcher: Arc<dyn DocumentFetcher>,
    embedder: Arc<dyn Embedder>,
    index: SimilarityIndex,
    config: RetrieverConfig,
}

/// A search hit resolved to text, either from the index or the network.
struct ResolvedHit {
    doc: IndexedDocument,
    fresh: bool,
}

impl WebRetriever {
    pub fn new(
        search: Arc<dyn SearchProvider>,
        fetcher: Arc<dyn DocumentFetcher>,
        embedder: Arc<dyn Embedder>,
        index: SimilarityIndex,
    ) -> Self {
        Self {
            search,
            fetcher,
            embedder,
            index,
            config: RetrieverConfig::default(),
        }
    }

    pub fn with_config(mut self, config: RetrieverConfig) -> Self {
        self.config = config;
        self
    }

    pub fn index(&self) -> &SimilarityIndex {
        &self.index
    }

    async fn retrieve_inner(&self, query: &str, k: usize) -> Result<WebContext, RetrievalError> {
        let query_embedding = self
            .embedder
            .embed(&[query.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RetrievalError::Embedding("no embedding returned for query".into()))?;

        if let Some(cached) = self
            .index
            .nearest_query(query_embedding.clone(), self.config.reuse_threshold)
            .await?
        {
            let docs = self.index.documents(cached.doc_hashes).await?;
            if !docs.is_empty() {
                tracing::info!(
                    similarity = cached.similarity,
                    documents = docs.len(),
                    "web context reused from index"
                );
                return Ok(join_bodies(docs.iter().take(k)));
            }
            tracing::debug!(similarity = cached.similarity, "indexed query has no documents, searching");
        }

        let hits = self.search.search(query, k).await?;
        let resolved: Vec<ResolvedHit> = stream::iter(hits.into_iter().take(k))
            .map(|hit| self.resolve_hit(hit))
            .buffered(k.max(1))
            .filter_map(|r| async move { r })
            .collect()
            .await;

        let fresh: Vec<&IndexedDocument> = resolved
            .iter()
            .filter(|r| r.fresh)
            .map(|r| &r.doc)
            .collect();

        if !fresh.is_empty() {
            let bodies: Vec<String> = fresh.iter().map(|d| d.body.clone()).collect();
            let embeddings = self.embedder.embed(&bodies).await?;
            if embeddings.len() != fresh.len() {
                return Err(RetrievalError::Embedding(format!(
                    "expected {} embeddings, got {}",
                    fresh.len(),
                    embeddings.len()
                )));
            }
            for (doc, embedding) in fresh.iter().zip(embeddings) {
                self.index.insert_document((*doc).clone(), embedding).await?;
            }
        }

        // An empty answer is not recorded, so the next request searches again.
        if !resolved.is_empty() {
            let doc_hashes = resolved.iter().map(|r| r.doc.doc_hash.clone()).collect();
            self.index
                .record_query(query.to_string(), query_embedding, doc_hashes)
                .await?;
        }

        tracing::info!(
            documents = resolved.len(),
            fetched = fresh.len(),
            "web context retrieved"
        );
        Ok(join_bodies(resolved.iter().map(|r| &r.doc)))
    }

    /// Indexed copy of the page if known, else a fresh fetch with the
    /// search snippet as fallback. `None` when there is no text at all.
    async fn resolve_hit(&self, hit: SearchHit) -> Option<ResolvedHit> {
        match self.index.document_for_url(hit.url.clone()).await {
            Ok(Some(doc)) if !doc.body.is_empty() => {
                return Some(ResolvedHit { doc, fresh: false })
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(url = %hit.url, error = %err, "index lookup failed"),
        }

        let body = match self.fetcher.fetch(&hit.url).await {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => hit.snippet.trim().to_string(),
            Err(err) => {
                tracing::warn!(url = %hit.url, error = %err, "fetch failed, using search snippet");
                hit.snippet.trim().to_string()
            }
        };
        if body.is_empty() {
            return None;
        }
        Some(ResolvedHit {
            doc: IndexedDocument::new(hit.url, hit.title, body),
            fresh: true,
        })
    }
}

#[async_trait]
impl ContextRetriever for WebRetriever {
    async fn retrieve(&self, query: &str, k: usize) -> Result<WebContext, RetrievalError> {
        if query.trim().is_empty() || k == 0 {
            return Ok(WebContext::empty());
        }
        match self.config.timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.retrieve_inner(query, k))
                .await
                .map_err(|_| RetrievalError::Timeout(timeout))?,
            None => self.retrieve_inner(query, k).await,
        }
    }
}

fn join_bodies<'a>(docs: impl Iterator<Item = &'a IndexedDocument>) -> WebContext {
    let bodies: Vec<&str> = docs
        .map(|d| d.body.as_str())
        .filter(|b| !b.is_empty())
        .collect();
    WebContext::new(bodies.join("\n"))
}
