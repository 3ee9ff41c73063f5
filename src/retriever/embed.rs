//! Text embedders for the similarity index.

use std::sync::Arc;

use async_trait::async_trait;

use super::RetrievalError;
use crate::gateway::chat_api::EmbeddingProvider;
use crate::gateway::{Attribution, EmbedRequest};

/// Dimensionality used by the offline embedder (same as all-MiniLM-L6-v2).
pub const DEFAULT_HASH_DIMS: usize = 384;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// One vector per input text, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError>;
}

/// Offline bag-of-words embedder using the hashing trick.
///
/// Texts that differ only in case, punctuation or word order map to the same
/// vector, which is what query reuse needs; it carries no semantics beyond
/// shared vocabulary.
#[derive(Debug, Clone, Copy)]
pub struct HashingEmbedder {
    dims: usize,
}

impl HashingEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0f32; self.dims];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let token = token.to_lowercase();
            let digest = blake3::hash(token.as_bytes());
            let bytes = digest.as_bytes();
            let mut slot = [0u8; 8];
            slot.copy_from_slice(&bytes[..8]);
            let idx = (u64::from_le_bytes(slot) % self.dims as u64) as usize;
            let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[idx] += sign;
        }
        normalize(&mut v);
        v
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_HASH_DIMS)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// Embedder backed by an OpenAI-compatible `/embeddings` endpoint.
pub struct ApiEmbedder {
    provider: Arc<dyn EmbeddingProvider>,
    model: String,
}

impl ApiEmbedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }
}

#[async_trait]
impl Embedder for ApiEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError> {
        let req = EmbedRequest::new(
            &self.model,
            texts.to_vec(),
            Attribution::new("retriever::embed"),
        );
        let resp = self
            .provider
            .embed(&req)
            .await
            .map_err(|e| RetrievalError::Embedding(e.to_string()))?;
        Ok(resp.embeddings)
    }
}

fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}

/// Cosine similarity; 0.0 for empty, zero or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0f32;
    let mut na = 0f32;
    let mut nb = 0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}
