//! Reranker capability.

use async_trait::async_trait;

use crate::error::Result;
use crate::models::RetrievalHit;

/// Re-scores fused candidates against the query text.
///
/// Implementations replace `score` with their own relevance score and
/// return at most `top_k` hits, best first. Node identity must be
/// preserved: every returned hit is one of the `candidates`.
#[async_trait]
pub trait Reranker: Send + Sync {
    fn name(&self) -> &str;

    async fn rerank(
        &self,
        query: &str,
        candidates: Vec<RetrievalHit>,
        top_k: usize,
    ) -> Result<Vec<RetrievalHit>>;
}
