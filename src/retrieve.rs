//! Query execution over one knowledge base.
//!
//! | Mode | Retrievers | Score in results |
//! |------|------------|------------------|
//! | `vector_only` | vector store | cosine similarity |
//! | `bm25_only` | document store (text spaces only) | BM25 |
//! | `fusion` | both, concurrently | `λv·v + λb·b` after normalization |
//!
//! Fusion against a space without searchable text (image, audio, video)
//! runs the vector retriever alone. Hits are hydrated from the document
//! store; ids it no longer holds are dropped, so a batch that is being
//! rolled back never surfaces. With a reranker configured, text queries
//! over text spaces rerank the top `rerank.candidate_k` candidates.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use ragweave_core::embedding::{check_vectors, EmbedInput};
use ragweave_core::fusion::fuse;
use ragweave_core::models::{
    HitOrigin, Modality, ModalityPair, QueryInput, RetrievalHit, RetrievalMode, ScoredId,
};
use ragweave_core::rerank::Reranker;
use ragweave_core::{Error, Result};

use crate::config::RetrievalConfig;
use crate::deadline::with_timeout;
use crate::stores::ModalitySpace;

/// A ranked candidate before hydration.
struct Candidate {
    id: String,
    score: f64,
    origin: HitOrigin,
}

pub struct QueryEngine {
    spaces: BTreeMap<Modality, ModalitySpace>,
    settings: RetrievalConfig,
    reranker: Option<Arc<dyn Reranker>>,
    rerank_candidates: usize,
}

impl QueryEngine {
    pub fn new(spaces: impl IntoIterator<Item = ModalitySpace>, settings: RetrievalConfig) -> Self {
        Self {
            spaces: spaces.into_iter().map(|s| (s.modality, s)).collect(),
            settings,
            reranker: None,
            rerank_candidates: 0,
        }
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>, candidate_k: usize) -> Self {
        self.reranker = Some(reranker);
        self.rerank_candidates = candidate_k;
        self
    }

    pub fn settings(&self) -> &RetrievalConfig {
        &self.settings
    }

    /// Query with the configured retrieval mode.
    pub async fn query(
        &self,
        pair: ModalityPair,
        input: &QueryInput,
        top_k: usize,
    ) -> Result<Vec<RetrievalHit>> {
        self.query_with_mode(pair, input, top_k, self.settings.mode)
            .await
    }

    pub async fn query_with_mode(
        &self,
        pair: ModalityPair,
        input: &QueryInput,
        top_k: usize,
        mode: RetrievalMode,
    ) -> Result<Vec<RetrievalHit>> {
        let limit = Duration::from_secs(self.settings.timeout_secs);
        with_timeout("query", limit, self.run(pair, input, top_k, mode)).await
    }

    async fn run(
        &self,
        pair: ModalityPair,
        input: &QueryInput,
        top_k: usize,
        mode: RetrievalMode,
    ) -> Result<Vec<RetrievalHit>> {
        let pair = ModalityPair::new(pair.source, pair.target)?;
        if top_k == 0 {
            return Err(Error::invalid_request("top_k must be > 0"));
        }
        match (pair.source, input) {
            (Modality::Text, QueryInput::Text(t)) if t.trim().is_empty() => {
                return Err(Error::invalid_request("query text is empty"))
            }
            (Modality::Text, QueryInput::Text(_)) => {}
            (m, QueryInput::Media(bytes)) if m != Modality::Text && !bytes.is_empty() => {}
            (m, _) => {
                return Err(Error::invalid_request(format!(
                    "query payload does not match source modality {m}"
                )))
            }
        }
        let space = self.spaces.get(&pair.target).ok_or_else(|| {
            Error::invalid_request(format!(
                "no embedding provider configured for {}",
                pair.target
            ))
        })?;

        let lexical_text = input.as_text().filter(|_| pair.target.has_text());
        let mode = match (mode, lexical_text) {
            (RetrievalMode::Bm25Only, None) => {
                return Err(Error::invalid_request(format!(
                    "bm25_only needs a text query against a text space, got {pair}"
                )))
            }
            (RetrievalMode::Fusion, None) => {
                tracing::debug!(%pair, "no searchable text; fusion runs vector search only");
                RetrievalMode::VectorOnly
            }
            (mode, _) => mode,
        };

        let rerank = self
            .reranker
            .as_ref()
            .zip(lexical_text)
            .filter(|_| self.rerank_candidates > 0);
        let wanted = match rerank {
            Some(_) => self.rerank_candidates.max(top_k),
            None => top_k,
        };

        let candidates = match mode {
            RetrievalMode::VectorOnly => self
                .vector_search(space, pair, input, wanted)
                .await?
                .into_iter()
                .map(|s| Candidate {
                    id: s.id,
                    score: s.score,
                    origin: HitOrigin::Vector,
                })
                .collect(),
            RetrievalMode::Bm25Only => {
                let text = lexical_text.unwrap_or_default();
                let k = wanted.min(self.settings.bm25_top_k);
                self.lexical_search(space, text, k)
                    .await?
                    .into_iter()
                    .map(|s| Candidate {
                        id: s.id,
                        score: s.score,
                        origin: HitOrigin::Bm25,
                    })
                    .collect()
            }
            RetrievalMode::Fusion => {
                let text = lexical_text.unwrap_or_default();
                let (vector, lexical) = futures::future::try_join(
                    self.vector_search(space, pair, input, self.settings.vector_top_k.max(wanted)),
                    self.lexical_search(space, text, self.settings.bm25_top_k),
                )
                .await?;
                fuse(
                    &vector,
                    &lexical,
                    self.settings.weights(),
                    self.settings.normalization,
                )
                .into_iter()
                .map(|f| Candidate {
                    origin: f.origin(),
                    id: f.id,
                    score: f.score,
                })
                .collect()
            }
        };

        let hits = self.hydrate(space, candidates, wanted).await?;
        match rerank {
            Some((reranker, text)) if !hits.is_empty() => {
                tracing::debug!(reranker = reranker.name(), candidates = hits.len(), "reranking");
                reranker.rerank(text, hits, top_k).await
            }
            _ => Ok(hits.into_iter().take(top_k).collect()),
        }
    }

    async fn vector_search(
        &self,
        space: &ModalitySpace,
        pair: ModalityPair,
        input: &QueryInput,
        k: usize,
    ) -> Result<Vec<ScoredId>> {
        let provider = space.provider.as_ref();
        if !provider.accepts(pair.source) {
            return Err(Error::provider_fatal(
                provider.name(),
                format!("cannot embed {} queries into the {} space", pair.source, pair.target),
            ));
        }
        let embed_input = match input {
            QueryInput::Text(t) => EmbedInput::Text(t.clone()),
            QueryInput::Media(bytes) => EmbedInput::Media {
                modality: pair.source,
                bytes: bytes.clone(),
            },
        };
        let vectors = provider.embed(std::slice::from_ref(&embed_input)).await?;
        check_vectors(provider, 1, &vectors)?;
        match vectors.first() {
            Some(query) => space.stores.vector.search(query, k).await,
            None => Ok(Vec::new()),
        }
    }

    async fn lexical_search(
        &self,
        space: &ModalitySpace,
        text: &str,
        k: usize,
    ) -> Result<Vec<ScoredId>> {
        if space.stores.document.len().await? == 0 {
            tracing::warn!(namespace = %space.namespace, "document store is empty; skipping BM25");
            return Ok(Vec::new());
        }
        space.stores.document.lexical_search(text, k).await
    }

    async fn hydrate(
        &self,
        space: &ModalitySpace,
        candidates: Vec<Candidate>,
        limit: usize,
    ) -> Result<Vec<RetrievalHit>> {
        let mut hits = Vec::with_capacity(limit.min(candidates.len()));
        for c in candidates {
            if hits.len() >= limit {
                break;
            }
            match space.stores.document.get(&c.id).await? {
                Some(entry) => hits.push(RetrievalHit {
                    node_id: entry.id,
                    score: c.score,
                    origin: c.origin,
                    modality: entry.modality,
                    source: entry.source,
                    text: entry.text,
                    metadata: entry.metadata,
                }),
                None => tracing::debug!(id = %c.id, "dropping hit missing from document store"),
            }
        }
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingProvider;
    use crate::stores::StoreSet;
    use ragweave_core::models::{DocStoreEntry, VectorRecord};

    async fn engine_with(docs: &[(&str, &str)]) -> QueryEngine {
        let provider = Arc::new(HashingProvider::with_dims(Modality::Text, 64));
        let space = ModalitySpace::new("kb", provider.clone(), StoreSet::memory(None));
        for (id, text) in docs {
            use ragweave_core::embedding::EmbedProvider;
            let v = provider
                .embed(&[EmbedInput::Text(text.to_string())])
                .await
                .unwrap();
            space
                .stores
                .vector
                .upsert(&[VectorRecord {
                    id: id.to_string(),
                    modality: Modality::Text,
                    vector: v[0].clone(),
                }])
                .await
                .unwrap();
            space
                .stores
                .document
                .upsert(&[DocStoreEntry {
                    id: id.to_string(),
                    modality: Modality::Text,
                    source: format!("{id}.md"),
                    chunk_index: 0,
                    text: text.to_string(),
                    metadata: serde_json::json!({}),
                    hash: "h".into(),
                }])
                .await
                .unwrap();
        }
        QueryEngine::new([space], RetrievalConfig::default())
    }

    fn text(q: &str) -> QueryInput {
        QueryInput::Text(q.to_string())
    }

    #[tokio::test]
    async fn test_fusion_is_duplicate_free_and_marks_origin() {
        let engine = engine_with(&[
            ("a", "rust borrow checker lifetimes"),
            ("b", "python garbage collector"),
            ("c", "borrow money from a bank"),
        ])
        .await;
        let hits = engine
            .query(ModalityPair::same(Modality::Text), &text("borrow checker"), 10)
            .await
            .unwrap();
        assert_eq!(hits[0].node_id, "a");
        assert_eq!(hits[0].origin, HitOrigin::Both);
        let mut ids: Vec<_> = hits.iter().map(|h| h.node_id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), hits.len());
    }

    #[tokio::test]
    async fn test_bm25_only_rejects_media_queries() {
        let engine = engine_with(&[("a", "x")]).await;
        let err = engine
            .query_with_mode(
                ModalityPair::same(Modality::Image),
                &QueryInput::Media(vec![1, 2, 3]),
                5,
                RetrievalMode::Bm25Only,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_rejects_empty_and_mismatched_queries() {
        let engine = engine_with(&[("a", "x")]).await;
        let pair = ModalityPair::same(Modality::Text);
        assert!(engine.query(pair, &text("   "), 5).await.is_err());
        assert!(engine.query(pair, &QueryInput::Media(vec![1]), 5).await.is_err());
        assert!(engine.query(pair, &text("x"), 0).await.is_err());
        let missing = ModalityPair::text_to(Modality::Audio);
        assert!(matches!(
            engine.query(missing, &text("x"), 5).await,
            Err(Error::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_store_returns_no_hits() {
        let engine = engine_with(&[]).await;
        let hits = engine
            .query(ModalityPair::same(Modality::Text), &text("anything"), 5)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_bm25_only_returns_raw_scores() {
        let engine = engine_with(&[("a", "alpha beta"), ("b", "gamma")]).await;
        let hits = engine
            .query_with_mode(
                ModalityPair::same(Modality::Text),
                &text("alpha"),
                5,
                RetrievalMode::Bm25Only,
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].origin, HitOrigin::Bm25);
        assert!(hits[0].score > 0.0);
    }
}
