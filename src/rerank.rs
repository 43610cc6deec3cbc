//! Reranker implementations.
//!
//! [`CohereReranker`] posts the query and candidate texts to Cohere's
//! `/v2/rerank` endpoint and reorders candidates by `relevance_score`.
//! Reads `COHERE_API_KEY` at call time.

use std::sync::Arc;

use async_trait::async_trait;
use ragweave_core::models::RetrievalHit;
use ragweave_core::rerank::Reranker;
use ragweave_core::{Error, Result};
use serde_json::Value;

use crate::config::{RerankConfig, RerankProviderKind};
use crate::http;

pub struct CohereReranker {
    model: String,
    url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl CohereReranker {
    pub fn new(config: &RerankConfig) -> Result<Self> {
        Ok(Self {
            model: config.model.clone(),
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.cohere.com".to_string()),
            max_retries: config.max_retries,
            client: http::client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl Reranker for CohereReranker {
    fn name(&self) -> &str {
        "cohere"
    }

    async fn rerank(
        &self,
        query: &str,
        candidates: Vec<RetrievalHit>,
        top_k: usize,
    ) -> Result<Vec<RetrievalHit>> {
        if candidates.is_empty() {
            return Ok(candidates);
        }
        let api_key = std::env::var("COHERE_API_KEY")
            .map_err(|_| Error::provider_fatal(self.name(), "COHERE_API_KEY not set"))?;

        let documents: Vec<&str> = candidates.iter().map(|c| c.text.as_str()).collect();
        let body = serde_json::json!({
            "model": self.model,
            "query": query,
            "documents": documents,
            "top_n": top_k.min(candidates.len()),
        });
        let json = http::post_json(
            &self.client,
            self.name(),
            &format!("{}/v2/rerank", self.url.trim_end_matches('/')),
            Some(api_key.as_str()),
            &body,
            self.max_retries,
        )
        .await?;

        let scores = parse_rerank_response(&json)?;
        Ok(apply_scores(candidates, &scores, top_k))
    }
}

/// `(index, relevance_score)` pairs from a rerank response.
fn parse_rerank_response(json: &Value) -> Result<Vec<(usize, f64)>> {
    json.get("results")
        .and_then(|r| r.as_array())
        .ok_or_else(|| Error::provider_fatal("cohere", "invalid response: missing results"))?
        .iter()
        .map(|r| {
            let index = r.get("index").and_then(|i| i.as_u64());
            let score = r.get("relevance_score").and_then(|s| s.as_f64());
            match (index, score) {
                (Some(i), Some(s)) => Ok((i as usize, s)),
                _ => Err(Error::provider_fatal(
                    "cohere",
                    "invalid response: result without index or relevance_score",
                )),
            }
        })
        .collect()
}

/// Reorder `candidates` by reranker score, keeping node identity.
/// Unknown or repeated indices are dropped.
pub fn apply_scores(
    candidates: Vec<RetrievalHit>,
    scores: &[(usize, f64)],
    top_k: usize,
) -> Vec<RetrievalHit> {
    let mut slots: Vec<Option<RetrievalHit>> = candidates.into_iter().map(Some).collect();
    let mut ranked: Vec<RetrievalHit> = scores
        .iter()
        .filter_map(|(i, s)| {
            let mut hit = slots.get_mut(*i)?.take()?;
            hit.score = *s;
            Some(hit)
        })
        .collect();
    ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    ranked.truncate(top_k);
    ranked
}

pub fn create_reranker(config: &RerankConfig) -> Result<Option<Arc<dyn Reranker>>> {
    match config.provider {
        None => Ok(None),
        Some(RerankProviderKind::Cohere) => Ok(Some(Arc::new(CohereReranker::new(config)?))),
    }
}
