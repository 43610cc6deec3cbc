//! Embedding provider implementations.
//!
//! Concrete [`EmbedProvider`]s selected by `[embedding.<modality>]`:
//! - **[`OpenAIProvider`]**: OpenAI (or compatible) `/embeddings` endpoint; text only.
//! - **[`OllamaProvider`]**: a local Ollama instance's `/api/embed` endpoint; text only.
//! - **[`HashingProvider`]**: deterministic local feature hashing; any modality, no network.
//!
//! Remote providers retry transient failures with exponential backoff
//! (see [`crate::http`]).
//!
//! # Provider Selection
//!
//! ```rust
//! # use ragweave::config::{EmbeddingConfig, EmbeddingProviderKind};
//! # use ragweave::embedding::create_provider;
//! # use ragweave_core::embedding::EmbedProvider;
//! # use ragweave_core::models::Modality;
//! let config = EmbeddingConfig {
//!     provider: EmbeddingProviderKind::Hashing,
//!     model: None,
//!     dims: Some(64),
//!     url: None,
//!     max_retries: 0,
//!     timeout_secs: 5,
//! };
//! let provider = create_provider(&config, Modality::Text).unwrap();
//! assert_eq!(provider.space_key(), "hashing_feature_hash_text");
//! ```

mod hashing;

pub use hashing::HashingProvider;

use std::sync::Arc;

use async_trait::async_trait;
use ragweave_core::embedding::{EmbedInput, EmbedProvider};
use ragweave_core::models::Modality;
use ragweave_core::{Error, Result};
use serde_json::Value;

use crate::config::{EmbeddingConfig, EmbeddingProviderKind};
use crate::http;

fn texts<'a>(provider: &str, inputs: &'a [EmbedInput]) -> Result<Vec<&'a str>> {
    inputs
        .iter()
        .map(|i| match i {
            EmbedInput::Text(t) => Ok(t.as_str()),
            EmbedInput::Media { modality, .. } => Err(Error::provider_fatal(
                provider,
                format!("cannot embed {modality} input"),
            )),
        })
        .collect()
}

fn parse_vector(provider: &str, value: &Value) -> Result<Vec<f32>> {
    let arr = value
        .as_array()
        .ok_or_else(|| Error::provider_fatal(provider, "embedding is not an array"))?;
    arr.iter()
        .enumerate()
        .map(|(i, v)| {
            v.as_f64().map(|x| x as f32).ok_or_else(|| {
                Error::provider_fatal(provider, format!("embedding component {i} is not a number: {v}"))
            })
        })
        .collect()
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI embeddings API.
///
/// Reads `OPENAI_API_KEY` at call time.
pub struct OpenAIProvider {
    model: String,
    dims: usize,
    url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| Error::config("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| Error::config("embedding.dims required for OpenAI provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());

        Ok(Self {
            model,
            dims,
            url,
            max_retries: config.max_retries,
            client: http::client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl EmbedProvider for OpenAIProvider {
    fn name(&self) -> &str {
        "openai"
    }
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn modality(&self) -> Modality {
        Modality::Text
    }

    async fn embed(&self, inputs: &[EmbedInput]) -> Result<Vec<Vec<f32>>> {
        let texts = texts(self.name(), inputs)?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| Error::provider_fatal(self.name(), "OPENAI_API_KEY not set"))?;

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let json = http::post_json(
            &self.client,
            self.name(),
            &format!("{}/embeddings", self.url.trim_end_matches('/')),
            Some(api_key.as_str()),
            &body,
            self.max_retries,
        )
        .await?;
        parse_openai_response(&json)
    }
}

/// Extract `data[].embedding`, ordered by `data[].index`.
fn parse_openai_response(json: &Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| Error::provider_fatal("openai", "invalid response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        let embedding = item
            .get("embedding")
            .ok_or_else(|| Error::provider_fatal("openai", "invalid response: missing embedding"))?;
        indexed.push((index, parse_vector("openai", embedding)?));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance.
///
/// Calls `POST /api/embed` on the configured URL (default `http://localhost:11434`).
pub struct OllamaProvider {
    model: String,
    dims: usize,
    url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| Error::config("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| Error::config("embedding.dims required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Ok(Self {
            model,
            dims,
            url,
            max_retries: config.max_retries,
            client: http::client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl EmbedProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn modality(&self) -> Modality {
        Modality::Text
    }

    async fn embed(&self, inputs: &[EmbedInput]) -> Result<Vec<Vec<f32>>> {
        let texts = texts(self.name(), inputs)?;
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let json = http::post_json(
            &self.client,
            self.name(),
            &format!("{}/api/embed", self.url.trim_end_matches('/')),
            None,
            &body,
            self.max_retries,
        )
        .await?;
        parse_ollama_response(&json)
    }
}

fn parse_ollama_response(json: &Value) -> Result<Vec<Vec<f32>>> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| Error::provider_fatal("ollama", "invalid response: missing embeddings array"))?
        .iter()
        .map(|e| parse_vector("ollama", e))
        .collect()
}

/// Create the provider configured for `modality`.
pub fn create_provider(config: &EmbeddingConfig, modality: Modality) -> Result<Arc<dyn EmbedProvider>> {
    match config.provider {
        EmbeddingProviderKind::OpenAI => Ok(Arc::new(OpenAIProvider::new(config)?)),
        EmbeddingProviderKind::Ollama => Ok(Arc::new(OllamaProvider::new(config)?)),
        EmbeddingProviderKind::Hashing => Ok(Arc::new(HashingProvider::new(config, modality)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_openai_response_orders_by_index() {
        let json = serde_json::json!({
            "data": [
                { "index": 1, "embedding": [0.0, 1.0] },
                { "index": 0, "embedding": [1.0, 0.0] },
            ]
        });
        let vecs = parse_openai_response(&json).unwrap();
        assert_eq!(vecs, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_parse_openai_response_rejects_garbage() {
        let err = parse_openai_response(&serde_json::json!({ "error": "x" })).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_parse_ollama_response() {
        let json = serde_json::json!({ "embeddings": [[0.5, 0.25], [1.0, 2.0]] });
        let vecs = parse_ollama_response(&json).unwrap();
        assert_eq!(vecs.len(), 2);
        assert_eq!(vecs[1], vec![1.0, 2.0]);
    }

    #[test]
    fn test_non_numeric_component_is_rejected() {
        let json = serde_json::json!({ "embeddings": [[0.5, null, 0.25]] });
        let err = parse_ollama_response(&json).unwrap_err();
        assert!(matches!(err, Error::Provider { retryable: false, .. }));
        assert!(err.to_string().contains("component 1"));
    }

    #[tokio::test]
    async fn test_text_only_providers_reject_media() {
        let config = EmbeddingConfig {
            provider: EmbeddingProviderKind::Ollama,
            model: Some("nomic-embed-text".into()),
            dims: Some(768),
            url: Some("http://127.0.0.1:9".into()),
            max_retries: 0,
            timeout_secs: 1,
        };
        let provider = create_provider(&config, Modality::Text).unwrap();
        assert_eq!(provider.space_key(), "ollama_nomic_embed_text_text");
        let err = provider
            .embed(&[EmbedInput::Media {
                modality: Modality::Image,
                bytes: vec![1, 2, 3],
            }])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Provider { .. }));
    }
}
