//! Embedding provider trait and vector utilities.
//!
//! Defines the [`EmbedProvider`] trait that every embedding backend
//! implements, the key-sanitizing rules that turn a provider identity
//! into an embedding-space key, and pure helpers for vector
//! serialization and similarity.
//!
//! Concrete providers (OpenAI, Ollama, feature hashing) live in the
//! `ragweave` app crate.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::models::Modality;

const MIN_KEY_LEN: usize = 3;
const MAX_KEY_LEN: usize = 63;

/// One item to embed.
#[derive(Debug, Clone, PartialEq)]
pub enum EmbedInput {
    Text(String),
    Media { modality: Modality, bytes: Vec<u8> },
}

impl EmbedInput {
    pub fn modality(&self) -> Modality {
        match self {
            EmbedInput::Text(_) => Modality::Text,
            EmbedInput::Media { modality, .. } => *modality,
        }
    }
}

/// An embedding model bound to one modality's vector space.
#[async_trait]
pub trait EmbedProvider: Send + Sync {
    /// Provider family (e.g. `"openai"`).
    fn name(&self) -> &str;
    /// Model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Vector dimensionality.
    fn dims(&self) -> usize;
    /// The space this provider embeds into.
    fn modality(&self) -> Modality;

    /// Whether inputs of `input` modality can be projected into this space.
    /// Text-to-media search needs providers that also accept text.
    fn accepts(&self, input: Modality) -> bool {
        input == self.modality()
    }

    /// Sanitized `{provider}_{model}_{modality}` key identifying the space.
    fn space_key(&self) -> String {
        space_key(self.name(), self.model_name(), self.modality())
    }

    /// Embed `inputs`, returning one vector per input in order.
    async fn embed(&self, inputs: &[EmbedInput]) -> Result<Vec<Vec<f32>>>;
}

/// Make `raw` safe to use as a table prefix / namespace key.
///
/// Every character outside `[A-Za-z0-9_]` becomes `_`; short keys are
/// padded with `_` to 3 chars and keys over 63 chars are shortened to a
/// readable prefix plus a hash of the full key.
pub fn sanitize_key(raw: &str) -> String {
    let mut key: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    while key.len() < MIN_KEY_LEN {
        key.push('_');
    }
    if key.len() > MAX_KEY_LEN {
        let digest = hex::encode(Sha256::digest(raw.as_bytes()));
        key = format!("{}_{}", &key[..MAX_KEY_LEN - 33], &digest[..32]);
    }
    key
}

pub fn space_key(provider: &str, model: &str, modality: Modality) -> String {
    sanitize_key(&format!("{provider}_{model}_{modality}"))
}

/// Namespace of one (knowledge base, embedding space) pair.
pub fn namespace(kb: &str, space_key: &str) -> String {
    sanitize_key(&format!("{kb}__{space_key}"))
}

/// Check a provider response against the request: one vector per input,
/// each of the advertised dimensionality.
pub fn check_vectors(provider: &dyn EmbedProvider, inputs: usize, vectors: &[Vec<f32>]) -> Result<()> {
    if vectors.len() != inputs {
        return Err(Error::provider_fatal(
            provider.name(),
            format!("returned {} vectors for {} inputs", vectors.len(), inputs),
        ));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != provider.dims()) {
        return Err(Error::provider_fatal(
            provider.name(),
            format!(
                "returned a {}-dim vector, expected {}",
                bad.len(),
                provider.dims()
            ),
        ));
    }
    Ok(())
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// # Example
///
/// ```rust
/// use ragweave_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB written by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_replaces_invalid_chars() {
        assert_eq!(
            sanitize_key("openai_text-embedding-3-small_text"),
            "openai_text_embedding_3_small_text"
        );
        assert_eq!(sanitize_key("a"), "a__");
        assert_eq!(sanitize_key("é/x"), "__x");
    }

    #[test]
    fn test_sanitize_long_keys_are_bounded_and_distinct() {
        let a = sanitize_key(&"x".repeat(100));
        let b = sanitize_key(&format!("{}y", "x".repeat(99)));
        assert_eq!(a.len(), 63);
        assert_eq!(b.len(), 63);
        assert_ne!(a, b);
    }

    #[test]
    fn test_namespace_and_space_key() {
        let space = space_key("ollama", "nomic-embed-text", Modality::Text);
        assert_eq!(space, "ollama_nomic_embed_text_text");
        assert_eq!(namespace("docs", &space), "docs__ollama_nomic_embed_text_text");
    }

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_cosine() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }
}
