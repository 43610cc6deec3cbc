//! Deterministic local embeddings via signed feature hashing.
//!
//! Text is tokenized like the BM25 index and every token is hashed into
//! one of `dims` buckets with a ±1 sign. Media bytes are hashed as byte
//! trigrams (first [`MAX_MEDIA_BYTES`] only). Vectors are L2-normalized,
//! so cosine similarity reflects shared tokens/trigrams. No network, no
//! model download; identical input always yields the identical vector.

use async_trait::async_trait;
use ragweave_core::bm25::tokenize;
use ragweave_core::embedding::{EmbedInput, EmbedProvider};
use ragweave_core::models::Modality;
use ragweave_core::{Error, Result};

use crate::config::EmbeddingConfig;

pub const MAX_MEDIA_BYTES: usize = 1 << 20;
const DEFAULT_MODEL: &str = "feature-hash";

pub struct HashingProvider {
    modality: Modality,
    model: String,
    dims: usize,
}

impl HashingProvider {
    pub fn new(config: &EmbeddingConfig, modality: Modality) -> Result<Self> {
        let dims = config
            .dims
            .filter(|d| *d > 0)
            .ok_or_else(|| Error::config("embedding.dims required for hashing provider"))?;
        Ok(Self::with_dims(modality, dims).named(
            config.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        ))
    }

    pub fn with_dims(modality: Modality, dims: usize) -> Self {
        Self {
            modality,
            model: DEFAULT_MODEL.to_string(),
            dims: dims.max(1),
        }
    }

    fn named(mut self, model: String) -> Self {
        self.model = model;
        self
    }

    fn add(&self, v: &mut [f32], feature: &[u8]) {
        let h = fnv1a(feature);
        let idx = (h % self.dims as u64) as usize;
        let sign = if h >> 63 == 1 { -1.0 } else { 1.0 };
        v[idx] += sign;
    }

    fn vectorize(&self, input: &EmbedInput) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        match input {
            EmbedInput::Text(text) => {
                for token in tokenize(text) {
                    self.add(&mut v, token.as_bytes());
                }
            }
            EmbedInput::Media { bytes, .. } => {
                let bytes = &bytes[..bytes.len().min(MAX_MEDIA_BYTES)];
                if bytes.len() < 3 {
                    self.add(&mut v, bytes);
                } else {
                    for w in bytes.windows(3) {
                        self.add(&mut v, w);
                    }
                }
            }
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

/// 64-bit FNV-1a; stable across platforms and releases.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        h ^= *b as u64;
        h = h.wrapping_mul(0x0100_0000_01b3);
    }
    h
}

#[async_trait]
impl EmbedProvider for HashingProvider {
    fn name(&self) -> &str {
        "hashing"
    }
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn modality(&self) -> Modality {
        self.modality
    }

    /// Accepts its own modality plus text, so text queries can search media spaces.
    fn accepts(&self, input: Modality) -> bool {
        input == self.modality || input == Modality::Text
    }

    async fn embed(&self, inputs: &[EmbedInput]) -> Result<Vec<Vec<f32>>> {
        inputs
            .iter()
            .map(|input| {
                if self.accepts(input.modality()) {
                    Ok(self.vectorize(input))
                } else {
                    Err(Error::provider_fatal(
                        self.name(),
                        format!(
                            "cannot embed {} input into the {} space",
                            input.modality(),
                            self.modality
                        ),
                    ))
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ragweave_core::embedding::cosine_similarity;

    fn text(t: &str) -> EmbedInput {
        EmbedInput::Text(t.to_string())
    }

    #[tokio::test]
    async fn test_deterministic_and_normalized() {
        let p = HashingProvider::with_dims(Modality::Text, 128);
        let a = p.embed(&[text("hello hashing world")]).await.unwrap();
        let b = p.embed(&[text("hello hashing world")]).await.unwrap();
        assert_eq!(a, b);
        let norm: f32 = a[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_shared_tokens_are_similar() {
        let p = HashingProvider::with_dims(Modality::Text, 256);
        let v = p
            .embed(&[
                text("photosynthesis in green plants"),
                text("how plants perform photosynthesis"),
                text("compiler register allocation"),
            ])
            .await
            .unwrap();
        assert!(cosine_similarity(&v[0], &v[1]) > cosine_similarity(&v[0], &v[2]));
    }

    #[tokio::test]
    async fn test_media_space_accepts_text_but_not_other_media() {
        let p = HashingProvider::with_dims(Modality::Audio, 32);
        assert!(p.accepts(Modality::Text));
        assert!(p
            .embed(&[EmbedInput::Media {
                modality: Modality::Audio,
                bytes: b"RIFF....WAVEfmt ".to_vec()
            }])
            .await
            .is_ok());
        assert!(p
            .embed(&[EmbedInput::Media {
                modality: Modality::Image,
                bytes: vec![0; 10]
            }])
            .await
            .is_err());
    }

    #[test]
    fn test_space_key_uses_model_name() {
        assert_eq!(
            HashingProvider::with_dims(Modality::Image, 8).space_key(),
            "hashing_feature_hash_image"
        );
    }
}
