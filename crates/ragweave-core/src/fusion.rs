//! Weighted fusion of vector and lexical result lists.
//!
//! # Algorithm
//!
//! 1. Normalize each list to `[0, 1]` independently ([`Normalization`]).
//! 2. For every node id in either list:
//!    `combined = λ_v × vector + λ_b × bm25`, an absent side contributing 0.
//! 3. Sort by combined score (desc), then vector rank, then lexical rank
//!    (ids missing from a list rank after every id present in it), then id.
//!
//! The weights need not sum to 1.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::models::{HitOrigin, ScoredId};

/// Per-list score normalization strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    /// `(s - min) / (max - min)`; all-equal lists map to `1.0`.
    #[default]
    MinMax,
    /// `1 - rank / n`, ignoring raw score magnitudes.
    Rank,
}

impl Normalization {
    pub fn apply(&self, results: &[ScoredId]) -> Vec<f64> {
        match self {
            Normalization::MinMax => min_max(results),
            Normalization::Rank => {
                let n = results.len() as f64;
                (0..results.len()).map(|rank| 1.0 - rank as f64 / n).collect()
            }
        }
    }
}

fn min_max(results: &[ScoredId]) -> Vec<f64> {
    if results.is_empty() {
        return Vec::new();
    }
    let min = results.iter().map(|r| r.score).fold(f64::INFINITY, f64::min);
    let max = results
        .iter()
        .map(|r| r.score)
        .fold(f64::NEG_INFINITY, f64::max);
    let range = max - min;
    if range.abs() < f64::EPSILON {
        return vec![1.0; results.len()];
    }
    results.iter().map(|r| (r.score - min) / range).collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionWeights {
    pub vector: f64,
    pub bm25: f64,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            vector: 0.5,
            bm25: 0.5,
        }
    }
}

/// One fused candidate with its provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct Fused {
    pub id: String,
    pub score: f64,
    pub vector_score: f64,
    pub bm25_score: f64,
    pub vector_rank: Option<usize>,
    pub bm25_rank: Option<usize>,
}

impl Fused {
    pub fn origin(&self) -> HitOrigin {
        match (self.vector_rank, self.bm25_rank) {
            (Some(_), Some(_)) => HitOrigin::Both,
            (None, Some(_)) => HitOrigin::Bm25,
            _ => HitOrigin::Vector,
        }
    }
}

/// Merge two ranked lists into one duplicate-free, deterministically
/// ordered list. Input lists are expected sorted best-first; duplicate
/// ids within one list keep their first (best) occurrence.
pub fn fuse(
    vector: &[ScoredId],
    bm25: &[ScoredId],
    weights: FusionWeights,
    normalization: Normalization,
) -> Vec<Fused> {
    let vector_norm = normalization.apply(vector);
    let bm25_norm = normalization.apply(bm25);

    let mut merged: HashMap<&str, Fused> = HashMap::new();

    for (rank, (hit, norm)) in vector.iter().zip(vector_norm).enumerate() {
        merged.entry(hit.id.as_str()).or_insert_with(|| Fused {
            id: hit.id.clone(),
            score: 0.0,
            vector_score: norm,
            bm25_score: 0.0,
            vector_rank: Some(rank),
            bm25_rank: None,
        });
    }

    for (rank, (hit, norm)) in bm25.iter().zip(bm25_norm).enumerate() {
        let entry = merged.entry(hit.id.as_str()).or_insert_with(|| Fused {
            id: hit.id.clone(),
            score: 0.0,
            vector_score: 0.0,
            bm25_score: 0.0,
            vector_rank: None,
            bm25_rank: None,
        });
        if entry.bm25_rank.is_none() {
            entry.bm25_score = norm;
            entry.bm25_rank = Some(rank);
        }
    }

    let mut fused: Vec<Fused> = merged
        .into_values()
        .map(|mut f| {
            f.score = weights.vector * f.vector_score + weights.bm25 * f.bm25_score;
            f
        })
        .collect();

    fused.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| rank_key(a.vector_rank).cmp(&rank_key(b.vector_rank)))
            .then_with(|| rank_key(a.bm25_rank).cmp(&rank_key(b.bm25_rank)))
            .then_with(|| a.id.cmp(&b.id))
    });
    fused
}

fn rank_key(rank: Option<usize>) -> usize {
    rank.unwrap_or(usize::MAX)
}
