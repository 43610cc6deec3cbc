//! Okapi BM25 scoring for the in-memory document store.
//!
//! `score(q, d) = Σ idf(t) · tf·(k1+1) / (tf + k1·(1 - b + b·|d|/avgdl))`
//! with `idf(t) = ln(1 + (N - df + 0.5) / (df + 0.5))`, which stays
//! positive even for terms present in every document.
//!
//! Ties are broken by insertion sequence so results are deterministic.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::models::ScoredId;

pub const K1: f64 = 1.2;
pub const B: f64 = 0.75;

/// Lower-case alphanumeric word tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

struct DocStats {
    seq: u64,
    len: usize,
    tf: HashMap<String, u32>,
}

/// Inverted statistics over a set of documents.
#[derive(Default)]
pub struct Bm25Index {
    docs: HashMap<String, DocStats>,
    df: HashMap<String, usize>,
    total_len: usize,
    next_seq: u64,
}

impl Bm25Index {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Insert or replace `id`. A replaced document keeps its original
    /// insertion sequence.
    pub fn insert(&mut self, id: &str, text: &str) {
        let seq = match self.remove(id) {
            Some(seq) => seq,
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                seq
            }
        };

        let tokens = tokenize(text);
        let mut tf: HashMap<String, u32> = HashMap::new();
        for t in &tokens {
            *tf.entry(t.clone()).or_insert(0) += 1;
        }
        for term in tf.keys() {
            *self.df.entry(term.clone()).or_insert(0) += 1;
        }
        self.total_len += tokens.len();
        self.docs.insert(
            id.to_string(),
            DocStats {
                seq,
                len: tokens.len(),
                tf,
            },
        );
    }

    /// Insertion sequence of `id`.
    pub fn seq(&self, id: &str) -> Option<u64> {
        self.docs.get(id).map(|d| d.seq)
    }

    /// Remove `id`, returning its insertion sequence if it was present.
    pub fn remove(&mut self, id: &str) -> Option<u64> {
        let stats = self.docs.remove(id)?;
        for term in stats.tf.keys() {
            if let Some(n) = self.df.get_mut(term) {
                *n -= 1;
                if *n == 0 {
                    self.df.remove(term);
                }
            }
        }
        self.total_len -= stats.len;
        Some(stats.seq)
    }

    /// Top `k` documents with a positive score for `query`.
    pub fn search(&self, query: &str, k: usize) -> Vec<ScoredId> {
        let mut terms = tokenize(query);
        terms.sort();
        terms.dedup();
        if terms.is_empty() || self.docs.is_empty() || k == 0 {
            return Vec::new();
        }

        let n = self.docs.len() as f64;
        let avgdl = (self.total_len as f64 / n).max(1.0);
        let idf: Vec<(&str, f64)> = terms
            .iter()
            .filter_map(|t| {
                let df = *self.df.get(t)? as f64;
                Some((t.as_str(), (1.0 + (n - df + 0.5) / (df + 0.5)).ln()))
            })
            .collect();
        if idf.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(u64, ScoredId)> = self
            .docs
            .iter()
            .filter_map(|(id, stats)| {
                let dl = stats.len as f64;
                let score: f64 = idf
                    .iter()
                    .filter_map(|(term, idf)| {
                        let tf = *stats.tf.get(*term)? as f64;
                        Some(idf * tf * (K1 + 1.0) / (tf + K1 * (1.0 - B + B * dl / avgdl)))
                    })
                    .sum();
                (score > 0.0).then(|| (stats.seq, ScoredId::new(id.clone(), score)))
            })
            .collect();

        scored.sort_by(|(seq_a, a), (seq_b, b)| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then(seq_a.cmp(seq_b))
        });
        scored.truncate(k);
        scored.into_iter().map(|(_, s)| s).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize() {
        assert_eq!(
            tokenize("Hello, World! rust-lang 2024"),
            vec!["hello", "world", "rust", "lang", "2024"]
        );
        assert!(tokenize("  ...  ").is_empty());
    }

    #[test]
    fn test_rarer_term_ranks_higher() {
        let mut idx = Bm25Index::new();
        idx.insert("a", "the cat sat on the mat");
        idx.insert("b", "the dog sat on the log");
        idx.insert("c", "the cat chased the dog");
        let hits = idx.search("mat", 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a");
    }

    #[test]
    fn test_ties_broken_by_insertion_order() {
        let mut idx = Bm25Index::new();
        idx.insert("z", "shared words here");
        idx.insert("a", "shared words here");
        idx.insert("m", "shared words here");
        let ids: Vec<_> = idx.search("shared", 10).into_iter().map(|h| h.id).collect();
        assert_eq!(ids, vec!["z", "a", "m"]);
    }

    #[test]
    fn test_reinsert_keeps_sequence_and_updates_stats() {
        let mut idx = Bm25Index::new();
        idx.insert("first", "apple");
        idx.insert("second", "apple");
        idx.insert("first", "apple pie");
        assert_eq!(idx.len(), 2);
        let ids: Vec<_> = idx.search("apple", 10).into_iter().map(|h| h.id).collect();
        // "second" is shorter, so it wins on length normalization.
        assert_eq!(ids, vec!["second", "first"]);
        assert_eq!(idx.search("pie", 10)[0].id, "first");
    }

    #[test]
    fn test_remove() {
        let mut idx = Bm25Index::new();
        idx.insert("a", "unique term");
        assert!(idx.remove("a").is_some());
        assert!(idx.remove("a").is_none());
        assert!(idx.search("unique", 5).is_empty());
        assert!(idx.is_empty());
    }
}
