//! Storage capabilities for one (knowledge base, embedding space) namespace.
//!
//! Three coupled stores back every active modality:
//!
//! | Trait | Holds | Queried by |
//! |-------|-------|------------|
//! | [`VectorStore`] | node id → embedding | vector search |
//! | [`DocumentStore`] | node id → text, metadata, content hash | lexical search, hit hydration |
//! | [`FingerprintCache`] | content identity → produced node ids | ingest dedup |
//!
//! The ingest orchestrator keeps vector and document membership identical
//! by committing every batch vector-first, document-second and rolling
//! both back on failure. Backends only need per-call atomicity.
//!
//! Implementations must be `Send + Sync`; they are shared between ingest
//! workers and concurrent queries.

pub mod memory;

use std::collections::HashSet;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{DocStoreEntry, FingerprintKey, FingerprintRecord, ScoredId, VectorRecord};

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Backend label used in logs and errors (e.g. `"memory"`).
    fn backend(&self) -> &str;

    /// Whether writes survive a process restart.
    fn is_durable(&self) -> bool {
        false
    }

    /// Insert or replace every record; all-or-nothing per call.
    async fn upsert(&self, records: &[VectorRecord]) -> Result<()>;

    async fn delete(&self, ids: &[String]) -> Result<()>;

    /// Top `k` ids by cosine similarity to `query`, best first.
    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredId>>;

    /// Subset of `ids` present in the store.
    async fn existing(&self, ids: &[String]) -> Result<HashSet<String>>;

    /// Stored records for the subset of `ids` present, in `ids` order.
    async fn get(&self, ids: &[String]) -> Result<Vec<VectorRecord>>;

    /// Every stored id.
    async fn ids(&self) -> Result<Vec<String>>;

    async fn len(&self) -> Result<usize>;
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn backend(&self) -> &str;

    fn is_durable(&self) -> bool {
        false
    }

    /// Insert or replace every entry; all-or-nothing per call. New ids are
    /// sequenced in slice order; replaced ids keep their sequence.
    async fn upsert(&self, entries: &[DocStoreEntry]) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<DocStoreEntry>>;

    async fn delete(&self, ids: &[String]) -> Result<()>;

    /// Top `k` ids by BM25 relevance, ties broken by insertion sequence.
    /// Visible immediately after a completed [`upsert`](Self::upsert).
    async fn lexical_search(&self, query: &str, k: usize) -> Result<Vec<ScoredId>>;

    async fn existing(&self, ids: &[String]) -> Result<HashSet<String>>;

    /// Entries cut from `source` or from one of its parts
    /// (`source#part`, see [`crate::models::is_part_of`]), in insertion order.
    async fn entries_for_source(&self, source: &str) -> Result<Vec<DocStoreEntry>>;

    /// Every stored id.
    async fn ids(&self) -> Result<Vec<String>>;

    async fn len(&self) -> Result<usize>;
}

#[async_trait]
pub trait FingerprintCache: Send + Sync {
    fn backend(&self) -> &str;

    fn is_durable(&self) -> bool {
        false
    }

    /// Look up a fingerprint. A hit refreshes the entry's recency.
    async fn lookup(&self, key: &FingerprintKey) -> Result<Option<FingerprintRecord>>;

    /// Record that `node_ids` are committed for `key`. Callers must only
    /// invoke this after both stores hold the nodes.
    async fn put(&self, key: &FingerprintKey, node_ids: &[String]) -> Result<()>;

    /// Drop `key`; returns whether it was present.
    async fn invalidate(&self, key: &FingerprintKey) -> Result<bool>;

    async fn len(&self) -> Result<usize>;
}
