//! In-memory store backends.
//!
//! Uses `HashMap`s behind `std::sync::RwLock`. Vector search is
//! brute-force cosine similarity; lexical search is an in-process
//! [`Bm25Index`]. Nothing here survives a restart, so all three report
//! `is_durable() == false`.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use crate::bm25::Bm25Index;
use crate::embedding::cosine_similarity;
use crate::error::{Error, Result};
use crate::models::{
    is_part_of, DocStoreEntry, FingerprintKey, FingerprintRecord, ScoredId, VectorRecord,
};

use super::{DocumentStore, FingerprintCache, VectorStore};

const BACKEND: &str = "memory";

fn poisoned<T>(_: PoisonError<T>) -> Error {
    Error::store(BACKEND, "lock poisoned by a panicked writer")
}

// ============ Vector store ============

#[derive(Default)]
pub struct MemoryVectorStore {
    records: RwLock<HashMap<String, VectorRecord>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    fn backend(&self) -> &str {
        BACKEND
    }

    async fn upsert(&self, records: &[VectorRecord]) -> Result<()> {
        let mut stored = self.records.write().map_err(poisoned)?;
        for r in records {
            stored.insert(r.id.clone(), r.clone());
        }
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        let mut stored = self.records.write().map_err(poisoned)?;
        for id in ids {
            stored.remove(id);
        }
        Ok(())
    }

    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredId>> {
        let stored = self.records.read().map_err(poisoned)?;
        let mut hits: Vec<ScoredId> = stored
            .values()
            .map(|r| ScoredId::new(r.id.clone(), cosine_similarity(query, &r.vector) as f64))
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    async fn existing(&self, ids: &[String]) -> Result<HashSet<String>> {
        let stored = self.records.read().map_err(poisoned)?;
        Ok(ids
            .iter()
            .filter(|id| stored.contains_key(*id))
            .cloned()
            .collect())
    }

    async fn get(&self, ids: &[String]) -> Result<Vec<VectorRecord>> {
        let stored = self.records.read().map_err(poisoned)?;
        Ok(ids.iter().filter_map(|id| stored.get(id).cloned()).collect())
    }

    async fn ids(&self) -> Result<Vec<String>> {
        Ok(self.records.read().map_err(poisoned)?.keys().cloned().collect())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.records.read().map_err(poisoned)?.len())
    }
}

// ============ Document store ============

#[derive(Default)]
struct DocState {
    entries: HashMap<String, DocStoreEntry>,
    index: Bm25Index,
}

#[derive(Default)]
pub struct MemoryDocumentStore {
    state: RwLock<DocState>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    fn backend(&self) -> &str {
        BACKEND
    }

    async fn upsert(&self, entries: &[DocStoreEntry]) -> Result<()> {
        let mut state = self.state.write().map_err(poisoned)?;
        for e in entries {
            state.index.insert(&e.id, &e.text);
            state.entries.insert(e.id.clone(), e.clone());
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<DocStoreEntry>> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(state.entries.get(id).cloned())
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        let mut state = self.state.write().map_err(poisoned)?;
        for id in ids {
            state.entries.remove(id);
            state.index.remove(id);
        }
        Ok(())
    }

    async fn lexical_search(&self, query: &str, k: usize) -> Result<Vec<ScoredId>> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(state.index.search(query, k))
    }

    async fn existing(&self, ids: &[String]) -> Result<HashSet<String>> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(ids
            .iter()
            .filter(|id| state.entries.contains_key(*id))
            .cloned()
            .collect())
    }

    async fn entries_for_source(&self, source: &str) -> Result<Vec<DocStoreEntry>> {
        let state = self.state.read().map_err(poisoned)?;
        let mut found: Vec<(u64, DocStoreEntry)> = state
            .entries
            .values()
            .filter(|e| is_part_of(&e.source, source))
            .map(|e| (state.index.seq(&e.id).unwrap_or(u64::MAX), e.clone()))
            .collect();
        found.sort_by_key(|(seq, _)| *seq);
        Ok(found.into_iter().map(|(_, e)| e).collect())
    }

    async fn ids(&self) -> Result<Vec<String>> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(state.entries.keys().cloned().collect())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.state.read().map_err(poisoned)?.entries.len())
    }
}

// ============ Fingerprint cache ============

#[derive(Default)]
struct CacheState {
    entries: HashMap<FingerprintKey, (FingerprintRecord, u64)>,
    /// Access tick → key; the first entry is the least recently used.
    recency: BTreeMap<u64, FingerprintKey>,
    tick: u64,
}

impl CacheState {
    fn touch(&mut self, key: &FingerprintKey) {
        self.tick += 1;
        let tick = self.tick;
        if let Some((_, last)) = self.entries.get_mut(key) {
            self.recency.remove(last);
            *last = tick;
            self.recency.insert(tick, key.clone());
        }
    }
}

/// Fingerprint cache with optional LRU bound.
///
/// Without a capacity nothing is ever evicted. With one, inserting past
/// the bound drops the least recently looked-up or written entries.
/// Eviction only forgets the fingerprint; the nodes it points at stay
/// in the vector and document stores.
#[derive(Default)]
pub struct MemoryFingerprintCache {
    capacity: Option<usize>,
    state: RwLock<CacheState>,
}

impl MemoryFingerprintCache {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            capacity,
            state: RwLock::new(CacheState::default()),
        }
    }
}

#[async_trait]
impl FingerprintCache for MemoryFingerprintCache {
    fn backend(&self) -> &str {
        BACKEND
    }

    async fn lookup(&self, key: &FingerprintKey) -> Result<Option<FingerprintRecord>> {
        let mut state = self.state.write().map_err(poisoned)?;
        let record = state.entries.get(key).map(|(r, _)| r.clone());
        if record.is_some() {
            state.touch(key);
        }
        Ok(record)
    }

    async fn put(&self, key: &FingerprintKey, node_ids: &[String]) -> Result<()> {
        let mut state = self.state.write().map_err(poisoned)?;
        let record = FingerprintRecord {
            node_ids: node_ids.to_vec(),
            created_at: Utc::now(),
        };
        if let Some((_, last)) = state.entries.insert(key.clone(), (record, 0)) {
            state.recency.remove(&last);
        }
        state.touch(key);

        if let Some(cap) = self.capacity {
            while state.entries.len() > cap {
                let Some((_, oldest)) = state.recency.pop_first() else {
                    break;
                };
                state.entries.remove(&oldest);
                tracing::debug!(key = %oldest, "evicted fingerprint");
            }
        }
        Ok(())
    }

    async fn invalidate(&self, key: &FingerprintKey) -> Result<bool> {
        let mut state = self.state.write().map_err(poisoned)?;
        match state.entries.remove(key) {
            Some((_, tick)) => {
                state.recency.remove(&tick);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.state.read().map_err(poisoned)?.entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Modality;

    fn entry(id: &str, source: &str, text: &str) -> DocStoreEntry {
        DocStoreEntry {
            id: id.to_string(),
            modality: Modality::Text,
            source: source.to_string(),
            chunk_index: 0,
            text: text.to_string(),
            metadata: serde_json::json!({}),
            hash: "h".to_string(),
        }
    }

    fn key(hash: &str) -> FingerprintKey {
        FingerprintKey::new("kb", Modality::Text, "space", hash)
    }

    #[tokio::test]
    async fn test_vector_search_orders_by_similarity() {
        let store = MemoryVectorStore::new();
        store
            .upsert(&[
                VectorRecord {
                    id: "a".into(),
                    modality: Modality::Text,
                    vector: vec![1.0, 0.0],
                },
                VectorRecord {
                    id: "b".into(),
                    modality: Modality::Text,
                    vector: vec![0.6, 0.8],
                },
            ])
            .await
            .unwrap();
        let hits = store.search(&[0.0, 1.0], 2).await.unwrap();
        assert_eq!(hits[0].id, "b");
        assert_eq!(hits.len(), 2);

        store.delete(&["b".to_string()]).await.unwrap();
        assert_eq!(store.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_document_search_visible_after_upsert() {
        let store = MemoryDocumentStore::new();
        store
            .upsert(&[
                entry("1", "a.md", "quantum entanglement notes"),
                entry("2", "b.md", "sourdough bread recipe"),
            ])
            .await
            .unwrap();
        let hits = store.lexical_search("sourdough", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "2");

        let by_source = store.entries_for_source("a.md").await.unwrap();
        assert_eq!(by_source.len(), 1);
        assert_eq!(store.ids().await.unwrap().len(), 2);

        store.delete(&["2".to_string()]).await.unwrap();
        assert!(store.lexical_search("sourdough", 5).await.unwrap().is_empty());
        assert!(store.get("2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_entries_for_source_includes_parts() {
        let store = MemoryDocumentStore::new();
        store
            .upsert(&[
                entry("1", "clip.mp4#frame-0001", "frame"),
                entry("2", "clip.mp4#audio", "audio"),
                entry("3", "clip.mp4.txt", "caption file"),
            ])
            .await
            .unwrap();
        let parts = store.entries_for_source("clip.mp4").await.unwrap();
        let ids: Vec<&str> = parts.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);
        assert_eq!(store.entries_for_source("clip.mp4#audio").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_vector_get_returns_present_records_in_order() {
        let store = MemoryVectorStore::new();
        let record = |id: &str, x: f32| VectorRecord {
            id: id.into(),
            modality: Modality::Text,
            vector: vec![x, 1.0],
        };
        store.upsert(&[record("a", 0.1), record("b", 0.2)]).await.unwrap();
        let got = store
            .get(&["b".to_string(), "missing".to_string(), "a".to_string()])
            .await
            .unwrap();
        let ids: Vec<&str> = got.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(got[0].vector, vec![0.2, 1.0]);
    }

    #[tokio::test]
    async fn test_cache_unbounded_by_default() {
        let cache = MemoryFingerprintCache::new(None);
        for i in 0..100 {
            cache.put(&key(&i.to_string()), &[]).await.unwrap();
        }
        assert_eq!(cache.len().await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_cache_evicts_least_recently_used() {
        let cache = MemoryFingerprintCache::new(Some(2));
        cache.put(&key("a"), &["n1".into()]).await.unwrap();
        cache.put(&key("b"), &["n2".into()]).await.unwrap();
        // Touch "a" so "b" becomes the eviction candidate.
        assert!(cache.lookup(&key("a")).await.unwrap().is_some());
        cache.put(&key("c"), &["n3".into()]).await.unwrap();

        assert_eq!(cache.len().await.unwrap(), 2);
        assert!(cache.lookup(&key("b")).await.unwrap().is_none());
        assert!(cache.lookup(&key("a")).await.unwrap().is_some());
        assert!(cache.lookup(&key("c")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cache_invalidate() {
        let cache = MemoryFingerprintCache::new(Some(4));
        cache.put(&key("a"), &["n1".into()]).await.unwrap();
        assert!(cache.invalidate(&key("a")).await.unwrap());
        assert!(!cache.invalidate(&key("a")).await.unwrap());
        assert_eq!(cache.len().await.unwrap(), 0);
    }
}
