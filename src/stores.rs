//! Store wiring: one [`ModalitySpace`] per configured modality.
//!
//! Each space owns its embedding provider and the three stores of its
//! namespace. Backends are chosen independently per store kind
//! (`[stores] vector/document/cache`); SQLite backends share one pool.
//!
//! A set whose vector and document stores were opened separately may
//! start out with different memberships (one side durable, the other
//! fresh); [`StoreSet::reconcile`] drops the nodes only one side holds.

use std::collections::HashSet;
use std::sync::Arc;

use ragweave_core::embedding::{namespace, EmbedProvider};
use ragweave_core::models::Modality;
use ragweave_core::store::memory::{MemoryDocumentStore, MemoryFingerprintCache, MemoryVectorStore};
use ragweave_core::store::{DocumentStore, FingerprintCache, VectorStore};
use ragweave_core::{Error, Result};
use sqlx::SqlitePool;

use crate::config::{StoreProvider, StoresConfig};
use crate::sqlite_store::{SqliteDocumentStore, SqliteFingerprintCache, SqliteVectorStore};

/// The three coupled stores of one namespace.
#[derive(Clone)]
pub struct StoreSet {
    pub vector: Arc<dyn VectorStore>,
    pub document: Arc<dyn DocumentStore>,
    pub cache: Arc<dyn FingerprintCache>,
}

impl StoreSet {
    pub fn memory(cache_capacity: Option<usize>) -> Self {
        Self {
            vector: Arc::new(MemoryVectorStore::new()),
            document: Arc::new(MemoryDocumentStore::new()),
            cache: Arc::new(MemoryFingerprintCache::new(cache_capacity)),
        }
    }

    /// Open the three stores `config` selects for `namespace`.
    pub async fn open(config: &StoresConfig, pool: Option<&SqlitePool>, namespace: &str) -> Result<Self> {
        Ok(Self {
            vector: open_vector_store(config.vector, pool, namespace).await?,
            document: open_document_store(config.document, pool, namespace).await?,
            cache: open_fingerprint_cache(config.cache, pool, namespace, config.cache_capacity)
                .await?,
        })
    }

    /// True when all three stores survive a restart.
    pub fn is_durable(&self) -> bool {
        self.vector.is_durable() && self.document.is_durable() && self.cache.is_durable()
    }

    /// Delete nodes present in only one of the vector and document stores.
    /// Returns how many were dropped.
    pub async fn reconcile(&self, namespace: &str) -> Result<usize> {
        let (vector_ids, document_ids) = futures::try_join!(self.vector.ids(), self.document.ids())?;
        let vectors: HashSet<String> = vector_ids.into_iter().collect();
        let documents: HashSet<String> = document_ids.into_iter().collect();

        let vector_only: Vec<String> = vectors.difference(&documents).cloned().collect();
        let document_only: Vec<String> = documents.difference(&vectors).cloned().collect();
        if vector_only.is_empty() && document_only.is_empty() {
            return Ok(0);
        }
        tracing::warn!(
            namespace,
            vector_only = vector_only.len(),
            document_only = document_only.len(),
            "store memberships differ; dropping unmatched nodes"
        );
        self.document.delete(&document_only).await?;
        self.vector.delete(&vector_only).await?;
        Ok(vector_only.len() + document_only.len())
    }
}

/// One modality's embedding space inside a knowledge base.
#[derive(Clone)]
pub struct ModalitySpace {
    pub modality: Modality,
    pub space_key: String,
    pub namespace: String,
    pub provider: Arc<dyn EmbedProvider>,
    pub stores: StoreSet,
}

impl ModalitySpace {
    pub fn new(kb: &str, provider: Arc<dyn EmbedProvider>, stores: StoreSet) -> Self {
        let space_key = provider.space_key();
        Self {
            modality: provider.modality(),
            namespace: namespace(kb, &space_key),
            space_key,
            provider,
            stores,
        }
    }
}

fn require_pool(pool: Option<&SqlitePool>) -> Result<SqlitePool> {
    pool.cloned()
        .ok_or_else(|| Error::config("sqlite store requested but no database is open"))
}

pub async fn open_vector_store(
    kind: StoreProvider,
    pool: Option<&SqlitePool>,
    namespace: &str,
) -> Result<Arc<dyn VectorStore>> {
    Ok(match kind {
        StoreProvider::Memory => Arc::new(MemoryVectorStore::new()),
        StoreProvider::Sqlite => {
            Arc::new(SqliteVectorStore::open(require_pool(pool)?, namespace).await?)
        }
    })
}

pub async fn open_document_store(
    kind: StoreProvider,
    pool: Option<&SqlitePool>,
    namespace: &str,
) -> Result<Arc<dyn DocumentStore>> {
    Ok(match kind {
        StoreProvider::Memory => Arc::new(MemoryDocumentStore::new()),
        StoreProvider::Sqlite => {
            Arc::new(SqliteDocumentStore::open(require_pool(pool)?, namespace).await?)
        }
    })
}

pub async fn open_fingerprint_cache(
    kind: StoreProvider,
    pool: Option<&SqlitePool>,
    namespace: &str,
    capacity: Option<usize>,
) -> Result<Arc<dyn FingerprintCache>> {
    Ok(match kind {
        StoreProvider::Memory => Arc::new(MemoryFingerprintCache::new(capacity)),
        StoreProvider::Sqlite => Arc::new(
            SqliteFingerprintCache::open(require_pool(pool)?, namespace, capacity).await?,
        ),
    })
}
