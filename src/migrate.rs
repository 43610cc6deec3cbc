//! Per-namespace SQLite schema.
//!
//! Every (knowledge base, embedding space) namespace gets its own tables,
//! named `ns_` plus the sanitized namespace key. The prefix keeps names
//! that start with a digit (a knowledge base called `2024notes`) valid as
//! bare SQL identifiers.
//!
//! | Table | Purpose |
//! |-------|---------|
//! | `ns_{ns}_docs` | document store rows; `seq` is the insertion order |
//! | `ns_{ns}_docs_fts` | FTS5 index over `ns_{ns}_docs.text` |
//! | `ns_{ns}_vectors` | embeddings as little-endian f32 BLOBs |
//! | `ns_{ns}_fingerprints` | fingerprint cache; `last_used` drives LRU eviction |

use ragweave_core::embedding::sanitize_key;
use ragweave_core::Result;
use sqlx::SqlitePool;

use crate::db::db_err;

/// Table names for one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tables {
    pub docs: String,
    pub fts: String,
    pub vectors: String,
    pub fingerprints: String,
}

impl Tables {
    pub fn for_namespace(namespace: &str) -> Self {
        // Interpolated into SQL below: only [A-Za-z0-9_] after a letter.
        let ns = format!("ns_{}", sanitize_key(namespace));
        Self {
            docs: format!("{ns}_docs"),
            fts: format!("{ns}_docs_fts"),
            vectors: format!("{ns}_vectors"),
            fingerprints: format!("{ns}_fingerprints"),
        }
    }
}

/// Create the namespace's tables if they do not exist yet.
pub async fn ensure_namespace(pool: &SqlitePool, namespace: &str) -> Result<Tables> {
    let t = Tables::for_namespace(namespace);

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {docs} (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            modality TEXT NOT NULL,
            source TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{{}}',
            hash TEXT NOT NULL
        )
        "#,
        docs = t.docs
    ))
    .execute(pool)
    .await
    .map_err(db_err)?;

    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_{docs}_source ON {docs}(source)",
        docs = t.docs
    ))
    .execute(pool)
    .await
    .map_err(db_err)?;

    sqlx::query(&format!(
        r#"
        CREATE VIRTUAL TABLE IF NOT EXISTS {fts} USING fts5(
            node_id UNINDEXED,
            text
        )
        "#,
        fts = t.fts
    ))
    .execute(pool)
    .await
    .map_err(db_err)?;

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {vectors} (
            id TEXT PRIMARY KEY,
            modality TEXT NOT NULL,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL
        )
        "#,
        vectors = t.vectors
    ))
    .execute(pool)
    .await
    .map_err(db_err)?;

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {fp} (
            cache_key TEXT PRIMARY KEY,
            node_ids_json TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            last_used INTEGER NOT NULL
        )
        "#,
        fp = t.fingerprints
    ))
    .execute(pool)
    .await
    .map_err(db_err)?;

    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_{fp}_last_used ON {fp}(last_used)",
        fp = t.fingerprints
    ))
    .execute(pool)
    .await
    .map_err(db_err)?;

    Ok(t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_ensure_namespace_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let pool = crate::db::connect(&tmp.path().join("t.sqlite")).await.unwrap();
        let a = ensure_namespace(&pool, "kb__hashing_feature_hash_text").await.unwrap();
        let b = ensure_namespace(&pool, "kb__hashing_feature_hash_text").await.unwrap();
        assert_eq!(a, b);

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE name LIKE 'ns_kb__hashing_feature_hash_text_%'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert!(count >= 4);
    }

    #[test]
    fn test_table_names_are_sanitized() {
        let t = Tables::for_namespace("bad name;drop");
        assert_eq!(t.docs, "ns_bad_name_drop_docs");
    }

    #[tokio::test]
    async fn test_namespace_starting_with_digit() {
        let tmp = TempDir::new().unwrap();
        let pool = crate::db::connect(&tmp.path().join("t.sqlite")).await.unwrap();
        let t = ensure_namespace(&pool, "2024notes__hashing_feature_hash_text")
            .await
            .unwrap();
        assert_eq!(t.vectors, "ns_2024notes__hashing_feature_hash_text_vectors");
        let n: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", t.docs))
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(n, 0);
    }
}
