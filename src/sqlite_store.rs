//! SQLite-backed store implementations.
//!
//! All three stores share one [`SqlitePool`] per knowledge base and keep
//! their rows in per-namespace tables (see [`crate::migrate`]). Every
//! multi-row write runs in a single transaction, so a failed upsert
//! leaves nothing behind.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ragweave_core::bm25::tokenize;
use ragweave_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use ragweave_core::models::{
    DocStoreEntry, FingerprintKey, FingerprintRecord, Modality, ScoredId, VectorRecord,
    PART_SEPARATOR,
};
use ragweave_core::store::{DocumentStore, FingerprintCache, VectorStore};
use ragweave_core::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::db::db_err;
use crate::migrate::{ensure_namespace, Tables};

const BACKEND: &str = "sqlite";
/// Stay well under SQLite's bound-parameter limit.
const IN_CLAUSE_CHUNK: usize = 500;

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Build an FTS5 MATCH expression that ORs every query token as a quoted
/// phrase, so user punctuation never reaches the FTS5 query parser.
pub fn fts_match_expr(query: &str) -> Option<String> {
    let mut tokens = tokenize(query);
    tokens.sort();
    tokens.dedup();
    if tokens.is_empty() {
        return None;
    }
    Some(
        tokens
            .iter()
            .map(|t| format!("\"{}\"", t.replace('"', "")))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

async fn existing_ids(pool: &SqlitePool, table: &str, ids: &[String]) -> Result<HashSet<String>> {
    let mut found = HashSet::new();
    for chunk in ids.chunks(IN_CLAUSE_CHUNK) {
        let sql = format!(
            "SELECT id FROM {table} WHERE id IN ({})",
            placeholders(chunk.len())
        );
        let mut q = sqlx::query_scalar::<_, String>(&sql);
        for id in chunk {
            q = q.bind(id);
        }
        found.extend(q.fetch_all(pool).await.map_err(db_err)?);
    }
    Ok(found)
}

async fn all_ids(pool: &SqlitePool, table: &str) -> Result<Vec<String>> {
    sqlx::query_scalar::<_, String>(&format!("SELECT id FROM {table}"))
        .fetch_all(pool)
        .await
        .map_err(db_err)
}

// ============ Vector store ============

pub struct SqliteVectorStore {
    pool: SqlitePool,
    tables: Tables,
}

impl SqliteVectorStore {
    pub async fn open(pool: SqlitePool, namespace: &str) -> Result<Self> {
        let tables = ensure_namespace(&pool, namespace).await?;
        Ok(Self { pool, tables })
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    fn backend(&self) -> &str {
        BACKEND
    }

    fn is_durable(&self) -> bool {
        true
    }

    async fn upsert(&self, records: &[VectorRecord]) -> Result<()> {
        let sql = format!(
            r#"
            INSERT INTO {} (id, modality, dims, embedding)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                modality = excluded.modality,
                dims = excluded.dims,
                embedding = excluded.embedding
            "#,
            self.tables.vectors
        );
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for r in records {
            sqlx::query(&sql)
                .bind(&r.id)
                .bind(r.modality.as_str())
                .bind(r.vector.len() as i64)
                .bind(vec_to_blob(&r.vector))
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for chunk in ids.chunks(IN_CLAUSE_CHUNK) {
            let sql = format!(
                "DELETE FROM {} WHERE id IN ({})",
                self.tables.vectors,
                placeholders(chunk.len())
            );
            let mut q = sqlx::query(&sql);
            for id in chunk {
                q = q.bind(id);
            }
            q.execute(&mut *tx).await.map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)
    }

    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredId>> {
        let rows = sqlx::query(&format!("SELECT id, embedding FROM {}", self.tables.vectors))
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        let mut hits: Vec<ScoredId> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let similarity = cosine_similarity(query, &blob_to_vec(&blob)) as f64;
                ScoredId::new(row.get::<String, _>("id"), similarity)
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    async fn existing(&self, ids: &[String]) -> Result<HashSet<String>> {
        existing_ids(&self.pool, &self.tables.vectors, ids).await
    }

    async fn get(&self, ids: &[String]) -> Result<Vec<VectorRecord>> {
        let mut found = std::collections::HashMap::new();
        for chunk in ids.chunks(IN_CLAUSE_CHUNK) {
            let sql = format!(
                "SELECT id, modality, embedding FROM {} WHERE id IN ({})",
                self.tables.vectors,
                placeholders(chunk.len())
            );
            let mut q = sqlx::query(&sql);
            for id in chunk {
                q = q.bind(id);
            }
            for row in q.fetch_all(&self.pool).await.map_err(db_err)? {
                let id: String = row.get("id");
                let modality: String = row.get("modality");
                let blob: Vec<u8> = row.get("embedding");
                let record = VectorRecord {
                    id: id.clone(),
                    modality: modality
                        .parse::<Modality>()
                        .map_err(|e| Error::store(BACKEND, e))?,
                    vector: blob_to_vec(&blob),
                };
                found.insert(id, record);
            }
        }
        Ok(ids.iter().filter_map(|id| found.remove(id)).collect())
    }

    async fn ids(&self) -> Result<Vec<String>> {
        all_ids(&self.pool, &self.tables.vectors).await
    }

    async fn len(&self) -> Result<usize> {
        let n: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", self.tables.vectors))
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(n as usize)
    }
}

// ============ Document store ============

pub struct SqliteDocumentStore {
    pool: SqlitePool,
    tables: Tables,
}

impl SqliteDocumentStore {
    pub async fn open(pool: SqlitePool, namespace: &str) -> Result<Self> {
        let tables = ensure_namespace(&pool, namespace).await?;
        Ok(Self { pool, tables })
    }

    fn select_columns(&self) -> String {
        format!(
            "SELECT id, modality, source, chunk_index, text, metadata_json, hash FROM {}",
            self.tables.docs
        )
    }
}

fn row_to_entry(row: &SqliteRow) -> Result<DocStoreEntry> {
    let modality: String = row.get("modality");
    let metadata_json: String = row.get("metadata_json");
    let chunk_index: i64 = row.get("chunk_index");
    let id: String = row.get("id");
    let metadata = serde_json::from_str(&metadata_json).map_err(|e| {
        Error::store(BACKEND, format!("corrupt metadata for node {id}: {e}"))
    })?;
    Ok(DocStoreEntry {
        id,
        modality: modality
            .parse::<Modality>()
            .map_err(|e| Error::store(BACKEND, e))?,
        source: row.get("source"),
        chunk_index: chunk_index as usize,
        text: row.get("text"),
        metadata,
        hash: row.get("hash"),
    })
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    fn backend(&self) -> &str {
        BACKEND
    }

    fn is_durable(&self) -> bool {
        true
    }

    async fn upsert(&self, entries: &[DocStoreEntry]) -> Result<()> {
        let upsert_sql = format!(
            r#"
            INSERT INTO {} (id, modality, source, chunk_index, text, metadata_json, hash)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                modality = excluded.modality,
                source = excluded.source,
                chunk_index = excluded.chunk_index,
                text = excluded.text,
                metadata_json = excluded.metadata_json,
                hash = excluded.hash
            "#,
            self.tables.docs
        );
        let fts_delete = format!("DELETE FROM {} WHERE node_id = ?", self.tables.fts);
        let fts_insert = format!("INSERT INTO {} (node_id, text) VALUES (?, ?)", self.tables.fts);

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for e in entries {
            sqlx::query(&upsert_sql)
                .bind(&e.id)
                .bind(e.modality.as_str())
                .bind(&e.source)
                .bind(e.chunk_index as i64)
                .bind(&e.text)
                .bind(e.metadata.to_string())
                .bind(&e.hash)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;

            sqlx::query(&fts_delete)
                .bind(&e.id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            sqlx::query(&fts_insert)
                .bind(&e.id)
                .bind(&e.text)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)
    }

    async fn get(&self, id: &str) -> Result<Option<DocStoreEntry>> {
        let row = sqlx::query(&format!("{} WHERE id = ?", self.select_columns()))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_entry).transpose()
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for chunk in ids.chunks(IN_CLAUSE_CHUNK) {
            let marks = placeholders(chunk.len());
            for sql in [
                format!("DELETE FROM {} WHERE node_id IN ({marks})", self.tables.fts),
                format!("DELETE FROM {} WHERE id IN ({marks})", self.tables.docs),
            ] {
                let mut q = sqlx::query(&sql);
                for id in chunk {
                    q = q.bind(id);
                }
                q.execute(&mut *tx).await.map_err(db_err)?;
            }
        }
        tx.commit().await.map_err(db_err)
    }

    async fn lexical_search(&self, query: &str, k: usize) -> Result<Vec<ScoredId>> {
        let Some(expr) = fts_match_expr(query) else {
            return Ok(Vec::new());
        };
        let sql = format!(
            r#"
            SELECT {fts}.node_id AS id, bm25({fts}) AS score
            FROM {fts}
            JOIN {docs} d ON d.id = {fts}.node_id
            WHERE {fts} MATCH ?
            ORDER BY score ASC, d.seq ASC
            LIMIT ?
            "#,
            fts = self.tables.fts,
            docs = self.tables.docs
        );
        let rows = sqlx::query(&sql)
            .bind(expr)
            .bind(k as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        // FTS5 bm25() is negative; more negative is more relevant.
        Ok(rows
            .iter()
            .map(|row| {
                let score: f64 = row.get("score");
                ScoredId::new(row.get::<String, _>("id"), -score)
            })
            .collect())
    }

    async fn existing(&self, ids: &[String]) -> Result<HashSet<String>> {
        existing_ids(&self.pool, &self.tables.docs, ids).await
    }

    async fn entries_for_source(&self, source: &str) -> Result<Vec<DocStoreEntry>> {
        // Parts sort in [`source#`, `source$`), which keeps the source index usable.
        let part_start = format!("{source}{PART_SEPARATOR}");
        let part_end = format!("{source}{}", char::from(PART_SEPARATOR as u8 + 1));
        let rows = sqlx::query(&format!(
            "{} WHERE source = ? OR (source >= ? AND source < ?) ORDER BY seq ASC",
            self.select_columns()
        ))
        .bind(source)
        .bind(part_start)
        .bind(part_end)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_entry).collect()
    }

    async fn ids(&self) -> Result<Vec<String>> {
        all_ids(&self.pool, &self.tables.docs).await
    }

    async fn len(&self) -> Result<usize> {
        let n: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", self.tables.docs))
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(n as usize)
    }
}

// ============ Fingerprint cache ============

/// Fingerprint cache with optional LRU bound. Recency is a monotonically
/// increasing `last_used` counter bumped on every lookup hit and write.
pub struct SqliteFingerprintCache {
    pool: SqlitePool,
    tables: Tables,
    capacity: Option<usize>,
}

impl SqliteFingerprintCache {
    pub async fn open(pool: SqlitePool, namespace: &str, capacity: Option<usize>) -> Result<Self> {
        let tables = ensure_namespace(&pool, namespace).await?;
        Ok(Self {
            pool,
            tables,
            capacity,
        })
    }
}

#[async_trait]
impl FingerprintCache for SqliteFingerprintCache {
    fn backend(&self) -> &str {
        BACKEND
    }

    fn is_durable(&self) -> bool {
        true
    }

    async fn lookup(&self, key: &FingerprintKey) -> Result<Option<FingerprintRecord>> {
        let fp = &self.tables.fingerprints;
        let row = sqlx::query(&format!(
            "SELECT node_ids_json, created_at FROM {fp} WHERE cache_key = ?"
        ))
        .bind(key.cache_key())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            return Ok(None);
        };

        sqlx::query(&format!(
            "UPDATE {fp} SET last_used = (SELECT COALESCE(MAX(last_used), 0) + 1 FROM {fp}) WHERE cache_key = ?"
        ))
        .bind(key.cache_key())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let node_ids_json: String = row.get("node_ids_json");
        let created_at: i64 = row.get("created_at");
        let node_ids: Vec<String> =
            serde_json::from_str(&node_ids_json).map_err(|e| Error::store(BACKEND, e))?;
        Ok(Some(FingerprintRecord {
            node_ids,
            created_at: DateTime::from_timestamp(created_at, 0).unwrap_or_else(Utc::now),
        }))
    }

    async fn put(&self, key: &FingerprintKey, node_ids: &[String]) -> Result<()> {
        let fp = &self.tables.fingerprints;
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(&format!(
            r#"
            INSERT INTO {fp} (cache_key, node_ids_json, created_at, last_used)
            VALUES (?, ?, ?, (SELECT COALESCE(MAX(last_used), 0) + 1 FROM {fp}))
            ON CONFLICT(cache_key) DO UPDATE SET
                node_ids_json = excluded.node_ids_json,
                created_at = excluded.created_at,
                last_used = excluded.last_used
            "#
        ))
        .bind(key.cache_key())
        .bind(serde_json::to_string(node_ids)?)
        .bind(Utc::now().timestamp())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if let Some(cap) = self.capacity {
            let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {fp}"))
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err)?;
            let excess = count - cap as i64;
            if excess > 0 {
                sqlx::query(&format!(
                    "DELETE FROM {fp} WHERE cache_key IN (SELECT cache_key FROM {fp} ORDER BY last_used ASC LIMIT ?)"
                ))
                .bind(excess)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
                tracing::debug!(evicted = excess, "evicted fingerprints");
            }
        }

        tx.commit().await.map_err(db_err)
    }

    async fn invalidate(&self, key: &FingerprintKey) -> Result<bool> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE cache_key = ?",
            self.tables.fingerprints
        ))
        .bind(key.cache_key())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn len(&self) -> Result<usize> {
        let n: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {}",
            self.tables.fingerprints
        ))
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(n as usize)
    }
}
