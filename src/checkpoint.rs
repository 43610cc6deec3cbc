//! Ingest checkpoint: which source versions each namespace already holds.
//!
//! Stored as `<workspace>/<kb>/checkpoint.json`:
//!
//! ```json
//! { "namespaces": { "docs__hashing_feature_hash_text": { "/data/a.md": "9f86d0…" } } }
//! ```
//!
//! A unit whose `(namespace, location, content hash)` is recorded is
//! skipped before any store is touched. Only namespaces whose three stores
//! are durable are checkpointed; a namespace whose stores come up empty is
//! cleared so a lost database never masks re-ingestion.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use ragweave_core::models::is_part_of;
use ragweave_core::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

pub const CHECKPOINT_FILE: &str = "checkpoint.json";

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
struct Manifest {
    #[serde(default)]
    namespaces: BTreeMap<String, BTreeMap<String, String>>,
}

pub struct Checkpoint {
    path: PathBuf,
    manifest: Mutex<Manifest>,
}

impl Checkpoint {
    /// Load the checkpoint at `path`; a missing or unreadable file starts empty.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let manifest = match tokio::fs::read_to_string(&path).await {
            Ok(body) => serde_json::from_str(&body).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "ignoring corrupt checkpoint");
                Manifest::default()
            }),
            Err(_) => Manifest::default(),
        };
        Self {
            path,
            manifest: Mutex::new(manifest),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn contains(&self, namespace: &str, location: &str, hash: &str) -> bool {
        let manifest = self.manifest.lock().await;
        manifest
            .namespaces
            .get(namespace)
            .and_then(|m| m.get(location))
            .is_some_and(|h| h == hash)
    }

    pub async fn record(&self, namespace: &str, location: &str, hash: &str) -> Result<()> {
        let mut manifest = self.manifest.lock().await;
        manifest
            .namespaces
            .entry(namespace.to_string())
            .or_default()
            .insert(location.to_string(), hash.to_string());
        self.save(&manifest).await
    }

    /// Drop `location` and every part decomposed from it.
    pub async fn forget(&self, namespace: &str, location: &str) -> Result<()> {
        let mut manifest = self.manifest.lock().await;
        let removed = match manifest.namespaces.get_mut(namespace) {
            Some(m) => {
                let before = m.len();
                m.retain(|source, _| !is_part_of(source, location));
                m.len() != before
            }
            None => false,
        };
        if removed {
            self.save(&manifest).await?;
        }
        Ok(())
    }

    pub async fn clear_namespace(&self, namespace: &str) -> Result<()> {
        let mut manifest = self.manifest.lock().await;
        if manifest.namespaces.remove(namespace).is_some() {
            tracing::info!(namespace, "cleared checkpoint for empty namespace");
            self.save(&manifest).await?;
        }
        Ok(())
    }

    async fn save(&self, manifest: &Manifest) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(manifest)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
