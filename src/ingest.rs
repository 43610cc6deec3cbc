//! Ingest orchestration.
//!
//! Per source unit:
//!
//! 1. Route to the unit's [`ModalitySpace`]; without one, decompose into
//!    lower modalities (video → frames + audio) and recurse.
//!    Once every part is in, parts left over from an older decomposition
//!    of the same location are removed.
//! 2. Skip when the checkpoint already records this content for the
//!    location (durable namespaces only).
//! 3. Cut nodes (text is chunked; a media unit is one node) with ids
//!    derived from namespace, location, content hash and chunk index.
//! 4. Look up the fingerprint. A hit is verified against both stores; a
//!    stale record is invalidated and handled as a miss. A verified hit
//!    whose nodes belong to another location is copied to this location
//!    without calling the provider.
//! 5. Commit in batches: embed → vector upsert → document upsert, plus
//!    the fingerprint write on the final batch. A failing step rolls the
//!    batch back out of both stores; retryable failures are retried with
//!    exponential backoff. Later batches still run.
//! 6. Once every batch committed, drop nodes of older versions of the
//!    same location and record the checkpoint.
//!
//! Locations are loaded lazily and run concurrently up to
//! `ingest.workers`; batches of one unit run in order, so document-store
//! insertion order follows chunk order.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, Stream, StreamExt};
use futures::FutureExt;
use ragweave_core::chunk::{Chunker, ParagraphChunker};
use ragweave_core::embedding::{check_vectors, EmbedInput};
use ragweave_core::loader::MediaDecomposer;
use ragweave_core::models::{
    is_part_of, Content, DocStoreEntry, FingerprintKey, FingerprintRecord, Modality, Node,
    SourceUnit, VectorRecord,
};
use ragweave_core::{Error, Result};
use serde::Serialize;
use serde_json::Value;

use crate::checkpoint::Checkpoint;
use crate::config::IngestConfig;
use crate::deadline::with_timeout;
use crate::stores::ModalitySpace;

/// What happened to one source unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    Accepted { nodes: usize },
    /// Already ingested (or empty); nothing written.
    Skipped,
}

impl UnitOutcome {
    fn merge(self, other: UnitOutcome) -> UnitOutcome {
        match (self, other) {
            (UnitOutcome::Accepted { nodes: a }, UnitOutcome::Accepted { nodes: b }) => {
                UnitOutcome::Accepted { nodes: a + b }
            }
            (UnitOutcome::Skipped, o) | (o, UnitOutcome::Skipped) => o,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitError {
    pub location: String,
    pub code: &'static str,
    pub message: String,
}

/// Per-unit tally of an ingest call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestReport {
    pub accepted: usize,
    pub skipped: usize,
    pub failed: usize,
    pub nodes_written: usize,
    pub errors: Vec<UnitError>,
}

impl IngestReport {
    pub fn failure(location: impl Into<String>, error: &Error) -> Self {
        let mut report = Self::default();
        report.record_error(location.into(), error);
        report
    }

    fn record(&mut self, location: String, result: Result<UnitOutcome>) {
        match result {
            Ok(UnitOutcome::Accepted { nodes }) => {
                self.accepted += 1;
                self.nodes_written += nodes;
            }
            Ok(UnitOutcome::Skipped) => self.skipped += 1,
            Err(e) => self.record_error(location, &e),
        }
    }

    fn record_error(&mut self, location: String, error: &Error) {
        self.failed += 1;
        self.errors.push(UnitError {
            location,
            code: error.code(),
            message: error.to_string(),
        });
    }

    pub fn merge(&mut self, other: IngestReport) {
        self.accepted += other.accepted;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.nodes_written += other.nodes_written;
        self.errors.extend(other.errors);
    }

    pub fn total(&self) -> usize {
        self.accepted + self.skipped + self.failed
    }
}

/// Where a node's vector comes from.
#[derive(Debug, Clone)]
enum Payload {
    Embed(EmbedInput),
    /// Copied from the identical node of another location.
    Reuse(Vec<f32>),
}

type Pending = (Node, Payload);

pub struct Orchestrator {
    kb: String,
    spaces: BTreeMap<Modality, ModalitySpace>,
    settings: IngestConfig,
    chunker: Arc<dyn Chunker>,
    decomposer: Option<Arc<dyn MediaDecomposer>>,
    checkpoint: Option<Arc<Checkpoint>>,
}

impl Orchestrator {
    pub fn new(
        kb: impl Into<String>,
        spaces: impl IntoIterator<Item = ModalitySpace>,
        settings: IngestConfig,
    ) -> Self {
        Self {
            kb: kb.into(),
            spaces: spaces.into_iter().map(|s| (s.modality, s)).collect(),
            settings,
            chunker: Arc::new(ParagraphChunker),
            decomposer: None,
            checkpoint: None,
        }
    }

    pub fn with_chunker(mut self, chunker: Arc<dyn Chunker>) -> Self {
        self.chunker = chunker;
        self
    }

    /// Enables modality fallback through `decomposer`.
    pub fn with_decomposer(mut self, decomposer: Arc<dyn MediaDecomposer>) -> Self {
        self.decomposer = Some(decomposer);
        self
    }

    pub fn with_checkpoint(mut self, checkpoint: Arc<Checkpoint>) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    pub fn space(&self, modality: Modality) -> Option<&ModalitySpace> {
        self.spaces.get(&modality)
    }

    pub fn spaces(&self) -> impl Iterator<Item = &ModalitySpace> {
        self.spaces.values()
    }

    pub async fn ingest(&self, unit: SourceUnit) -> IngestReport {
        let mut report = IngestReport::default();
        let location = unit.location.clone();
        report.record(location, self.ingest_unit(unit).await);
        report
    }

    /// Ingest every unit of `units`, at most `ingest.workers` at a time.
    pub async fn ingest_stream<S>(&self, units: S) -> IngestReport
    where
        S: Stream<Item = SourceUnit> + Send,
    {
        self.ingest_lazy(units.map(|unit| {
            let location = unit.location.clone();
            (location, futures::future::ready(Ok(vec![unit])))
        }))
        .await
    }

    /// Ingest lazily loaded locations. Each item pairs a location with the
    /// future that loads its units; a load only starts once one of the
    /// `ingest.workers` slots is free, so at most that many locations are
    /// held in memory. A failed load is reported as one failed unit.
    pub async fn ingest_lazy<S, F>(&self, pending: S) -> IngestReport
    where
        S: Stream<Item = (String, F)> + Send,
        F: Future<Output = Result<Vec<SourceUnit>>> + Send,
    {
        let report = pending
            .map(|(location, load)| async move {
                let mut report = IngestReport::default();
                match load.await {
                    Ok(units) => {
                        for unit in units {
                            let location = unit.location.clone();
                            report.record(location, self.ingest_unit(unit).await);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(location = %location, code = e.code(), error = %e, "load failed");
                        report.record_error(location, &e);
                    }
                }
                report
            })
            .buffer_unordered(self.settings.workers.max(1))
            .fold(IngestReport::default(), |mut report, other| async move {
                report.merge(other);
                report
            })
            .await;

        tracing::info!(
            kb = %self.kb,
            accepted = report.accepted,
            skipped = report.skipped,
            failed = report.failed,
            nodes = report.nodes_written,
            "ingest finished"
        );
        report
    }

    pub async fn ingest_units(&self, units: Vec<SourceUnit>) -> IngestReport {
        self.ingest_stream(stream::iter(units)).await
    }

    /// Remove every node cut from `location`, or from a part decomposed out
    /// of it, in every space. Returns the number of nodes removed.
    pub async fn delete_source(&self, location: &str) -> Result<usize> {
        let mut removed = 0;
        for space in self.spaces.values() {
            let entries = self
                .bounded("document lookup", space.stores.document.entries_for_source(location))
                .await?;
            if !entries.is_empty() {
                removed += self.remove_entries(space, &entries).await?;
            }
            if let Some(cp) = self.checkpoint_for(space) {
                cp.forget(&space.namespace, location).await?;
            }
        }
        tracing::info!(kb = %self.kb, location, removed, "deleted source");
        Ok(removed)
    }

    fn checkpoint_for(&self, space: &ModalitySpace) -> Option<&Arc<Checkpoint>> {
        self.checkpoint
            .as_ref()
            .filter(|_| space.stores.is_durable())
    }

    async fn bounded<T>(&self, operation: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        with_timeout(
            operation,
            Duration::from_secs(self.settings.timeout_secs),
            fut,
        )
        .await
    }

    fn ingest_unit(&self, unit: SourceUnit) -> BoxFuture<'_, Result<UnitOutcome>> {
        async move {
            if let Some(space) = self.spaces.get(&unit.modality) {
                return self.ingest_into(space, &unit).await;
            }

            let decomposer = match &self.decomposer {
                Some(d) if !unit.modality.fallback().is_empty() => d,
                _ => {
                    return Err(Error::invalid_request(format!(
                        "no embedding provider configured for {} units",
                        unit.modality
                    )))
                }
            };

            let parts: Vec<SourceUnit> = decomposer
                .decompose(&unit)
                .await?
                .into_iter()
                .filter(|p| {
                    let routable =
                        self.spaces.contains_key(&p.modality) || !p.modality.fallback().is_empty();
                    if !routable {
                        tracing::debug!(location = %p.location, modality = %p.modality, "dropping part without a provider");
                    }
                    routable
                })
                .collect();
            if parts.is_empty() {
                return Err(Error::invalid_request(format!(
                    "{} yields no parts in a configured modality",
                    unit.location
                )));
            }
            tracing::info!(location = %unit.location, parts = parts.len(), "ingesting decomposed unit");

            let current: BTreeSet<String> = parts.iter().map(|p| p.location.clone()).collect();
            let mut outcome = UnitOutcome::Skipped;
            let mut first_err = None;
            for part in parts {
                let part_location = part.location.clone();
                match self.ingest_unit(part).await {
                    Ok(o) => outcome = outcome.merge(o),
                    Err(e) => {
                        tracing::warn!(location = %part_location, error = %e, "part failed");
                        first_err.get_or_insert(e);
                    }
                }
            }
            if let Some(e) = first_err {
                return Err(e);
            }
            if let Err(e) = self.prune_parts(&unit.location, &current).await {
                tracing::warn!(location = %unit.location, error = %e, "failed to remove older parts");
            }
            Ok(outcome)
        }
        .boxed()
    }

    /// Drop parts of `base` that the latest decomposition no longer yields.
    async fn prune_parts(&self, base: &str, current: &BTreeSet<String>) -> Result<()> {
        for space in self.spaces.values() {
            let stale: Vec<DocStoreEntry> = self
                .bounded("document lookup", space.stores.document.entries_for_source(base))
                .await?
                .into_iter()
                .filter(|e| e.source != base && !current.iter().any(|c| is_part_of(&e.source, c)))
                .collect();
            if stale.is_empty() {
                continue;
            }
            let sources: BTreeSet<String> = stale.iter().map(|e| e.source.clone()).collect();
            let removed = self.remove_entries(space, &stale).await?;
            if let Some(cp) = self.checkpoint_for(space) {
                for source in &sources {
                    cp.forget(&space.namespace, source).await?;
                }
            }
            tracing::info!(location = base, parts = sources.len(), removed, "removed stale parts");
        }
        Ok(())
    }

    async fn ingest_into(&self, space: &ModalitySpace, unit: &SourceUnit) -> Result<UnitOutcome> {
        let hash = unit.content_hash();
        let checkpoint = self.checkpoint_for(space);

        if let Some(cp) = checkpoint {
            if cp.contains(&space.namespace, &unit.location, &hash).await {
                tracing::debug!(location = %unit.location, "unchanged since checkpoint");
                return Ok(UnitOutcome::Skipped);
            }
        }

        let mut nodes = self.build_nodes(space, unit, &hash);
        if nodes.is_empty() {
            tracing::debug!(location = %unit.location, "no content to ingest");
            if let Err(e) = self.replace_stale(space, &unit.location, &hash).await {
                tracing::warn!(location = %unit.location, error = %e, "failed to remove older version");
            }
            return Ok(UnitOutcome::Skipped);
        }
        let node_ids: Vec<String> = nodes.iter().map(|(n, _)| n.id.clone()).collect();

        let key = FingerprintKey::new(&self.kb, space.modality, &space.space_key, &hash);
        let mut copied = false;
        if let Some(record) = self
            .bounded("cache lookup", space.stores.cache.lookup(&key))
            .await?
        {
            match self.verify(space, &key, &record).await {
                Ok(()) => {
                    if record.node_ids == node_ids || self.missing(space, &node_ids).await? == 0 {
                        tracing::debug!(location = %unit.location, key = %key, "fingerprint hit");
                        if let Some(cp) = checkpoint {
                            cp.record(&space.namespace, &unit.location, &hash).await?;
                        }
                        return Ok(UnitOutcome::Skipped);
                    }
                    copied = self.reuse_vectors(space, &record, &mut nodes).await?;
                    if copied {
                        tracing::debug!(location = %unit.location, key = %key, "copying nodes of identical content");
                    }
                }
                Err(e @ Error::CacheInconsistency { .. }) => {
                    tracing::warn!(location = %unit.location, error = %e, "re-embedding");
                    self.bounded("cache invalidate", space.stores.cache.invalidate(&key))
                        .await?;
                }
                Err(e) => return Err(e),
            }
        }

        let batches: Vec<&[Pending]> = nodes.chunks(self.settings.batch_size.max(1)).collect();
        let last = batches.len() - 1;
        let mut first_err: Option<Error> = None;

        for (i, batch) in batches.into_iter().enumerate() {
            // The fingerprint rides on the final batch, and only if nothing failed before it.
            // Copies leave the fingerprint with the location that embedded the content.
            let fingerprint = (i == last && first_err.is_none() && !copied)
                .then_some((&key, node_ids.as_slice()));
            if let Err(e) = self.commit_with_retry(space, batch, fingerprint).await {
                tracing::warn!(
                    location = %unit.location,
                    batch = i,
                    code = e.code(),
                    error = %e,
                    "batch failed"
                );
                first_err.get_or_insert(e);
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }

        if let Err(e) = self.replace_stale(space, &unit.location, &hash).await {
            tracing::warn!(location = %unit.location, error = %e, "failed to remove older version");
        }
        if let Some(cp) = checkpoint {
            cp.record(&space.namespace, &unit.location, &hash).await?;
        }

        tracing::info!(
            location = %unit.location,
            modality = %space.modality,
            nodes = node_ids.len(),
            "ingested"
        );
        Ok(UnitOutcome::Accepted {
            nodes: node_ids.len(),
        })
    }

    async fn verify(
        &self,
        space: &ModalitySpace,
        key: &FingerprintKey,
        record: &FingerprintRecord,
    ) -> Result<()> {
        let missing = self.missing(space, &record.node_ids).await?;
        if missing > 0 {
            return Err(Error::CacheInconsistency {
                key: key.cache_key(),
                missing,
            });
        }
        Ok(())
    }

    /// How many of `ids` are absent from either store.
    async fn missing(&self, space: &ModalitySpace, ids: &[String]) -> Result<usize> {
        let (in_vectors, in_documents) = futures::try_join!(
            self.bounded("vector lookup", space.stores.vector.existing(ids)),
            self.bounded("document lookup", space.stores.document.existing(ids)),
        )?;
        Ok(ids
            .iter()
            .filter(|id| !in_vectors.contains(*id) || !in_documents.contains(*id))
            .count())
    }

    /// Point every node at the stored vector of its counterpart in
    /// `record`. Returns false when the shapes differ (chunking settings
    /// changed since), leaving the nodes to be embedded.
    async fn reuse_vectors(
        &self,
        space: &ModalitySpace,
        record: &FingerprintRecord,
        nodes: &mut [Pending],
    ) -> Result<bool> {
        if record.node_ids.len() != nodes.len() {
            return Ok(false);
        }
        let records = self
            .bounded("vector lookup", space.stores.vector.get(&record.node_ids))
            .await?;
        if records.len() != nodes.len() {
            return Ok(false);
        }
        for ((_, payload), stored) in nodes.iter_mut().zip(records) {
            *payload = Payload::Reuse(stored.vector);
        }
        Ok(true)
    }

    fn build_nodes(&self, space: &ModalitySpace, unit: &SourceUnit, hash: &str) -> Vec<Pending> {
        let node = |chunk_index: usize, text: String| Node {
            id: Node::derive_id(&space.namespace, &unit.location, hash, chunk_index),
            modality: unit.modality,
            source: unit.location.clone(),
            chunk_index,
            text,
            metadata: Value::Object(unit.metadata.clone()),
            content_hash: hash.to_string(),
        };

        match (&unit.content, unit.modality) {
            (content, Modality::Text) => self
                .chunker
                .split(
                    &content.to_text(),
                    self.settings.chunk_size,
                    self.settings.chunk_overlap,
                )
                .into_iter()
                .enumerate()
                .map(|(i, text)| (node(i, text.clone()), Payload::Embed(EmbedInput::Text(text))))
                .collect(),
            (content, modality) => {
                let bytes = match content {
                    Content::Bytes(b) => b.clone(),
                    Content::Text(t) => t.clone().into_bytes(),
                };
                if bytes.is_empty() {
                    return Vec::new();
                }
                let label = unit
                    .metadata
                    .get("file_name")
                    .and_then(|v| v.as_str())
                    .unwrap_or(&unit.location)
                    .to_string();
                vec![(
                    node(0, label),
                    Payload::Embed(EmbedInput::Media { modality, bytes }),
                )]
            }
        }
    }

    async fn commit_with_retry(
        &self,
        space: &ModalitySpace,
        batch: &[Pending],
        fingerprint: Option<(&FingerprintKey, &[String])>,
    ) -> Result<()> {
        let mut attempt: u32 = 0;
        loop {
            match self.commit_batch(space, batch, fingerprint).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < self.settings.max_retries => {
                    let delay = Duration::from_millis(
                        self.settings
                            .retry_backoff_ms
                            .saturating_mul(1u64 << attempt.min(16)),
                    );
                    tracing::warn!(
                        namespace = %space.namespace,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying batch"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn commit_batch(
        &self,
        space: &ModalitySpace,
        batch: &[Pending],
        fingerprint: Option<(&FingerprintKey, &[String])>,
    ) -> Result<()> {
        let inputs: Vec<EmbedInput> = batch
            .iter()
            .filter_map(|(_, payload)| match payload {
                Payload::Embed(input) => Some(input.clone()),
                Payload::Reuse(_) => None,
            })
            .collect();
        let mut embedded = if inputs.is_empty() {
            Vec::new()
        } else {
            let vectors = self
                .bounded("embed", space.provider.embed(&inputs))
                .await?;
            check_vectors(space.provider.as_ref(), inputs.len(), &vectors)?;
            vectors
        }
        .into_iter();

        let ids: Vec<String> = batch.iter().map(|(n, _)| n.id.clone()).collect();
        let records: Vec<VectorRecord> = batch
            .iter()
            .map(|(n, payload)| VectorRecord {
                id: n.id.clone(),
                modality: n.modality,
                vector: match payload {
                    Payload::Reuse(vector) => vector.clone(),
                    Payload::Embed(_) => embedded.next().unwrap_or_default(),
                },
            })
            .collect();
        let entries: Vec<DocStoreEntry> = batch.iter().map(|(n, _)| n.to_entry()).collect();

        let stores = &space.stores;
        let committed = async {
            self.bounded("vector upsert", stores.vector.upsert(&records)).await?;
            self.bounded("document upsert", stores.document.upsert(&entries)).await?;
            if let Some((key, node_ids)) = fingerprint {
                self.bounded("cache write", stores.cache.put(key, node_ids)).await?;
            }
            Ok::<(), Error>(())
        }
        .await;

        if let Err(e) = committed {
            self.rollback(space, &ids).await;
            return Err(e);
        }
        Ok(())
    }

    async fn rollback(&self, space: &ModalitySpace, ids: &[String]) {
        tracing::warn!(namespace = %space.namespace, nodes = ids.len(), "rolling back batch");
        if let Err(e) = self.bounded("document rollback", space.stores.document.delete(ids)).await {
            tracing::error!(namespace = %space.namespace, error = %e, "document rollback failed");
        }
        if let Err(e) = self.bounded("vector rollback", space.stores.vector.delete(ids)).await {
            tracing::error!(namespace = %space.namespace, error = %e, "vector rollback failed");
        }
    }

    /// Drop nodes of `location` whose content hash is not `current`. Parts
    /// decomposed from `location` are left to [`Self::prune_parts`].
    async fn replace_stale(&self, space: &ModalitySpace, location: &str, current: &str) -> Result<()> {
        let stale: Vec<DocStoreEntry> = self
            .bounded("document lookup", space.stores.document.entries_for_source(location))
            .await?
            .into_iter()
            .filter(|e| e.source == location && e.hash != current)
            .collect();
        if stale.is_empty() {
            return Ok(());
        }
        let removed = self.remove_entries(space, &stale).await?;
        tracing::info!(location, removed, "replaced older version");
        Ok(())
    }

    async fn remove_entries(&self, space: &ModalitySpace, entries: &[DocStoreEntry]) -> Result<usize> {
        let ids: Vec<String> = entries.iter().map(|e| e.id.clone()).collect();
        let doomed: HashSet<&str> = ids.iter().map(String::as_str).collect();

        // Fingerprints go first so no cache hit can outlive its nodes. A
        // fingerprint held by another location with the same content stays.
        let hashes: BTreeSet<&str> = entries.iter().map(|e| e.hash.as_str()).collect();
        for hash in hashes {
            let key = FingerprintKey::new(&self.kb, space.modality, &space.space_key, hash);
            let owned = self
                .bounded("cache lookup", space.stores.cache.lookup(&key))
                .await?
                .is_some_and(|r| r.node_ids.iter().any(|id| doomed.contains(id.as_str())));
            if owned {
                self.bounded("cache invalidate", space.stores.cache.invalidate(&key))
                    .await?;
            }
        }

        self.bounded("document delete", space.stores.document.delete(&ids))
            .await?;
        self.bounded("vector delete", space.stores.vector.delete(&ids))
            .await?;
        Ok(ids.len())
    }
}
