//! Process-wide runtime: the active configuration and everything built
//! from it.
//!
//! A [`Runtime`] holds one immutable [`RuntimeState`] behind an
//! `Arc`. Every operation clones the current `Arc` at its start and runs
//! against that snapshot to completion, so a concurrent [`Runtime::rebuild`]
//! never changes the providers or stores under an in-flight call.
//!
//! # Rebuild
//!
//! 1. Validate the new configuration; on failure the old state stays.
//! 2. Build the new state, reusing from the current one whatever is
//!    unchanged: the SQLite pool (same `<workspace>/<kb>`), each
//!    modality's embedding provider (equal `[embedding.<m>]`), the
//!    checkpoint and the reranker. A namespace's vector and document
//!    stores are reused together or not at all: any backend change opens
//!    a fresh pair, which is reconciled so both hold the same nodes. The
//!    fingerprint cache is only kept alongside a reused pair.
//! 3. Swap the `Arc` under a short write lock.
//!
//! Rebuilds are serialized by an async mutex; construction happens
//! outside the state lock.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use futures::stream::{self, Stream, StreamExt};
use ragweave_core::embedding::{namespace, EmbedProvider};
use ragweave_core::loader::SourceLoader;
use ragweave_core::models::{
    Modality, ModalityPair, QueryInput, RetrievalHit, RetrievalMode, SourceUnit,
};
use ragweave_core::rerank::Reranker;
use ragweave_core::{Error, Result};
use sqlx::SqlitePool;
use tokio::sync::Mutex;

use crate::checkpoint::{Checkpoint, CHECKPOINT_FILE};
use crate::config::{load_config, Config, EmbeddingConfig};
use crate::db;
use crate::embedding::create_provider;
use crate::ingest::{IngestReport, Orchestrator};
use crate::loader::{read_list, FileLoader, UrlLoader};
use crate::logging;
use crate::media::FfmpegDecomposer;
use crate::rerank::create_reranker;
use crate::retrieve::QueryEngine;
use crate::stores::{open_fingerprint_cache, ModalitySpace, StoreSet};

/// Everything built from one validated configuration.
pub struct RuntimeState {
    config: Config,
    kb_dir: PathBuf,
    pool: Option<SqlitePool>,
    providers: BTreeMap<Modality, (EmbeddingConfig, Arc<dyn EmbedProvider>)>,
    reranker: Option<Arc<dyn Reranker>>,
    checkpoint: Arc<Checkpoint>,
    orchestrator: Orchestrator,
    engine: QueryEngine,
    file_loader: FileLoader,
    url_loader: UrlLoader,
}

impl RuntimeState {
    async fn build(config: Config, previous: Option<&RuntimeState>) -> Result<Self> {
        config.validate()?;

        let kb = config.general.knowledge_base.clone();
        let kb_dir = config.general.kb_dir();
        let home = previous.filter(|p| p.kb_dir == kb_dir);

        let pool = if config.stores.uses_sqlite() {
            match home.and_then(|p| p.pool.clone()) {
                Some(pool) => Some(pool),
                None => Some(db::connect(&kb_dir.join(db::DB_FILE)).await?),
            }
        } else {
            None
        };

        let checkpoint = match home {
            Some(p) => p.checkpoint.clone(),
            None => Arc::new(Checkpoint::load(kb_dir.join(CHECKPOINT_FILE)).await),
        };

        let mut providers = BTreeMap::new();
        let mut spaces = Vec::new();
        for (modality, embedding) in config.embedding.configured() {
            let provider = match previous
                .and_then(|p| p.providers.get(&modality))
                .filter(|(c, _)| c == embedding)
            {
                Some((_, provider)) => provider.clone(),
                None => create_provider(embedding, modality)?,
            };
            providers.insert(modality, (embedding.clone(), provider.clone()));

            let ns = namespace(&kb, &provider.space_key());
            let stores = Self::open_stores(&config, home, modality, &ns, pool.as_ref()).await?;

            if stores.is_durable()
                && stores.vector.len().await? == 0
                && stores.document.len().await? == 0
            {
                checkpoint.clear_namespace(&ns).await?;
            }
            spaces.push(ModalitySpace::new(&kb, provider, stores));
        }

        let reranker = match previous.filter(|p| p.config.rerank == config.rerank) {
            Some(p) => p.reranker.clone(),
            None => create_reranker(&config.rerank)?,
        };

        let mut orchestrator = Orchestrator::new(&kb, spaces.clone(), config.ingest.clone())
            .with_checkpoint(checkpoint.clone());
        if config.general.modality_fallback {
            orchestrator =
                orchestrator.with_decomposer(Arc::new(FfmpegDecomposer::new(&config.loader)));
        }

        let mut engine = QueryEngine::new(spaces, config.retrieval.clone());
        if let Some(reranker) = &reranker {
            engine = engine.with_reranker(reranker.clone(), config.rerank.candidate_k);
        }

        let file_loader = FileLoader::new(&config.loader)?;
        let url_loader = UrlLoader::new(&config.loader)?;

        tracing::info!(
            kb = %kb,
            modalities = ?providers.keys().collect::<Vec<_>>(),
            sqlite = pool.is_some(),
            rerank = reranker.is_some(),
            "runtime state built"
        );

        Ok(Self {
            config,
            kb_dir,
            pool,
            providers,
            reranker,
            checkpoint,
            orchestrator,
            engine,
            file_loader,
            url_loader,
        })
    }

    /// Reuse the stores of `home` when the namespace and both node store
    /// backends are unchanged; otherwise open a reconciled fresh set.
    async fn open_stores(
        config: &Config,
        home: Option<&RuntimeState>,
        modality: Modality,
        ns: &str,
        pool: Option<&SqlitePool>,
    ) -> Result<StoreSet> {
        let wanted = &config.stores;
        let reusable = home
            .and_then(|p| {
                p.orchestrator
                    .space(modality)
                    .filter(|s| s.namespace == ns)
                    .map(|s| (&p.config.stores, &s.stores))
            })
            .filter(|(was, _)| was.vector == wanted.vector && was.document == wanted.document);

        if let Some((was, stores)) = reusable {
            let cache = if was.cache == wanted.cache && was.cache_capacity == wanted.cache_capacity {
                stores.cache.clone()
            } else {
                open_fingerprint_cache(wanted.cache, pool, ns, wanted.cache_capacity).await?
            };
            return Ok(StoreSet {
                vector: stores.vector.clone(),
                document: stores.document.clone(),
                cache,
            });
        }

        let stores = StoreSet::open(wanted, pool, ns).await?;
        stores.reconcile(ns).await?;
        Ok(stores)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn engine(&self) -> &QueryEngine {
        &self.engine
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    /// Discover every location up front, then fetch and ingest them
    /// lazily, one worker slot per location.
    async fn ingest_locations(&self, loader: &dyn SourceLoader, locations: Vec<String>) -> IngestReport {
        let mut report = IngestReport::default();
        let mut discovered = Vec::new();
        for location in locations {
            match loader.discover(&location).await {
                Ok(found) => discovered.extend(found),
                Err(e) => {
                    tracing::warn!(loader = loader.name(), location = %location, error = %e, "discovery failed");
                    report.merge(IngestReport::failure(location, &e));
                }
            }
        }

        let pending = stream::iter(discovered).map(move |location| {
            let fetch_location = location.clone();
            (location, async move { loader.fetch(&fetch_location).await })
        });
        report.merge(self.orchestrator.ingest_lazy(pending).await);
        report
    }

    async fn ingest_list(&self, loader: &dyn SourceLoader, list: &Path) -> IngestReport {
        match read_list(list).await {
            Ok(locations) => self.ingest_locations(loader, locations).await,
            Err(e) => IngestReport::failure(list.display().to_string(), &e),
        }
    }
}

pub struct Runtime {
    config_path: Option<PathBuf>,
    state: RwLock<Arc<RuntimeState>>,
    rebuild_lock: Mutex<()>,
}

impl Runtime {
    /// Start from an in-memory configuration. [`rebuild`](Self::rebuild)
    /// is unavailable; use [`rebuild_with`](Self::rebuild_with).
    pub async fn init(config: Config) -> Result<Self> {
        Self::start(config, None).await
    }

    /// Start from a TOML file; [`rebuild`](Self::rebuild) re-reads it.
    pub async fn from_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = load_config(&path)?;
        Self::start(config, Some(path)).await
    }

    async fn start(config: Config, config_path: Option<PathBuf>) -> Result<Self> {
        logging::init(&config.general);
        let state = RuntimeState::build(config, None).await?;
        Ok(Self {
            config_path,
            state: RwLock::new(Arc::new(state)),
            rebuild_lock: Mutex::new(()),
        })
    }

    /// The state current at the time of the call.
    pub fn snapshot(&self) -> Arc<RuntimeState> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn config(&self) -> Config {
        self.snapshot().config.clone()
    }

    /// Re-read the configuration file and apply it.
    pub async fn rebuild(&self) -> Result<()> {
        let path = self
            .config_path
            .as_ref()
            .ok_or_else(|| Error::config("runtime was not started from a config file"))?;
        let config = load_config(path)?;
        self.rebuild_with(config).await
    }

    pub async fn rebuild_with(&self, config: Config) -> Result<()> {
        let _guard = self.rebuild_lock.lock().await;
        let current = self.snapshot();
        if current.config == config {
            tracing::debug!("configuration unchanged; nothing to rebuild");
            return Ok(());
        }

        let next = match RuntimeState::build(config, Some(&current)).await {
            Ok(next) => next,
            Err(e) => {
                tracing::warn!(error = %e, "rebuild rejected; previous configuration stays active");
                return Err(e);
            }
        };

        *self.state.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
        tracing::info!("runtime rebuilt");
        Ok(())
    }

    pub async fn ingest(&self, unit: SourceUnit) -> IngestReport {
        self.snapshot().orchestrator.ingest(unit).await
    }

    pub async fn ingest_stream<S>(&self, units: S) -> IngestReport
    where
        S: Stream<Item = SourceUnit> + Send,
    {
        self.snapshot().orchestrator.ingest_stream(units).await
    }

    /// Ingest a file, or every matching file under a directory.
    pub async fn ingest_path(&self, path: impl AsRef<Path>) -> IngestReport {
        let state = self.snapshot();
        let location = path.as_ref().display().to_string();
        state
            .ingest_locations(&state.file_loader, vec![location])
            .await
    }

    /// Ingest every path listed in `list` (one per line).
    pub async fn ingest_path_list(&self, list: impl AsRef<Path>) -> IngestReport {
        let state = self.snapshot();
        state.ingest_list(&state.file_loader, list.as_ref()).await
    }

    pub async fn ingest_url(&self, url: &str) -> IngestReport {
        let state = self.snapshot();
        state
            .ingest_locations(&state.url_loader, vec![url.to_string()])
            .await
    }

    /// Ingest every URL listed in `list` (one per line).
    pub async fn ingest_url_list(&self, list: impl AsRef<Path>) -> IngestReport {
        let state = self.snapshot();
        state.ingest_list(&state.url_loader, list.as_ref()).await
    }

    pub async fn delete_source(&self, location: &str) -> Result<usize> {
        self.snapshot().orchestrator.delete_source(location).await
    }

    pub async fn query(
        &self,
        pair: ModalityPair,
        input: &QueryInput,
        top_k: usize,
    ) -> Result<Vec<RetrievalHit>> {
        self.snapshot().engine.query(pair, input, top_k).await
    }

    pub async fn query_with_mode(
        &self,
        pair: ModalityPair,
        input: &QueryInput,
        top_k: usize,
        mode: RetrievalMode,
    ) -> Result<Vec<RetrievalHit>> {
        self.snapshot()
            .engine
            .query_with_mode(pair, input, top_k, mode)
            .await
    }
}
