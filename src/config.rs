//! TOML configuration.
//!
//! ```toml
//! [general]
//! knowledge_base = "docs"
//! workspace_dir = ".ragweave"
//!
//! [stores]
//! vector = "sqlite"
//! document = "sqlite"
//! cache = "memory"
//! cache_capacity = 10000
//!
//! [embedding.text]
//! provider = "ollama"
//! model = "nomic-embed-text"
//! dims = 768
//!
//! [retrieval]
//! mode = "fusion"
//! lambda_vector = 0.7
//! lambda_bm25 = 0.3
//! ```
//!
//! Every section is optional; [`Config::validate`] rejects contradictory
//! values with [`Error::Config`]. Sections derive `PartialEq` so the
//! runtime can tell which subtrees changed on `rebuild()`.

use std::path::{Path, PathBuf};

use ragweave_core::fusion::{FusionWeights, Normalization};
use ragweave_core::models::{Modality, RetrievalMode};
use ragweave_core::{Error, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub stores: StoresConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfigs,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub loader: LoaderConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct GeneralConfig {
    #[serde(default = "default_knowledge_base")]
    pub knowledge_base: String,
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,
    /// Decompose units without a provider into lower modalities.
    #[serde(default = "default_true")]
    pub modality_fallback: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            knowledge_base: default_knowledge_base(),
            workspace_dir: default_workspace_dir(),
            log_level: default_log_level(),
            json_logs: false,
            modality_fallback: true,
        }
    }
}

impl GeneralConfig {
    /// `<workspace>/<kb>`, home of the SQLite file and the checkpoint.
    pub fn kb_dir(&self) -> PathBuf {
        self.workspace_dir.join(&self.knowledge_base)
    }
}

fn default_knowledge_base() -> String {
    "default".to_string()
}
fn default_workspace_dir() -> PathBuf {
    PathBuf::from(".ragweave")
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreProvider {
    #[default]
    Memory,
    Sqlite,
}

impl StoreProvider {
    pub fn is_durable(&self) -> bool {
        matches!(self, StoreProvider::Sqlite)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
pub struct StoresConfig {
    #[serde(default)]
    pub vector: StoreProvider,
    #[serde(default)]
    pub document: StoreProvider,
    #[serde(default)]
    pub cache: StoreProvider,
    /// LRU bound on fingerprint entries per namespace; unbounded when unset.
    #[serde(default)]
    pub cache_capacity: Option<usize>,
}

impl StoresConfig {
    pub fn uses_sqlite(&self) -> bool {
        [self.vector, self.document, self.cache]
            .iter()
            .any(StoreProvider::is_durable)
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    OpenAI,
    Ollama,
    Hashing,
}

impl EmbeddingProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingProviderKind::OpenAI => "openai",
            EmbeddingProviderKind::Ollama => "ollama",
            EmbeddingProviderKind::Hashing => "hashing",
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProviderKind,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Endpoint override (Ollama host, OpenAI-compatible proxy).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

/// One optional provider per modality.
#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
pub struct EmbeddingConfigs {
    #[serde(default)]
    pub text: Option<EmbeddingConfig>,
    #[serde(default)]
    pub image: Option<EmbeddingConfig>,
    #[serde(default)]
    pub audio: Option<EmbeddingConfig>,
    #[serde(default)]
    pub video: Option<EmbeddingConfig>,
}

impl EmbeddingConfigs {
    pub fn get(&self, modality: Modality) -> Option<&EmbeddingConfig> {
        match modality {
            Modality::Text => self.text.as_ref(),
            Modality::Image => self.image.as_ref(),
            Modality::Audio => self.audio.as_ref(),
            Modality::Video => self.video.as_ref(),
        }
    }

    pub fn configured(&self) -> impl Iterator<Item = (Modality, &EmbeddingConfig)> {
        Modality::ALL
            .into_iter()
            .filter_map(move |m| self.get(m).map(|c| (m, c)))
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct IngestConfig {
    /// Approximate tokens per text chunk.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    /// Nodes per atomic commit.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Source units processed concurrently.
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_ingest_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Bound on every provider and store call.
    #[serde(default = "default_ingest_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            batch_size: default_batch_size(),
            workers: default_workers(),
            max_retries: default_ingest_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            timeout_secs: default_ingest_timeout_secs(),
        }
    }
}

fn default_chunk_size() -> usize {
    500
}
fn default_chunk_overlap() -> usize {
    50
}
fn default_batch_size() -> usize {
    64
}
fn default_workers() -> usize {
    4
}
fn default_ingest_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    200
}
fn default_ingest_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RetrievalConfig {
    #[serde(default)]
    pub mode: RetrievalMode,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_vector_top_k")]
    pub vector_top_k: usize,
    #[serde(default = "default_bm25_top_k")]
    pub bm25_top_k: usize,
    #[serde(default = "default_lambda")]
    pub lambda_vector: f64,
    #[serde(default = "default_lambda")]
    pub lambda_bm25: f64,
    #[serde(default)]
    pub normalization: Normalization,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            mode: RetrievalMode::Fusion,
            top_k: default_top_k(),
            vector_top_k: default_vector_top_k(),
            bm25_top_k: default_bm25_top_k(),
            lambda_vector: default_lambda(),
            lambda_bm25: default_lambda(),
            normalization: Normalization::MinMax,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl RetrievalConfig {
    pub fn weights(&self) -> FusionWeights {
        FusionWeights {
            vector: self.lambda_vector,
            bm25: self.lambda_bm25,
        }
    }
}

fn default_top_k() -> usize {
    10
}
fn default_vector_top_k() -> usize {
    20
}
fn default_bm25_top_k() -> usize {
    10
}
fn default_lambda() -> f64 {
    0.5
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RerankProviderKind {
    Cohere,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RerankConfig {
    #[serde(default)]
    pub provider: Option<RerankProviderKind>,
    #[serde(default = "default_rerank_model")]
    pub model: String,
    #[serde(default)]
    pub url: Option<String>,
    /// Fused candidates handed to the reranker.
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            provider: None,
            model: default_rerank_model(),
            url: None,
            candidate_k: default_candidate_k(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_rerank_model() -> String {
    "rerank-v3.5".to_string()
}
fn default_candidate_k() -> usize {
    20
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoaderConfig {
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg_path: PathBuf,
    #[serde(default = "default_frame_interval_secs")]
    pub frame_interval_secs: u32,
    #[serde(default = "default_max_frames")]
    pub max_frames: usize,
    /// Also ingest images, audio and video linked from fetched pages.
    #[serde(default = "default_true")]
    pub load_assets: bool,
    /// Only follow asset links on the page's own scheme, host and port.
    #[serde(default = "default_true")]
    pub same_origin: bool,
    #[serde(default = "default_max_assets_per_page")]
    pub max_assets_per_page: usize,
    /// Assets larger than this are skipped.
    #[serde(default = "default_max_asset_bytes")]
    pub max_asset_bytes: u64,
    /// Pages larger than this fail to load.
    #[serde(default = "default_max_page_bytes")]
    pub max_page_bytes: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
            user_agent: default_user_agent(),
            timeout_secs: default_timeout_secs(),
            ffmpeg_path: default_ffmpeg(),
            frame_interval_secs: default_frame_interval_secs(),
            max_frames: default_max_frames(),
            load_assets: true,
            same_origin: true,
            max_assets_per_page: default_max_assets_per_page(),
            max_asset_bytes: default_max_asset_bytes(),
            max_page_bytes: default_max_page_bytes(),
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*".to_string()]
}
fn default_user_agent() -> String {
    format!("ragweave/{}", env!("CARGO_PKG_VERSION"))
}
fn default_ffmpeg() -> PathBuf {
    PathBuf::from("ffmpeg")
}
fn default_frame_interval_secs() -> u32 {
    5
}
fn default_max_frames() -> usize {
    8
}
fn default_max_assets_per_page() -> usize {
    20
}
fn default_max_asset_bytes() -> u64 {
    100 * 1024 * 1024
}
fn default_max_page_bytes() -> u64 {
    10 * 1024 * 1024
}

impl Config {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| Error::config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints. Parsing alone accepts all of these.
    pub fn validate(&self) -> Result<()> {
        validate_kb_name(&self.general.knowledge_base)?;

        let ingest = &self.ingest;
        if ingest.chunk_size == 0 {
            return Err(Error::config("ingest.chunk_size must be > 0"));
        }
        if ingest.chunk_overlap >= ingest.chunk_size {
            return Err(Error::config(format!(
                "ingest.chunk_overlap ({}) must be smaller than ingest.chunk_size ({})",
                ingest.chunk_overlap, ingest.chunk_size
            )));
        }
        if ingest.batch_size == 0 {
            return Err(Error::config("ingest.batch_size must be > 0"));
        }
        if ingest.workers == 0 {
            return Err(Error::config("ingest.workers must be > 0"));
        }
        if ingest.timeout_secs == 0 {
            return Err(Error::config("ingest.timeout_secs must be > 0"));
        }

        let r = &self.retrieval;
        if r.top_k == 0 || r.vector_top_k == 0 || r.bm25_top_k == 0 {
            return Err(Error::config(
                "retrieval.top_k, vector_top_k and bm25_top_k must be > 0",
            ));
        }
        for (name, value) in [("lambda_vector", r.lambda_vector), ("lambda_bm25", r.lambda_bm25)] {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::config(format!(
                    "retrieval.{name} must be a finite, non-negative number"
                )));
            }
        }
        if r.lambda_vector == 0.0 && r.lambda_bm25 == 0.0 {
            return Err(Error::config(
                "retrieval.lambda_vector and retrieval.lambda_bm25 cannot both be 0",
            ));
        }
        if r.timeout_secs == 0 {
            return Err(Error::config("retrieval.timeout_secs must be > 0"));
        }

        let mut any = false;
        for (modality, cfg) in self.embedding.configured() {
            any = true;
            if cfg.dims.unwrap_or(0) == 0 {
                return Err(Error::config(format!(
                    "embedding.{modality}.dims must be > 0 when provider is '{}'",
                    cfg.provider.as_str()
                )));
            }
            let needs_model = matches!(
                cfg.provider,
                EmbeddingProviderKind::OpenAI | EmbeddingProviderKind::Ollama
            );
            if needs_model && cfg.model.as_deref().unwrap_or("").is_empty() {
                return Err(Error::config(format!(
                    "embedding.{modality}.model must be specified when provider is '{}'",
                    cfg.provider.as_str()
                )));
            }
            if needs_model && modality != Modality::Text {
                return Err(Error::config(format!(
                    "embedding.{modality}: provider '{}' only embeds text",
                    cfg.provider.as_str()
                )));
            }
        }
        if !any {
            return Err(Error::config(
                "at least one [embedding.<modality>] provider must be configured",
            ));
        }

        if self.rerank.provider.is_some() && self.rerank.candidate_k == 0 {
            return Err(Error::config("rerank.candidate_k must be > 0"));
        }
        if self.loader.frame_interval_secs == 0 {
            return Err(Error::config("loader.frame_interval_secs must be > 0"));
        }
        if self.loader.max_asset_bytes == 0 || self.loader.max_page_bytes == 0 {
            return Err(Error::config(
                "loader.max_asset_bytes and loader.max_page_bytes must be > 0",
            ));
        }

        Ok(())
    }
}

/// Knowledge base names become a directory under the workspace, so they
/// are limited to one plain path component.
fn validate_kb_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::config("general.knowledge_base must not be empty"));
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.');
    if name.starts_with('.') || !name.chars().all(allowed) {
        return Err(Error::config(format!(
            "general.knowledge_base '{name}' may only contain letters, digits, '-', '_' and '.', and must not start with '.'"
        )));
    }
    Ok(())
}

/// Read, parse and validate a TOML config file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::config(format!(
            "failed to read config file {}: {e}",
            path.display()
        ))
    })?;
    Config::from_toml_str(&content)
}
