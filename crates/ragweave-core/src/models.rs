//! Core data models for the ingest and retrieval pipeline.
//!
//! ```text
//! SourceUnit ──chunk──▶ Node ──embed──▶ VectorRecord  (vector store)
//!     │                   └──────────▶ DocStoreEntry (document store)
//!     └──hash──▶ FingerprintKey ──▶ FingerprintRecord (fingerprint cache)
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Embedding space family. Each modality has its own provider and stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Image,
    Audio,
    Video,
}

impl Modality {
    pub const ALL: [Modality; 4] = [
        Modality::Text,
        Modality::Image,
        Modality::Audio,
        Modality::Video,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Text => "text",
            Modality::Image => "image",
            Modality::Audio => "audio",
            Modality::Video => "video",
        }
    }

    /// Whether nodes of this modality carry searchable text.
    pub fn has_text(&self) -> bool {
        matches!(self, Modality::Text)
    }

    /// Lower modalities a unit decomposes into when its own modality has
    /// no embedding provider configured.
    pub fn fallback(&self) -> &'static [Modality] {
        match self {
            Modality::Video => &[Modality::Image, Modality::Audio],
            Modality::Text | Modality::Image | Modality::Audio => &[],
        }
    }

    /// Guess a modality from a file extension (without the dot).
    pub fn from_extension(ext: &str) -> Option<Modality> {
        match ext.to_ascii_lowercase().as_str() {
            "txt" | "md" | "markdown" | "rst" | "html" | "htm" | "csv" | "json" | "toml"
            | "yaml" | "yml" | "log" | "rs" | "py" | "ts" | "js" => Some(Modality::Text),
            "png" | "jpg" | "jpeg" | "gif" | "webp" | "bmp" => Some(Modality::Image),
            "wav" | "mp3" | "flac" | "ogg" | "m4a" => Some(Modality::Audio),
            "mp4" | "mov" | "mkv" | "webm" | "avi" => Some(Modality::Video),
            _ => None,
        }
    }

    /// Guess a modality from an HTTP `Content-Type` value.
    pub fn from_mime(content_type: &str) -> Option<Modality> {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if essence.starts_with("text/")
            || essence == "application/json"
            || essence == "application/xhtml+xml"
        {
            Some(Modality::Text)
        } else if essence.starts_with("image/") {
            Some(Modality::Image)
        } else if essence.starts_with("audio/") {
            Some(Modality::Audio)
        } else if essence.starts_with("video/") {
            Some(Modality::Video)
        } else {
            None
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Modality {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Modality::Text),
            "image" => Ok(Modality::Image),
            "audio" => Ok(Modality::Audio),
            "video" => Ok(Modality::Video),
            other => Err(Error::invalid_request(format!("unknown modality '{other}'"))),
        }
    }
}

/// Raw payload of a source unit.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Text(String),
    Bytes(Vec<u8>),
}

impl Content {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Content::Text(t) => t.as_bytes(),
            Content::Bytes(b) => b,
        }
    }

    /// Text view of the payload; binary content is decoded lossily.
    pub fn to_text(&self) -> String {
        match self {
            Content::Text(t) => t.clone(),
            Content::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        }
    }
}

/// One piece of raw content handed to the ingest orchestrator.
#[derive(Debug, Clone)]
pub struct SourceUnit {
    /// Path or URL the content came from. Doubles as the source identity
    /// used to replace older versions on content change.
    pub location: String,
    pub modality: Modality,
    pub content: Content,
    pub metadata: Map<String, Value>,
}

impl SourceUnit {
    pub fn text(location: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            modality: Modality::Text,
            content: Content::Text(text.into()),
            metadata: Map::new(),
        }
    }

    pub fn media(location: impl Into<String>, modality: Modality, bytes: Vec<u8>) -> Self {
        Self {
            location: location.into(),
            modality,
            content: Content::Bytes(bytes),
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// SHA-256 of the raw content, lower-case hex.
    pub fn content_hash(&self) -> String {
        content_hash(self.content.as_bytes())
    }
}

/// SHA-256 of `bytes`, lower-case hex.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Separates a decomposed unit's location from the name of one part.
pub const PART_SEPARATOR: char = '#';

/// Location of the part `part` cut from the unit at `base`.
pub fn part_location(base: &str, part: &str) -> String {
    format!("{base}{PART_SEPARATOR}{part}")
}

/// Whether `source` is `base` itself or a part derived from it.
pub fn is_part_of(source: &str, base: &str) -> bool {
    match source.strip_prefix(base) {
        Some("") => true,
        Some(rest) => rest.starts_with(PART_SEPARATOR),
        None => false,
    }
}

/// Smallest ingested unit: one chunk of a text source or one media item.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: String,
    pub modality: Modality,
    pub source: String,
    pub chunk_index: usize,
    pub text: String,
    pub metadata: Value,
    /// Content hash of the parent source unit.
    pub content_hash: String,
}

impl Node {
    /// Deterministic node id, so re-ingesting the same content after a
    /// partial failure overwrites instead of duplicating. Scoped by
    /// location: identical content at two locations yields distinct nodes.
    pub fn derive_id(
        namespace: &str,
        location: &str,
        content_hash: &str,
        chunk_index: usize,
    ) -> String {
        let name = format!("{namespace}:{location}:{content_hash}:{chunk_index}");
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
    }

    pub fn to_entry(&self) -> DocStoreEntry {
        DocStoreEntry {
            id: self.id.clone(),
            modality: self.modality,
            source: self.source.clone(),
            chunk_index: self.chunk_index,
            text: self.text.clone(),
            metadata: self.metadata.clone(),
            hash: self.content_hash.clone(),
        }
    }
}

/// Document store row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocStoreEntry {
    pub id: String,
    pub modality: Modality,
    pub source: String,
    pub chunk_index: usize,
    pub text: String,
    pub metadata: Value,
    /// Content hash of the source unit the node was cut from.
    pub hash: String,
}

/// Vector store row.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    pub id: String,
    pub modality: Modality,
    pub vector: Vec<f32>,
}

/// Identity of one ingested source version inside one embedding space.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FingerprintKey {
    pub kb: String,
    pub modality: Modality,
    pub space_key: String,
    pub content_hash: String,
}

impl FingerprintKey {
    pub fn new(
        kb: impl Into<String>,
        modality: Modality,
        space_key: impl Into<String>,
        content_hash: impl Into<String>,
    ) -> Self {
        Self {
            kb: kb.into(),
            modality,
            space_key: space_key.into(),
            content_hash: content_hash.into(),
        }
    }

    /// Flat string form, used as the primary key by persistent caches.
    pub fn cache_key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.kb, self.modality, self.space_key, self.content_hash
        )
    }
}

impl fmt::Display for FingerprintKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.cache_key())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintRecord {
    pub node_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// A node id with a raw backend score (cosine similarity or BM25).
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredId {
    pub id: String,
    pub score: f64,
}

impl ScoredId {
    pub fn new(id: impl Into<String>, score: f64) -> Self {
        Self {
            id: id.into(),
            score,
        }
    }
}

/// Which retriever(s) produced a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HitOrigin {
    Vector,
    Bm25,
    /// Found by both retrievers during fusion.
    Both,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalHit {
    pub node_id: String,
    pub score: f64,
    pub origin: HitOrigin,
    pub modality: Modality,
    pub source: String,
    pub text: String,
    pub metadata: Value,
}

/// Query modality → target embedding space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModalityPair {
    pub source: Modality,
    pub target: Modality,
}

impl ModalityPair {
    /// Supported pairs: same-modality search plus text into any space.
    pub fn new(source: Modality, target: Modality) -> Result<Self> {
        if source != target && source != Modality::Text {
            return Err(Error::invalid_request(format!(
                "unsupported modality pair {source}->{target}"
            )));
        }
        Ok(Self { source, target })
    }

    pub fn same(modality: Modality) -> Self {
        Self {
            source: modality,
            target: modality,
        }
    }

    pub fn text_to(target: Modality) -> Self {
        Self {
            source: Modality::Text,
            target,
        }
    }
}

impl fmt::Display for ModalityPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.source, self.target)
    }
}

/// Query payload; media queries carry raw bytes in the pair's source modality.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryInput {
    Text(String),
    Media(Vec<u8>),
}

impl QueryInput {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            QueryInput::Text(t) => Some(t),
            QueryInput::Media(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMode {
    VectorOnly,
    Bm25Only,
    #[default]
    Fusion,
}
