//! # ragweave
//!
//! A multimodal ingest, cache and retrieve pipeline.
//!
//! Source units (text, images, audio, video) are chunked, fingerprinted,
//! embedded per modality and committed to a vector store and a document
//! store in atomic batches. Re-ingesting identical content is a
//! fingerprint hit and costs no embedding calls. Queries run vector
//! search, BM25 search, or a weighted fusion of both.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌─────────────────────┐
//! │   Loaders   │──▶│ Orchestrator │──▶│ Vector │ Doc │Cache │
//! │ File / URL  │   │ chunk+embed  │   │  per modality space │
//! └─────────────┘   └──────────────┘   └──────────┬──────────┘
//!                                                 │
//!                                      ┌──────────▼──────────┐
//!                                      │    Query engine     │
//!                                      │ vector · bm25 · fuse│
//!                                      └─────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # async fn run() -> ragweave_core::Result<()> {
//! use ragweave::runtime::Runtime;
//! use ragweave_core::models::{Modality, ModalityPair, QueryInput};
//!
//! let runtime = Runtime::from_path("config/ragweave.toml").await?;
//! let report = runtime.ingest_path("./docs").await;
//! println!("accepted {} skipped {}", report.accepted, report.skipped);
//!
//! let hits = runtime
//!     .query(
//!         ModalityPair::same(Modality::Text),
//!         &QueryInput::Text("deployment checklist".into()),
//!         5,
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and validation |
//! | [`runtime`] | Active state, snapshot reads, `rebuild()` |
//! | [`ingest`] | Batched, fingerprinted ingest with rollback |
//! | [`retrieve`] | Vector, BM25 and fused retrieval |
//! | [`stores`] | Per-modality store wiring |
//! | [`sqlite_store`] | SQLite store backends (FTS5 + BLOB vectors) |
//! | [`embedding`] | Embedding providers |
//! | [`rerank`] | Rerankers |
//! | [`loader`] | File and URL loaders |
//! | [`media`] | ffmpeg video decomposition |
//! | [`checkpoint`] | Warm-restart manifest |
//! | [`db`] | SQLite connection |
//! | [`migrate`] | Per-namespace schema |
//! | [`logging`] | Tracing subscriber setup |

pub mod checkpoint;
pub mod config;
pub mod db;
pub mod deadline;
pub mod embedding;
mod http;
pub mod ingest;
pub mod loader;
pub mod logging;
pub mod media;
pub mod migrate;
pub mod rerank;
pub mod retrieve;
pub mod runtime;
pub mod sqlite_store;
pub mod stores;

pub use ragweave_core as core;
