//! # ragweave core
//!
//! Runtime-agnostic building blocks for the ragweave ingest and retrieval
//! pipeline: data models, the error taxonomy, chunking, BM25 scoring,
//! score fusion, and the capability traits every pluggable backend
//! implements.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem I/O. Concrete
//! backends that need those (SQLite stores, HTTP embedding providers,
//! file and URL loaders) live in the `ragweave` app crate.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`error`] | [`Error`](error::Error) taxonomy and `Result` alias |
//! | [`models`] | Modalities, source units, nodes, fingerprints, hits |
//! | [`chunk`] | [`Chunker`](chunk::Chunker) trait + paragraph chunker |
//! | [`embedding`] | [`EmbedProvider`](embedding::EmbedProvider) trait, key sanitizing, vector helpers |
//! | [`bm25`] | Tokenizer and in-process Okapi BM25 index |
//! | [`fusion`] | Score normalization and weighted fusion |
//! | [`rerank`] | [`Reranker`](rerank::Reranker) trait |
//! | [`loader`] | [`SourceLoader`](loader::SourceLoader) and [`MediaDecomposer`](loader::MediaDecomposer) traits |
//! | [`store`] | Vector, document and fingerprint-cache traits + in-memory backends |

pub mod bm25;
pub mod chunk;
pub mod embedding;
pub mod error;
pub mod fusion;
pub mod loader;
pub mod models;
pub mod rerank;
pub mod store;

pub use error::{Error, Result};
