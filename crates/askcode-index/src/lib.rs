//! Code indexing and retrieval-augmented question answering.
//!
//! The pipeline walks a project ([`loader`]), splits files into line-addressed
//! chunks ([`chunker`]), embeds them in batches ([`embedder`]), and stores them
//! in a per-project collection ([`collection`]) behind the [`vector_store::VectorStore`]
//! trait. [`indexer`] keeps a [`manifest`] so unchanged files are never re-embedded,
//! and [`retriever`] answers questions from the stored chunks.

pub mod chunker;
pub mod collection;
pub mod context;
pub mod embedder;
pub mod error;
pub mod indexer;
pub mod languages;
pub mod loader;
pub mod local;
pub mod lock;
pub mod manifest;
pub(crate) mod persist;
pub mod project;
pub mod qdrant;
pub mod retriever;
pub mod summary;
pub mod vector_store;
pub mod watcher;

pub use error::{IndexError, LoadError, Result};
