//! Collection handle bound to one project's [`SourceName`].
//!
//! Several projects may share one physical collection; every read and delete
//! is scoped by the `source_name` payload field.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use askcode_llm::provider::LlmProvider;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chunker::Chunk;
use crate::embedder::Embedder;
use crate::error::{IndexError, Result};
use crate::project::SourceName;
use crate::vector_store::{Payload, VectorFilter, VectorPoint, VectorStore, VectorStoreError};

const SOURCE_FIELD: &str = "source_name";
const FILE_FIELD: &str = "file_path";

#[must_use]
pub fn default_collection_name(source_name: &SourceName) -> String {
    format!("askcode_{source_name}")
}

/// Deterministic point id: the same chunk slot always maps to the same point.
#[must_use]
pub fn point_id(source_name: &SourceName, file_path: &str, chunk_index: usize) -> String {
    let key = format!("{source_name}:{file_path}:{chunk_index}");
    Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes()).to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub file_path: String,
    pub source_name: String,
    pub chunk_index: usize,
    pub line_start: usize,
    pub line_end: usize,
    #[serde(default)]
    pub language: Option<String>,
    pub node_type: String,
    #[serde(default)]
    pub entity_name: Option<String>,
    pub content_hash: String,
}

#[derive(Debug, Clone)]
pub struct CollectionEntry {
    pub id: String,
    pub vector: Vec<f32>,
    pub text: String,
    pub metadata: EntryMetadata,
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
    pub text: String,
    pub metadata: EntryMetadata,
    pub(crate) seq: i64,
}

impl SearchHit {
    #[must_use]
    pub fn line_range(&self) -> (usize, usize) {
        (self.metadata.line_start, self.metadata.line_end)
    }
}

#[derive(Deserialize)]
struct StoredEntry {
    text: String,
    #[serde(default)]
    seq: i64,
    #[serde(flatten)]
    metadata: EntryMetadata,
}

fn unavailable(e: &VectorStoreError) -> IndexError {
    IndexError::StoreUnavailable(e.to_string())
}

pub struct CodeCollection {
    store: Arc<dyn VectorStore>,
    name: String,
    source_name: SourceName,
    next_seq: AtomicI64,
}

impl std::fmt::Debug for CodeCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeCollection")
            .field("name", &self.name)
            .field("source_name", &self.source_name)
            .finish_non_exhaustive()
    }
}

impl CodeCollection {
    fn bind(store: Arc<dyn VectorStore>, source_name: SourceName, name: &str) -> Self {
        let base = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default();
        Self {
            store,
            name: name.to_owned(),
            source_name,
            next_seq: AtomicI64::new(base),
        }
    }

    /// Open the collection, creating it (after probing the embedding
    /// dimensionality) if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the store cannot be reached or the
    /// collection cannot be created, or `EmbeddingBackend` if the probe fails.
    pub async fn reuse_or_create<P: LlmProvider>(
        store: Arc<dyn VectorStore>,
        source_name: SourceName,
        collection_name: &str,
        embedder: &Embedder<P>,
    ) -> Result<Self> {
        let exists = store
            .collection_exists(collection_name)
            .await
            .map_err(|e| unavailable(&e))?;
        if !exists {
            let dimension = embedder.dimension().await?;
            tracing::info!(collection = collection_name, dimension, "creating collection");
            store
                .ensure_collection(collection_name, dimension as u64)
                .await
                .map_err(|e| unavailable(&e))?;
        }
        Ok(Self::bind(store, source_name, collection_name))
    }

    /// Bind to an existing collection without creating anything.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the store cannot be reached.
    pub async fn open_existing(
        store: Arc<dyn VectorStore>,
        source_name: SourceName,
        collection_name: &str,
    ) -> Result<Option<Self>> {
        let exists = store
            .collection_exists(collection_name)
            .await
            .map_err(|e| unavailable(&e))?;
        Ok(exists.then(|| Self::bind(store, source_name, collection_name)))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn source_name(&self) -> &SourceName {
        &self.source_name
    }

    fn scope(&self) -> VectorFilter {
        VectorFilter::text_eq(SOURCE_FIELD, self.source_name.as_str())
    }

    /// Build the stored entry for `chunk`, bound to this collection's source.
    #[must_use]
    pub fn entry(&self, chunk: &Chunk, vector: Vec<f32>) -> CollectionEntry {
        CollectionEntry {
            id: point_id(&self.source_name, &chunk.file_path, chunk.index),
            vector,
            text: chunk.text.clone(),
            metadata: EntryMetadata {
                file_path: chunk.file_path.clone(),
                source_name: self.source_name.to_string(),
                chunk_index: chunk.index,
                line_start: chunk.line_range.0,
                line_end: chunk.line_range.1,
                language: chunk.language.map(|l| l.id().to_owned()),
                node_type: chunk.node_type.clone(),
                entity_name: chunk.entity_name.clone(),
                content_hash: chunk.content_hash.clone(),
            },
        }
    }

    /// Insert or replace entries by point id.
    ///
    /// # Errors
    ///
    /// Returns `Other` if an entry belongs to another source, `Json` if its
    /// metadata cannot be encoded, or `Store` if the upsert fails.
    pub async fn upsert(&self, entries: Vec<CollectionEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut points = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.metadata.source_name != self.source_name.as_str() {
                return Err(IndexError::Other(format!(
                    "entry {} belongs to source {}, not {}",
                    entry.id, entry.metadata.source_name, self.source_name
                )));
            }
            let serde_json::Value::Object(map) = serde_json::to_value(&entry.metadata)? else {
                return Err(IndexError::Other("entry metadata is not an object".into()));
            };
            let mut payload: Payload = map.into_iter().collect();
            payload.insert("text".into(), entry.text.into());
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            payload.insert("seq".into(), seq.into());
            points.push(VectorPoint {
                id: entry.id,
                vector: entry.vector,
                payload,
            });
        }
        self.store.upsert(&self.name, points).await?;
        Ok(())
    }

    /// At most `top_k` hits for this source, best first, earlier insertions
    /// winning ties.
    ///
    /// # Errors
    ///
    /// Returns `Store` if the search fails.
    pub async fn search(&self, vector: Vec<f32>, top_k: usize) -> Result<Vec<SearchHit>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let points = self
            .store
            .search(&self.name, vector, top_k as u64, Some(self.scope()))
            .await?;

        let mut hits: Vec<SearchHit> = points
            .into_iter()
            .filter_map(|p| {
                let raw = serde_json::Value::Object(p.payload.into_iter().collect());
                match serde_json::from_value::<StoredEntry>(raw) {
                    Ok(stored) => Some(SearchHit {
                        id: p.id,
                        score: p.score,
                        text: stored.text,
                        metadata: stored.metadata,
                        seq: stored.seq,
                    }),
                    Err(e) => {
                        tracing::warn!(id = %p.id, "skipping undecodable entry: {e}");
                        None
                    }
                }
            })
            .filter(|h| h.metadata.source_name == self.source_name.as_str())
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.seq.cmp(&b.seq)));
        hits.truncate(top_k);
        Ok(hits)
    }

    /// Delete every entry of `file_path` for this source.
    ///
    /// # Errors
    ///
    /// Returns `Store` if the delete fails.
    pub async fn remove_file(&self, file_path: &str) -> Result<()> {
        let filter = self.scope().and_text_eq(FILE_FIELD, file_path);
        self.store.delete_by_filter(&self.name, filter).await?;
        Ok(())
    }

    /// Reload this collection from shared storage. Writers call it once they
    /// hold the store lock.
    ///
    /// # Errors
    ///
    /// Returns `Store` if the backend cannot re-read its data.
    pub async fn refresh(&self) -> Result<()> {
        self.store.refresh(&self.name).await?;
        Ok(())
    }

    /// Number of entries belonging to this source.
    ///
    /// # Errors
    ///
    /// Returns `Store` if counting fails.
    pub async fn count(&self) -> Result<u64> {
        Ok(self.store.count(&self.name, Some(self.scope())).await?)
    }

    /// Delete every entry of this source, leaving other sources untouched.
    ///
    /// # Errors
    ///
    /// Returns `Store` if the delete fails.
    pub async fn clear(&self) -> Result<()> {
        self.store.delete_by_filter(&self.name, self.scope()).await?;
        Ok(())
    }

    /// Drop the physical collection, including other sources' entries.
    ///
    /// # Errors
    ///
    /// Returns `Store` if the delete fails.
    pub async fn drop_collection(self) -> Result<()> {
        self.store.delete_collection(&self.name).await?;
        Ok(())
    }
}
