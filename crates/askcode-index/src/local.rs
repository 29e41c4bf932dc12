//! In-process vector store with optional JSON snapshots under `.chat/vectors/`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::persist::{read_json, write_json_atomic};
use crate::vector_store::{
    BoxFuture, Payload, ScoredVectorPoint, VectorFilter, VectorPoint, VectorStore,
    VectorStoreError,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredPoint {
    id: String,
    vector: Vec<f32>,
    payload: Payload,
    /// Insertion stamp, used to break score ties.
    seq: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LocalCollection {
    dimension: u64,
    next_seq: u64,
    points: HashMap<String, StoredPoint>,
}

pub struct LocalVectorStore {
    collections: RwLock<HashMap<String, LocalCollection>>,
    snapshot_dir: Option<PathBuf>,
}

impl std::fmt::Debug for LocalVectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalVectorStore")
            .field("snapshot_dir", &self.snapshot_dir)
            .finish_non_exhaustive()
    }
}

impl Default for LocalVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

fn valid_collection_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl LocalVectorStore {
    /// Memory-only store; contents vanish with the process.
    #[must_use]
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            snapshot_dir: None,
        }
    }

    /// Store persisted as one `<collection>.json` snapshot per collection in `dir`.
    ///
    /// Existing snapshots are loaded eagerly.
    ///
    /// # Errors
    ///
    /// Returns `VectorStoreError::Persist` if the directory or a snapshot cannot be read.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, VectorStoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| persist_err(&dir, &e))?;

        let mut collections = HashMap::new();
        let entries = std::fs::read_dir(&dir).map_err(|e| persist_err(&dir, &e))?;
        for entry in entries {
            let path = entry.map_err(|e| persist_err(&dir, &e))?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !valid_collection_name(name) {
                continue;
            }
            let name = name.to_owned();
            if let Some(col) =
                read_json::<LocalCollection>(&path).map_err(|e| persist_err(&path, &e))?
            {
                tracing::debug!(collection = %name, points = col.points.len(), "loaded vector snapshot");
                collections.insert(name, col);
            }
        }

        Ok(Self {
            collections: RwLock::new(collections),
            snapshot_dir: Some(dir),
        })
    }

    fn snapshot_path(&self, collection: &str) -> Option<PathBuf> {
        self.snapshot_dir
            .as_ref()
            .map(|d| d.join(format!("{collection}.json")))
    }

    fn persist(&self, collection: &str, col: &LocalCollection) -> Result<(), VectorStoreError> {
        if let Some(path) = self.snapshot_path(collection) {
            write_json_atomic(&path, col).map_err(|e| persist_err(&path, &e))?;
        }
        Ok(())
    }

    fn remove_snapshot(&self, collection: &str) -> Result<(), VectorStoreError> {
        if let Some(path) = self.snapshot_path(collection) {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(persist_err(&path, &e)),
            }
        }
        Ok(())
    }
}

fn persist_err(path: &Path, e: &std::io::Error) -> VectorStoreError {
    VectorStoreError::Persist(format!("{}: {e}", path.display()))
}

fn missing(collection: &str) -> String {
    format!("collection {collection} not found")
}

impl VectorStore for LocalVectorStore {
    fn ensure_collection(
        &self,
        collection: &str,
        vector_size: u64,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            if !valid_collection_name(&collection) {
                return Err(VectorStoreError::Collection(format!(
                    "invalid collection name {collection:?}"
                )));
            }
            let mut cols = self
                .collections
                .write()
                .map_err(|e| VectorStoreError::Collection(e.to_string()))?;
            if cols.contains_key(&collection) {
                return Ok(());
            }
            let col = LocalCollection {
                dimension: vector_size,
                ..LocalCollection::default()
            };
            self.persist(&collection, &col)?;
            cols.insert(collection, col);
            Ok(())
        })
    }

    fn collection_exists(&self, collection: &str) -> BoxFuture<'_, Result<bool, VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            let cols = self
                .collections
                .read()
                .map_err(|e| VectorStoreError::Collection(e.to_string()))?;
            Ok(cols.contains_key(&collection))
        })
    }

    fn delete_collection(&self, collection: &str) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            let mut cols = self
                .collections
                .write()
                .map_err(|e| VectorStoreError::Collection(e.to_string()))?;
            cols.remove(&collection);
            self.remove_snapshot(&collection)
        })
    }

    fn upsert(
        &self,
        collection: &str,
        points: Vec<VectorPoint>,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            let mut cols = self
                .collections
                .write()
                .map_err(|e| VectorStoreError::Upsert(e.to_string()))?;
            let col = cols
                .get_mut(&collection)
                .ok_or_else(|| VectorStoreError::Upsert(missing(&collection)))?;
            if let Some(bad) = points
                .iter()
                .find(|p| p.vector.len() as u64 != col.dimension)
            {
                return Err(VectorStoreError::Upsert(format!(
                    "point {} has dimension {}, collection expects {}",
                    bad.id,
                    bad.vector.len(),
                    col.dimension
                )));
            }
            for p in points {
                let seq = match col.points.get(&p.id) {
                    Some(existing) => existing.seq,
                    None => {
                        col.next_seq += 1;
                        col.next_seq
                    }
                };
                col.points.insert(
                    p.id.clone(),
                    StoredPoint {
                        id: p.id,
                        vector: p.vector,
                        payload: p.payload,
                        seq,
                    },
                );
            }
            self.persist(&collection, col)
        })
    }

    fn search(
        &self,
        collection: &str,
        vector: Vec<f32>,
        limit: u64,
        filter: Option<VectorFilter>,
    ) -> BoxFuture<'_, Result<Vec<ScoredVectorPoint>, VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            let cols = self
                .collections
                .read()
                .map_err(|e| VectorStoreError::Search(e.to_string()))?;
            let col = cols
                .get(&collection)
                .ok_or_else(|| VectorStoreError::Search(missing(&collection)))?;

            let filter = filter.unwrap_or_default();
            let mut scored: Vec<(&StoredPoint, f32)> = col
                .points
                .values()
                .filter(|sp| filter.matches(&sp.payload))
                .map(|sp| (sp, cosine_similarity(&vector, &sp.vector)))
                .collect();

            scored.sort_by(|(a, sa), (b, sb)| sb.total_cmp(sa).then(a.seq.cmp(&b.seq)));
            scored.truncate(usize::try_from(limit).unwrap_or(usize::MAX));

            Ok(scored
                .into_iter()
                .map(|(sp, score)| ScoredVectorPoint {
                    id: sp.id.clone(),
                    score,
                    payload: sp.payload.clone(),
                })
                .collect())
        })
    }

    fn delete_by_filter(
        &self,
        collection: &str,
        filter: VectorFilter,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            let mut cols = self
                .collections
                .write()
                .map_err(|e| VectorStoreError::Delete(e.to_string()))?;
            let col = cols
                .get_mut(&collection)
                .ok_or_else(|| VectorStoreError::Delete(missing(&collection)))?;
            let before = col.points.len();
            col.points.retain(|_, sp| !filter.matches(&sp.payload));
            if col.points.len() != before {
                self.persist(&collection, col)?;
            }
            Ok(())
        })
    }

    fn count(
        &self,
        collection: &str,
        filter: Option<VectorFilter>,
    ) -> BoxFuture<'_, Result<u64, VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            let cols = self
                .collections
                .read()
                .map_err(|e| VectorStoreError::Count(e.to_string()))?;
            let col = cols
                .get(&collection)
                .ok_or_else(|| VectorStoreError::Count(missing(&collection)))?;
            let filter = filter.unwrap_or_default();
            let n = col
                .points
                .values()
                .filter(|sp| filter.matches(&sp.payload))
                .count();
            Ok(n as u64)
        })
    }

    fn refresh(&self, collection: &str) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            let Some(path) = self.snapshot_path(&collection) else {
                return Ok(());
            };
            let on_disk =
                read_json::<LocalCollection>(&path).map_err(|e| persist_err(&path, &e))?;
            let mut cols = self
                .collections
                .write()
                .map_err(|e| VectorStoreError::Collection(e.to_string()))?;
            match on_disk {
                Some(col) => {
                    tracing::debug!(collection = %collection, points = col.points.len(), "reloaded vector snapshot");
                    cols.insert(collection, col);
                }
                // Dropped by another process: keep the shape so later upserts
                // recreate the snapshot, but none of the stale points.
                None => {
                    if let Some(col) = cols.get_mut(&collection) {
                        col.points.clear();
                    }
                }
            }
            Ok(())
        })
    }
}
