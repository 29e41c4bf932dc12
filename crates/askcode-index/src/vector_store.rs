//! Backend-neutral vector store interface.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

#[derive(Debug, thiserror::Error)]
pub enum VectorStoreError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("collection error: {0}")]
    Collection(String),
    #[error("upsert error: {0}")]
    Upsert(String),
    #[error("search error: {0}")]
    Search(String),
    #[error("delete error: {0}")]
    Delete(String),
    #[error("count error: {0}")]
    Count(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("persistence error: {0}")]
    Persist(String),
}

pub type Payload = HashMap<String, serde_json::Value>;

#[derive(Debug, Clone)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: Payload,
}

#[derive(Debug, Clone, Default)]
pub struct VectorFilter {
    pub must: Vec<FieldCondition>,
    pub must_not: Vec<FieldCondition>,
}

impl VectorFilter {
    /// Filter matching points whose `field` equals `value`.
    #[must_use]
    pub fn text_eq(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            must: vec![FieldCondition {
                field: field.into(),
                value: FieldValue::Text(value.into()),
            }],
            must_not: Vec::new(),
        }
    }

    #[must_use]
    pub fn and_text_eq(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.must.push(FieldCondition {
            field: field.into(),
            value: FieldValue::Text(value.into()),
        });
        self
    }

    /// Whether a payload satisfies every condition.
    #[must_use]
    pub fn matches(&self, payload: &Payload) -> bool {
        self.must
            .iter()
            .all(|c| payload.get(&c.field).is_some_and(|v| c.value.matches(v)))
            && !self
                .must_not
                .iter()
                .any(|c| payload.get(&c.field).is_some_and(|v| c.value.matches(v)))
    }
}

#[derive(Debug, Clone)]
pub struct FieldCondition {
    pub field: String,
    pub value: FieldValue,
}

#[derive(Debug, Clone)]
pub enum FieldValue {
    Integer(i64),
    Text(String),
}

impl FieldValue {
    fn matches(&self, val: &serde_json::Value) -> bool {
        match self {
            Self::Integer(i) => val.as_i64() == Some(*i),
            Self::Text(s) => val.as_str() == Some(s.as_str()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScoredVectorPoint {
    pub id: String,
    pub score: f32,
    pub payload: Payload,
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Storage engine for embedded chunks. Implementations must be safe to share
/// behind an `Arc<dyn VectorStore>`.
pub trait VectorStore: Send + Sync {
    /// Create the collection with cosine distance; no-op if it exists.
    fn ensure_collection(
        &self,
        collection: &str,
        vector_size: u64,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>>;

    fn collection_exists(&self, collection: &str) -> BoxFuture<'_, Result<bool, VectorStoreError>>;

    fn delete_collection(&self, collection: &str) -> BoxFuture<'_, Result<(), VectorStoreError>>;

    /// Insert or replace points by id.
    fn upsert(
        &self,
        collection: &str,
        points: Vec<VectorPoint>,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>>;

    /// At most `limit` points by descending similarity.
    fn search(
        &self,
        collection: &str,
        vector: Vec<f32>,
        limit: u64,
        filter: Option<VectorFilter>,
    ) -> BoxFuture<'_, Result<Vec<ScoredVectorPoint>, VectorStoreError>>;

    fn delete_by_filter(
        &self,
        collection: &str,
        filter: VectorFilter,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>>;

    fn count(
        &self,
        collection: &str,
        filter: Option<VectorFilter>,
    ) -> BoxFuture<'_, Result<u64, VectorStoreError>>;

    /// Re-read `collection` from shared storage, discarding any stale
    /// in-process copy. Called after taking the store lock and before
    /// answering a question. No-op for backends without a local copy.
    fn refresh(&self, collection: &str) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let _ = collection;
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn payload(pairs: &[(&str, serde_json::Value)]) -> Payload {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    #[test]
    fn text_filter_matches_exact_value() {
        let f = VectorFilter::text_eq("source_name", "abc");
        assert!(f.matches(&payload(&[("source_name", json!("abc"))])));
        assert!(!f.matches(&payload(&[("source_name", json!("abd"))])));
        assert!(!f.matches(&payload(&[])));
    }

    #[test]
    fn combined_and_negated_conditions() {
        let mut f = VectorFilter::text_eq("source_name", "abc").and_text_eq("file_path", "a.py");
        f.must_not.push(FieldCondition {
            field: "chunk_index".into(),
            value: FieldValue::Integer(0),
        });
        let p = payload(&[
            ("source_name", json!("abc")),
            ("file_path", json!("a.py")),
            ("chunk_index", json!(1)),
        ]);
        assert!(f.matches(&p));
        let p0 = payload(&[
            ("source_name", json!("abc")),
            ("file_path", json!("a.py")),
            ("chunk_index", json!(0)),
        ]);
        assert!(!f.matches(&p0));
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(VectorFilter::default().matches(&payload(&[])));
    }
}
