//! Qdrant-backed [`VectorStore`].

use std::collections::HashMap;

use qdrant_client::Qdrant;
use qdrant_client::qdrant::{
    Condition, CountPointsBuilder, CreateCollectionBuilder, CreateFieldIndexCollectionBuilder,
    DeletePointsBuilder, Distance, FieldType, Filter, PointStruct, ScoredPoint,
    SearchPointsBuilder, UpsertPointsBuilder, VectorParamsBuilder, point_id::PointIdOptions,
    value::Kind,
};

use crate::vector_store::{
    BoxFuture, FieldCondition, FieldValue, Payload, ScoredVectorPoint, VectorFilter, VectorPoint,
    VectorStore, VectorStoreError,
};

/// Payload fields that get a keyword index on collection creation.
const INDEXED_FIELDS: &[&str] = &["source_name", "file_path"];

#[derive(Clone)]
pub struct QdrantStore {
    client: Qdrant,
}

impl std::fmt::Debug for QdrantStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QdrantStore").finish_non_exhaustive()
    }
}

impl QdrantStore {
    /// # Errors
    ///
    /// Returns `VectorStoreError::Connection` if the client cannot be built from `url`.
    pub fn new(url: &str) -> Result<Self, VectorStoreError> {
        let client = Qdrant::from_url(url)
            .build()
            .map_err(|e| VectorStoreError::Connection(e.to_string()))?;
        Ok(Self { client })
    }

    async fn create_with_indexes(
        &self,
        collection: &str,
        vector_size: u64,
    ) -> Result<(), qdrant_client::QdrantError> {
        self.client
            .create_collection(
                CreateCollectionBuilder::new(collection)
                    .vectors_config(VectorParamsBuilder::new(vector_size, Distance::Cosine)),
            )
            .await?;
        for field in INDEXED_FIELDS {
            self.client
                .create_field_index(
                    CreateFieldIndexCollectionBuilder::new(collection, *field, FieldType::Keyword)
                        .wait(true),
                )
                .await?;
        }
        Ok(())
    }
}

impl VectorStore for QdrantStore {
    fn ensure_collection(
        &self,
        collection: &str,
        vector_size: u64,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            let exists = self
                .client
                .collection_exists(&collection)
                .await
                .map_err(|e| VectorStoreError::Connection(e.to_string()))?;
            if exists {
                return Ok(());
            }
            tracing::info!(%collection, vector_size, "creating qdrant collection");
            self.create_with_indexes(&collection, vector_size)
                .await
                .map_err(|e| VectorStoreError::Collection(e.to_string()))
        })
    }

    fn collection_exists(&self, collection: &str) -> BoxFuture<'_, Result<bool, VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            self.client
                .collection_exists(&collection)
                .await
                .map_err(|e| VectorStoreError::Connection(e.to_string()))
        })
    }

    fn delete_collection(&self, collection: &str) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            self.client
                .delete_collection(&collection)
                .await
                .map_err(|e| VectorStoreError::Collection(e.to_string()))?;
            Ok(())
        })
    }

    fn upsert(
        &self,
        collection: &str,
        points: Vec<VectorPoint>,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            if points.is_empty() {
                return Ok(());
            }
            let qdrant_points = points
                .into_iter()
                .map(|p| {
                    let payload = payload_to_qdrant(p.payload)?;
                    Ok(PointStruct::new(p.id, p.vector, payload))
                })
                .collect::<Result<Vec<_>, VectorStoreError>>()?;
            self.client
                .upsert_points(UpsertPointsBuilder::new(&collection, qdrant_points).wait(true))
                .await
                .map_err(|e| VectorStoreError::Upsert(e.to_string()))?;
            Ok(())
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
            let mut builder =
                SearchPointsBuilder::new(&collection, vector, limit).with_payload(true);
            if let Some(f) = filter {
                builder = builder.filter(vector_filter_to_qdrant(f));
            }
            let results = self
                .client
                .search_points(builder)
                .await
                .map_err(|e| VectorStoreError::Search(e.to_string()))?;
            Ok(results.result.into_iter().map(scored_point_to_vector).collect())
        })
    }

    fn delete_by_filter(
        &self,
        collection: &str,
        filter: VectorFilter,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            self.client
                .delete_points(
                    DeletePointsBuilder::new(&collection)
                        .points(vector_filter_to_qdrant(filter))
                        .wait(true),
                )
                .await
                .map_err(|e| VectorStoreError::Delete(e.to_string()))?;
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
            let mut builder = CountPointsBuilder::new(&collection).exact(true);
            if let Some(f) = filter {
                builder = builder.filter(vector_filter_to_qdrant(f));
            }
            let response = self
                .client
                .count(builder)
                .await
                .map_err(|e| VectorStoreError::Count(e.to_string()))?;
            Ok(response.result.map_or(0, |r| r.count))
        })
    }
}

fn payload_to_qdrant(
    payload: Payload,
) -> Result<HashMap<String, qdrant_client::qdrant::Value>, VectorStoreError> {
    serde_json::from_value(serde_json::Value::Object(payload.into_iter().collect()))
        .map_err(|e| VectorStoreError::Serialization(e.to_string()))
}

fn vector_filter_to_qdrant(filter: VectorFilter) -> Filter {
    Filter {
        must: filter.must.into_iter().map(field_condition_to_qdrant).collect(),
        must_not: filter
            .must_not
            .into_iter()
            .map(field_condition_to_qdrant)
            .collect(),
        ..Filter::default()
    }
}

fn field_condition_to_qdrant(cond: FieldCondition) -> Condition {
    match cond.value {
        FieldValue::Integer(v) => Condition::matches(cond.field, v),
        FieldValue::Text(v) => Condition::matches(cond.field, v),
    }
}

fn scored_point_to_vector(point: ScoredPoint) -> ScoredVectorPoint {
    let payload: Payload = point
        .payload
        .into_iter()
        .filter_map(|(k, v)| {
            let json_val = match v.kind? {
                Kind::StringValue(s) => serde_json::Value::String(s),
                Kind::IntegerValue(i) => serde_json::Value::Number(i.into()),
                Kind::DoubleValue(d) => {
                    serde_json::Number::from_f64(d).map(serde_json::Value::Number)?
                }
                Kind::BoolValue(b) => serde_json::Value::Bool(b),
                _ => return None,
            };
            Some((k, json_val))
        })
        .collect();

    let id = match point.id.and_then(|pid| pid.point_id_options) {
        Some(PointIdOptions::Uuid(u)) => u,
        Some(PointIdOptions::Num(n)) => n.to_string(),
        None => String::new(),
    };

    ScoredVectorPoint {
        id,
        score: point.score,
        payload,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn valid_url_builds_client() {
        assert!(QdrantStore::new("http://localhost:6334").is_ok());
    }

    #[test]
    fn invalid_url_is_connection_error() {
        let err = QdrantStore::new("not a valid url").unwrap_err();
        assert!(matches!(err, VectorStoreError::Connection(_)));
    }

    #[test]
    fn debug_hides_client() {
        let store = QdrantStore::new("http://localhost:6334").unwrap();
        assert_eq!(format!("{store:?}"), "QdrantStore { .. }");
    }

    #[test]
    fn filter_conversion_keeps_conditions() {
        let f = VectorFilter::text_eq("source_name", "abc").and_text_eq("file_path", "a.py");
        let q = vector_filter_to_qdrant(f);
        assert_eq!(q.must.len(), 2);
        assert!(q.must_not.is_empty());
    }

    #[test]
    fn payload_conversion_accepts_mixed_values() {
        let payload: Payload = [
            ("text".to_owned(), json!("fn main() {}")),
            ("chunk_index".to_owned(), json!(3)),
            ("language".to_owned(), json!(null)),
        ]
        .into();
        let converted = payload_to_qdrant(payload).unwrap();
        assert_eq!(converted.len(), 3);
    }

    #[test]
    fn scored_point_round_trips_payload_kinds() {
        let mut payload = HashMap::new();
        payload.insert("file_path".to_owned(), qdrant_client::qdrant::Value::from("a.py"));
        payload.insert("line_start".to_owned(), qdrant_client::qdrant::Value::from(4_i64));
        let point = ScoredPoint {
            id: Some(qdrant_client::qdrant::PointId::from("6b1e2d4c-0000-5000-8000-000000000000")),
            payload,
            score: 0.5,
            ..ScoredPoint::default()
        };
        let v = scored_point_to_vector(point);
        assert_eq!(v.id, "6b1e2d4c-0000-5000-8000-000000000000");
        assert_eq!(v.payload["file_path"], "a.py");
        assert_eq!(v.payload["line_start"], 4);
    }
}
