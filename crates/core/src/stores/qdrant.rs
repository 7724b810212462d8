//! Qdrant-backed vector index over its HTTP API. Collections are namespaced
//! per embedding model so vectors from different models never meet in one
//! nearest-neighbor comparison.

use crate::error::IndexError;
use crate::models::{Document, EmbeddingRecord, QueryFilters, SearchHit};
use crate::traits::VectorIndex;
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use uuid::Uuid;

pub struct QdrantStore {
    endpoint: String,
    collection_prefix: String,
    client: Client,
    dimension: usize,
}

impl QdrantStore {
    pub fn new(
        endpoint: impl Into<String>,
        collection_prefix: impl Into<String>,
        dimension: usize,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            collection_prefix: collection_prefix.into(),
            client: Client::new(),
            dimension,
        }
    }

    fn collection_for(&self, model_id: &str) -> String {
        let sanitized: String = model_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        format!("{}_{}", self.collection_prefix, sanitized)
    }

    /// Creates the model's collection with cosine distance if it does not
    /// exist yet. An already-existing collection is not an error.
    pub async fn ensure_collection(&self, model_id: &str) -> Result<(), IndexError> {
        let response = self
            .client
            .put(format!(
                "{}/collections/{}",
                self.endpoint,
                self.collection_for(model_id)
            ))
            .json(&json!({
                "vectors": {
                    "size": self.dimension,
                    "distance": "Cosine",
                }
            }))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() || status == StatusCode::CONFLICT {
            return Ok(());
        }

        Err(IndexError::BackendResponse {
            backend: "qdrant".to_string(),
            details: status.to_string(),
        })
    }

    fn check_dimension(&self, actual: usize) -> Result<(), IndexError> {
        if actual != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual,
            });
        }
        Ok(())
    }
}

/// Stable point id per document, so a re-embedded paper replaces its old
/// point instead of adding a duplicate neighbor.
fn point_id(external_id: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, external_id.as_bytes()).to_string()
}

pub fn unit_normalize(vector: &[f32]) -> Vec<f32> {
    let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
    if magnitude == 0.0 {
        return vector.to_vec();
    }
    vector.iter().map(|value| value / magnitude).collect()
}

fn date_as_int(date: NaiveDate) -> i64 {
    date.format("%Y%m%d").to_string().parse().unwrap_or(0)
}

fn build_filter(filters: &QueryFilters) -> Option<Value> {
    if filters.is_empty() {
        return None;
    }

    let mut must = Vec::new();
    for category in &filters.categories {
        must.push(json!({
            "key": "categories",
            "match": { "value": category },
        }));
    }

    if filters.published_after.is_some() || filters.published_before.is_some() {
        let mut range = serde_json::Map::new();
        if let Some(after) = filters.published_after {
            range.insert("gte".to_string(), json!(date_as_int(after)));
        }
        if let Some(before) = filters.published_before {
            range.insert("lte".to_string(), json!(date_as_int(before)));
        }
        must.push(json!({
            "key": "published_at_int",
            "range": Value::Object(range),
        }));
    }

    Some(json!({ "must": must }))
}

#[async_trait]
impl VectorIndex for QdrantStore {
    async fn upsert_vector(
        &self,
        record: &EmbeddingRecord,
        document: &Document,
    ) -> Result<(), IndexError> {
        self.check_dimension(record.vector.len())?;

        let payload = json!({
            "external_id": record.document_id,
            "model_id": record.model_id,
            "categories": document.categories,
            "published_at_int": document.published_at_int(),
            "published_at": document.published_at.to_rfc3339(),
        });

        let response = self
            .client
            .put(format!(
                "{}/collections/{}/points?wait=true",
                self.endpoint,
                self.collection_for(&record.model_id)
            ))
            .json(&json!({
                "points": [{
                    "id": point_id(&record.document_id),
                    "vector": unit_normalize(&record.vector),
                    "payload": payload,
                }]
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(IndexError::BackendResponse {
                backend: "qdrant".to_string(),
                details: response.status().to_string(),
            });
        }

        Ok(())
    }

    async fn search(
        &self,
        query_vector: &[f32],
        model_id: &str,
        top_k: usize,
        filters: &QueryFilters,
    ) -> Result<Vec<SearchHit>, IndexError> {
        self.check_dimension(query_vector.len())?;

        let mut body = json!({
            "vector": unit_normalize(query_vector),
            "limit": top_k,
            "with_payload": true,
        });
        if let Some(filter) = build_filter(filters) {
            body["filter"] = filter;
        }

        let response = self
            .client
            .post(format!(
                "{}/collections/{}/points/search",
                self.endpoint,
                self.collection_for(model_id)
            ))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(IndexError::BackendResponse {
                backend: "qdrant".to_string(),
                details: response.status().to_string(),
            });
        }

        let parsed: Value = response.json().await?;
        let hits = parsed
            .pointer("/result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut result = Vec::new();
        for hit in hits {
            let document_id = hit
                .pointer("/payload/external_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let score = hit.pointer("/score").and_then(Value::as_f64).unwrap_or(0.0) as f32;

            if document_id.is_empty() {
                // A point without its payload cannot be hydrated; skip it
                // rather than fabricating an id.
                continue;
            }

            result.push(SearchHit { document_id, score });
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn sample_document() -> Document {
        Document {
            external_id: "2401.01234".to_string(),
            title: "t".to_string(),
            abstract_text: "a".to_string(),
            authors: Vec::new(),
            categories: vec!["cs.AI".to_string()],
            published_at: Utc.with_ymd_and_hms(2024, 1, 8, 0, 0, 0).unwrap(),
            source_url: String::new(),
            full_text: None,
            content_hash: "h".to_string(),
        }
    }

    #[test]
    fn collection_names_are_sanitized_per_model() {
        let store = QdrantStore::new("http://localhost:6333", "papers", 4);
        assert_eq!(
            store.collection_for("text-embedding-3-small"),
            "papers_text_embedding_3_small"
        );
        assert_eq!(store.collection_for("hash-ngram-v1"), "papers_hash_ngram_v1");
    }

    #[test]
    fn point_ids_are_stable_per_document() {
        assert_eq!(point_id("2401.01234"), point_id("2401.01234"));
        assert_ne!(point_id("2401.01234"), point_id("2401.05678"));
    }

    #[test]
    fn vectors_are_normalized_to_unit_length() {
        let normalized = unit_normalize(&[3.0, 4.0]);
        assert!((normalized[0] - 0.6).abs() < 1e-6);
        assert!((normalized[1] - 0.8).abs() < 1e-6);

        // Zero vectors pass through untouched.
        assert_eq!(unit_normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn filter_is_omitted_when_empty() {
        assert!(build_filter(&QueryFilters::default()).is_none());
    }

    #[test]
    fn filter_combines_categories_and_date_range() {
        let filters = QueryFilters {
            categories: vec!["cs.AI".to_string(), "cs.LG".to_string()],
            published_after: NaiveDate::from_ymd_opt(2024, 1, 1),
            published_before: NaiveDate::from_ymd_opt(2024, 6, 30),
        };

        let filter = build_filter(&filters).expect("filter");
        let must = filter
            .pointer("/must")
            .and_then(Value::as_array)
            .expect("must clauses");

        assert_eq!(must.len(), 3);
        assert_eq!(
            must[0].pointer("/match/value").and_then(Value::as_str),
            Some("cs.AI")
        );
        assert_eq!(
            must[2].pointer("/range/gte").and_then(Value::as_i64),
            Some(20240101)
        );
        assert_eq!(
            must[2].pointer("/range/lte").and_then(Value::as_i64),
            Some(20240630)
        );
    }

    #[tokio::test]
    async fn dimension_mismatch_is_rejected_before_any_request() {
        let store = QdrantStore::new("http://localhost:6333", "papers", 4);
        let record = EmbeddingRecord::new("2401.01234", "hash-ngram-v1", vec![1.0, 0.0]);

        let error = store
            .upsert_vector(&record, &sample_document())
            .await
            .expect_err("wrong dimension must fail");
        assert!(matches!(
            error,
            IndexError::DimensionMismatch {
                expected: 4,
                actual: 2
            }
        ));

        let error = store
            .search(&[1.0], "hash-ngram-v1", 5, &QueryFilters::default())
            .await
            .expect_err("wrong dimension must fail");
        assert!(matches!(error, IndexError::DimensionMismatch { .. }));
    }
}
