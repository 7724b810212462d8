//! Embedder implementations: the OpenAI HTTP adapter used in production and
//! a deterministic local hashing embedder for offline use and tests.

use crate::error::EmbedError;
use crate::traits::Embedder;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;

pub const DEFAULT_MODEL_ID: &str = "text-embedding-3-small";
pub const DEFAULT_DIMENSION: usize = 1536;
const OPENAI_EMBEDDINGS_URL: &str = "https://api.openai.com/v1/embeddings";

/// Requests above this size are split into several API calls; results are
/// reassembled by the response's `index` field so callers always see
/// input-order output.
const MAX_BATCH_SIZE: usize = 64;

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

/// Orders one API response by its `index` field and validates count and
/// dimensionality against what was requested.
fn vectors_from_response(
    mut data: Vec<EmbeddingDatum>,
    expected_count: usize,
    expected_dimension: usize,
) -> Result<Vec<Vec<f32>>, EmbedError> {
    if data.len() != expected_count {
        return Err(EmbedError::BackendResponse(format!(
            "expected {expected_count} embeddings, got {}",
            data.len()
        )));
    }

    data.sort_by_key(|datum| datum.index);

    for (position, datum) in data.iter().enumerate() {
        if datum.index != position {
            return Err(EmbedError::BackendResponse(format!(
                "missing or duplicate embedding index {position}"
            )));
        }
        if datum.embedding.len() != expected_dimension {
            return Err(EmbedError::BackendResponse(format!(
                "embedding {position} has dimension {}, expected {expected_dimension}",
                datum.embedding.len()
            )));
        }
    }

    Ok(data.into_iter().map(|datum| datum.embedding).collect())
}

fn check_inputs(texts: &[String]) -> Result<(), EmbedError> {
    for (position, text) in texts.iter().enumerate() {
        if text.trim().is_empty() {
            return Err(EmbedError::EmptyInput(position));
        }
    }
    Ok(())
}

/// OpenAI embeddings API adapter. Model identity and dimensionality are part
/// of the construction contract, never rediscovered at runtime.
pub struct OpenAiEmbedder {
    client: Client,
    endpoint: String,
    api_key: String,
    model_id: String,
    dimension: usize,
}

impl OpenAiEmbedder {
    pub fn new(api_key: impl Into<String>, model_id: impl Into<String>, dimension: usize) -> Self {
        Self {
            client: Client::new(),
            endpoint: OPENAI_EMBEDDINGS_URL.to_string(),
            api_key: api_key.into(),
            model_id: model_id.into(),
            dimension,
        }
    }

    /// Point the adapter at a compatible non-default endpoint (a proxy or a
    /// self-hosted server speaking the same API).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    async fn embed_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model_id,
                "input": batch,
            }))
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(EmbedError::RateLimited);
        }
        if status.is_server_error() {
            return Err(EmbedError::Unavailable(status.to_string()));
        }
        if !status.is_success() {
            return Err(EmbedError::BackendResponse(format!(
                "embedding request failed with {status}"
            )));
        }

        let parsed: EmbeddingsResponse = response.json().await?;
        vectors_from_response(parsed.data, batch.len(), self.dimension)
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        check_inputs(texts)?;

        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(MAX_BATCH_SIZE) {
            vectors.extend(self.embed_batch(batch).await?);
        }
        Ok(vectors)
    }
}

/// Deterministic character-trigram embedder. No network, stable across runs,
/// unit-normalized output; the offline and test stand-in for a remote model.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    model_id: String,
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            model_id: "hash-ngram-v1".to_string(),
            dimension: dimension.max(1),
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimension];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        check_inputs(texts)?;
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }
}

pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    let dot: f32 = left.iter().zip(right).map(|(a, b)| a * b).sum();
    let left_norm: f32 = left.iter().map(|v| v * v).sum::<f32>().sqrt();
    let right_norm: f32 = right.iter().map(|v| v * v).sum::<f32>().sqrt();
    if left_norm == 0.0 || right_norm == 0.0 {
        return 0.0;
    }
    dot / (left_norm * right_norm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_vectors_are_reordered_by_index() {
        // Providers may return batch results out of order; the caller must
        // still see input-order output.
        let data = vec![
            EmbeddingDatum {
                index: 2,
                embedding: vec![3.0, 0.0],
            },
            EmbeddingDatum {
                index: 0,
                embedding: vec![1.0, 0.0],
            },
            EmbeddingDatum {
                index: 1,
                embedding: vec![2.0, 0.0],
            },
        ];

        let vectors = vectors_from_response(data, 3, 2).expect("response should parse");
        assert_eq!(vectors[0][0], 1.0);
        assert_eq!(vectors[1][0], 2.0);
        assert_eq!(vectors[2][0], 3.0);
    }

    #[test]
    fn short_or_misindexed_responses_are_rejected() {
        let short = vec![EmbeddingDatum {
            index: 0,
            embedding: vec![1.0],
        }];
        assert!(vectors_from_response(short, 2, 1).is_err());

        let duplicated = vec![
            EmbeddingDatum {
                index: 0,
                embedding: vec![1.0],
            },
            EmbeddingDatum {
                index: 0,
                embedding: vec![2.0],
            },
        ];
        assert!(vectors_from_response(duplicated, 2, 1).is_err());

        let wrong_dim = vec![EmbeddingDatum {
            index: 0,
            embedding: vec![1.0, 2.0],
        }];
        assert!(vectors_from_response(wrong_dim, 1, 3).is_err());
    }

    #[tokio::test]
    async fn hash_embedder_is_deterministic_and_ordered() {
        let embedder = HashEmbedder::new(64);
        let texts = vec![
            "sparse attention".to_string(),
            "entropy bounds".to_string(),
        ];

        let first = embedder.embed(&texts).await.expect("embed");
        let second = embedder.embed(&texts).await.expect("embed");

        assert_eq!(first.len(), 2);
        assert_eq!(first[0].len(), 64);
        assert!(cosine_similarity(&first[0], &second[0]) > 0.999);
        assert!(cosine_similarity(&first[1], &second[1]) > 0.999);
        // Different texts land on different vectors.
        assert!(cosine_similarity(&first[0], &first[1]) < 0.999);
    }

    #[tokio::test]
    async fn empty_input_is_a_permanent_failure() {
        let embedder = HashEmbedder::default();
        let error = embedder
            .embed(&["ok".to_string(), "   ".to_string()])
            .await
            .expect_err("empty input must fail");
        assert!(matches!(error, EmbedError::EmptyInput(1)));
        assert!(!error.is_retryable());
    }

    #[tokio::test]
    async fn hash_embedder_output_is_unit_length() {
        let embedder = HashEmbedder::new(32);
        let vectors = embedder
            .embed(&["some moderately long input text".to_string()])
            .await
            .expect("embed");
        let norm: f32 = vectors[0].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }
}
