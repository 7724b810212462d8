use crate::error::{EmbedError, FetchError, IndexError, StoreError};
use crate::models::{Document, EmbeddingRecord, QueryFilters, SearchHit, UpsertOutcome};
use async_trait::async_trait;
use std::collections::HashMap;

/// Raw document transport. Network and HTTP failures surface as
/// [`FetchError`]; retry policy belongs to the caller.
#[async_trait]
pub trait Fetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// Turns text into fixed-dimension vectors under a pinned model identity.
///
/// `embed` is order preserving: `output[i]` corresponds to `texts[i]` even
/// when the implementation batches internally. For a fixed model and input,
/// successive calls return vectors equal within the model's numeric
/// tolerance, not necessarily bit-exact.
#[async_trait]
pub trait Embedder {
    fn model_id(&self) -> &str;
    fn dimension(&self) -> usize;
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;
}

/// Durable relational store of documents; the source of truth for "have we
/// seen this paper".
#[async_trait]
pub trait MetadataStore {
    /// Inserts when `external_id` is absent, replaces the row only when the
    /// incoming `content_hash` differs, and is otherwise a no-op. Atomic per
    /// document.
    async fn upsert(&self, document: &Document) -> Result<UpsertOutcome, StoreError>;

    async fn get_by_external_id(&self, external_id: &str)
        -> Result<Option<Document>, StoreError>;

    /// Batch lookup for result hydration; ids with no row are omitted from
    /// the map, never an error.
    async fn get_many(
        &self,
        external_ids: &[String],
    ) -> Result<HashMap<String, Document>, StoreError>;
}

/// Durable similarity-search store, namespaced per `model_id` so vectors
/// from different models are never compared.
#[async_trait]
pub trait VectorIndex {
    /// Replaces any existing vector for the record's
    /// `(document_id, model_id)` pair, so content updates never create
    /// duplicate neighbors. The document supplies the scalar payload used by
    /// search filters.
    async fn upsert_vector(
        &self,
        record: &EmbeddingRecord,
        document: &Document,
    ) -> Result<(), IndexError>;

    /// Top-k nearest neighbors by descending similarity, at most `top_k`
    /// hits. A vector of the wrong length for `model_id` is
    /// [`IndexError::DimensionMismatch`].
    async fn search(
        &self,
        query_vector: &[f32],
        model_id: &str,
        top_k: usize,
        filters: &QueryFilters,
    ) -> Result<Vec<SearchHit>, IndexError>;
}
