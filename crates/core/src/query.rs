//! The query path: embed the question, search the vector index, hydrate
//! hits from the metadata store, and return ranked results.

use crate::error::{EmbedError, QueryError};
use crate::models::{QueryFilters, ResultItem};
use crate::traits::{Embedder, MetadataStore, VectorIndex};
use std::collections::HashSet;
use tracing::warn;

/// A query's ranked results plus the number of hits dropped because their
/// metadata row was gone (index/metadata drift).
#[derive(Debug, Clone, Default)]
pub struct QueryOutcome {
    pub items: Vec<ResultItem>,
    pub dropped: usize,
}

pub struct QueryEngine<E, M, V> {
    embedder: E,
    metadata: M,
    index: V,
}

impl<E, M, V> QueryEngine<E, M, V>
where
    E: Embedder + Send + Sync,
    M: MetadataStore + Send + Sync,
    V: VectorIndex + Send + Sync,
{
    pub fn new(embedder: E, metadata: M, index: V) -> Self {
        Self {
            embedder,
            metadata,
            index,
        }
    }

    /// Answers `text` with at most `top_k` documents, ordered by descending
    /// similarity. Embedding failures propagate; zero hits is an empty
    /// result, not an error; drift during hydration is dropped and counted.
    pub async fn query(
        &self,
        text: &str,
        top_k: usize,
        filters: &QueryFilters,
    ) -> Result<QueryOutcome, QueryError> {
        if text.trim().is_empty() {
            return Err(QueryError::EmptyQuery);
        }

        let mut vectors = self.embedder.embed(&[text.to_string()]).await?;
        if vectors.is_empty() {
            return Err(QueryError::Embed(EmbedError::BackendResponse(
                "embedder returned no vector".to_string(),
            )));
        }
        let query_vector = vectors.swap_remove(0);

        let hits = self
            .index
            .search(&query_vector, self.embedder.model_id(), top_k, filters)
            .await?;
        if hits.is_empty() {
            return Ok(QueryOutcome::default());
        }

        let ids: Vec<String> = hits.iter().map(|hit| hit.document_id.clone()).collect();
        let documents = self.metadata.get_many(&ids).await?;

        let mut items = Vec::with_capacity(hits.len());
        let mut seen = HashSet::new();
        let mut dropped = 0usize;

        for hit in hits {
            if !seen.insert(hit.document_id.clone()) {
                continue;
            }
            match documents.get(&hit.document_id) {
                Some(document) => items.push(ResultItem {
                    document: document.clone(),
                    score: hit.score,
                }),
                None => dropped += 1,
            }
        }

        if dropped > 0 {
            warn!(dropped, "dropped hits whose metadata rows are missing");
        }

        Ok(QueryOutcome { items, dropped })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::{cosine_similarity, HashEmbedder};
    use crate::error::{IndexError, StoreError};
    use crate::models::{Document, EmbeddingRecord, SearchHit, UpsertOutcome};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    fn sample_document(external_id: &str, title: &str) -> Document {
        Document {
            external_id: external_id.to_string(),
            title: title.to_string(),
            abstract_text: format!("Abstract of {title}."),
            authors: vec!["A. Author".to_string()],
            categories: vec!["cs.AI".to_string()],
            published_at: Utc.with_ymd_and_hms(2024, 1, 8, 0, 0, 0).unwrap(),
            source_url: format!("https://arxiv.org/abs/{external_id}"),
            full_text: None,
            content_hash: format!("hash-{external_id}"),
        }
    }

    #[derive(Clone, Default)]
    struct MemoryStore {
        rows: Arc<Mutex<HashMap<String, Document>>>,
    }

    impl MemoryStore {
        fn with(documents: &[Document]) -> Self {
            let store = Self::default();
            {
                let mut rows = store.rows.lock().unwrap();
                for document in documents {
                    rows.insert(document.external_id.clone(), document.clone());
                }
            }
            store
        }
    }

    #[async_trait]
    impl MetadataStore for MemoryStore {
        async fn upsert(&self, document: &Document) -> Result<UpsertOutcome, StoreError> {
            self.rows
                .lock()
                .unwrap()
                .insert(document.external_id.clone(), document.clone());
            Ok(UpsertOutcome::Inserted)
        }

        async fn get_by_external_id(
            &self,
            external_id: &str,
        ) -> Result<Option<Document>, StoreError> {
            Ok(self.rows.lock().unwrap().get(external_id).cloned())
        }

        async fn get_many(
            &self,
            external_ids: &[String],
        ) -> Result<HashMap<String, Document>, StoreError> {
            let rows = self.rows.lock().unwrap();
            Ok(external_ids
                .iter()
                .filter_map(|id| rows.get(id).map(|doc| (id.clone(), doc.clone())))
                .collect())
        }
    }

    /// Real cosine ranking over a fixed set of vectors, insertion-ordered
    /// for deterministic ties.
    #[derive(Clone, Default)]
    struct CosineIndex {
        points: Arc<Mutex<Vec<(String, Vec<f32>)>>>,
    }

    impl CosineIndex {
        fn with(points: Vec<(String, Vec<f32>)>) -> Self {
            Self {
                points: Arc::new(Mutex::new(points)),
            }
        }
    }

    #[async_trait]
    impl VectorIndex for CosineIndex {
        async fn upsert_vector(
            &self,
            record: &EmbeddingRecord,
            _document: &Document,
        ) -> Result<(), IndexError> {
            self.points
                .lock()
                .unwrap()
                .push((record.document_id.clone(), record.vector.clone()));
            Ok(())
        }

        async fn search(
            &self,
            query_vector: &[f32],
            _model_id: &str,
            top_k: usize,
            _filters: &QueryFilters,
        ) -> Result<Vec<SearchHit>, IndexError> {
            let points = self.points.lock().unwrap();
            let mut hits: Vec<SearchHit> = points
                .iter()
                .map(|(id, vector)| SearchHit {
                    document_id: id.clone(),
                    score: cosine_similarity(query_vector, vector),
                })
                .collect();
            hits.sort_by(|a, b| b.score.total_cmp(&a.score));
            hits.truncate(top_k);
            Ok(hits)
        }
    }

    async fn embed_one(embedder: &HashEmbedder, text: &str) -> Vec<f32> {
        embedder
            .embed(&[text.to_string()])
            .await
            .expect("embed")
            .swap_remove(0)
    }

    #[tokio::test]
    async fn results_follow_index_ranking_with_exact_match_first() {
        let embedder = HashEmbedder::new(64);
        let attention = embed_one(&embedder, "sparse attention for transformers").await;
        let entropy = embed_one(&embedder, "entropy bounds in information theory").await;
        let proteins = embed_one(&embedder, "protein folding dynamics").await;

        let index = CosineIndex::with(vec![
            ("entropy".to_string(), entropy),
            ("attention".to_string(), attention),
            ("proteins".to_string(), proteins),
        ]);
        let store = MemoryStore::with(&[
            sample_document("attention", "Sparse Attention"),
            sample_document("entropy", "Entropy Bounds"),
            sample_document("proteins", "Protein Folding"),
        ]);
        let engine = QueryEngine::new(embedder, store, index);

        let outcome = engine
            .query(
                "sparse attention for transformers",
                5,
                &QueryFilters::default(),
            )
            .await
            .expect("query");

        assert_eq!(outcome.items.len(), 3);
        assert_eq!(outcome.items[0].document.external_id, "attention");
        // A query identical to a stored vector scores at the metric maximum.
        assert!(outcome.items[0].score > 0.999);
        // Descending similarity throughout.
        assert!(outcome.items[0].score >= outcome.items[1].score);
        assert!(outcome.items[1].score >= outcome.items[2].score);
        assert_eq!(outcome.dropped, 0);
    }

    #[tokio::test]
    async fn empty_index_yields_empty_results_not_an_error() {
        let engine = QueryEngine::new(
            HashEmbedder::new(64),
            MemoryStore::default(),
            CosineIndex::default(),
        );

        let outcome = engine
            .query("obscure nonsense text", 5, &QueryFilters::default())
            .await
            .expect("query");

        assert!(outcome.items.is_empty());
        assert_eq!(outcome.dropped, 0);
    }

    #[tokio::test]
    async fn drifted_hits_are_dropped_silently_and_counted() {
        let embedder = HashEmbedder::new(64);
        let known = embed_one(&embedder, "known paper").await;
        let ghost = embed_one(&embedder, "ghost paper").await;

        let index = CosineIndex::with(vec![
            ("known".to_string(), known),
            ("ghost".to_string(), ghost),
        ]);
        // Only "known" has a metadata row.
        let store = MemoryStore::with(&[sample_document("known", "Known Paper")]);
        let engine = QueryEngine::new(embedder, store, index);

        let outcome = engine
            .query("known paper", 5, &QueryFilters::default())
            .await
            .expect("query");

        assert_eq!(outcome.items.len(), 1);
        assert_eq!(outcome.items[0].document.external_id, "known");
        assert_eq!(outcome.dropped, 1);
    }

    #[tokio::test]
    async fn duplicate_hits_are_deduplicated_without_counting_as_drift() {
        #[derive(Clone)]
        struct RepeatingIndex;

        #[async_trait]
        impl VectorIndex for RepeatingIndex {
            async fn upsert_vector(
                &self,
                _record: &EmbeddingRecord,
                _document: &Document,
            ) -> Result<(), IndexError> {
                Ok(())
            }

            async fn search(
                &self,
                _query_vector: &[f32],
                _model_id: &str,
                _top_k: usize,
                _filters: &QueryFilters,
            ) -> Result<Vec<SearchHit>, IndexError> {
                Ok(vec![
                    SearchHit {
                        document_id: "dup".to_string(),
                        score: 0.9,
                    },
                    SearchHit {
                        document_id: "dup".to_string(),
                        score: 0.8,
                    },
                ])
            }
        }

        let store = MemoryStore::with(&[sample_document("dup", "Duplicated")]);
        let engine = QueryEngine::new(HashEmbedder::new(16), store, RepeatingIndex);

        let outcome = engine
            .query("anything", 5, &QueryFilters::default())
            .await
            .expect("query");

        assert_eq!(outcome.items.len(), 1);
        assert_eq!(outcome.dropped, 0);
    }

    #[tokio::test]
    async fn empty_query_text_is_rejected() {
        let engine = QueryEngine::new(
            HashEmbedder::new(16),
            MemoryStore::default(),
            CosineIndex::default(),
        );

        assert!(matches!(
            engine.query("   ", 5, &QueryFilters::default()).await,
            Err(QueryError::EmptyQuery)
        ));
    }

    #[tokio::test]
    async fn embedding_failures_propagate() {
        struct BrokenEmbedder;

        #[async_trait]
        impl Embedder for BrokenEmbedder {
            fn model_id(&self) -> &str {
                "broken"
            }

            fn dimension(&self) -> usize {
                4
            }

            async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
                Err(EmbedError::RateLimited)
            }
        }

        let engine = QueryEngine::new(BrokenEmbedder, MemoryStore::default(), CosineIndex::default());

        assert!(matches!(
            engine
                .query("anything", 5, &QueryFilters::default())
                .await,
            Err(QueryError::Embed(EmbedError::RateLimited))
        ));
    }
}
