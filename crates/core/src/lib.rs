pub mod embedder;
pub mod error;
pub mod feed;
pub mod ingest;
pub mod models;
pub mod normalize;
pub mod query;
pub mod stores;
pub mod traits;

pub use embedder::{HashEmbedder, OpenAiEmbedder, DEFAULT_DIMENSION, DEFAULT_MODEL_ID};
pub use error::{
    EmbedError, FeedError, FetchError, IndexError, IngestError, NormalizeError, QueryError,
    StoreError,
};
pub use feed::{arxiv_feed_url, parse_feed, FeedEntry, HttpFetcher};
pub use ingest::{CancelHandle, IngestPipeline};
pub use models::{
    Category, Document, EmbeddingRecord, EntryFailure, EntryOutcome, IngestOptions,
    IngestionReport, QueryFilters, ResultItem, SearchHit, Stage, UpsertOutcome,
};
pub use normalize::{content_hash, normalize, normalize_whitespace, strip_html};
pub use query::{QueryEngine, QueryOutcome};
pub use stores::{QdrantStore, SqliteStore};
pub use traits::{Embedder, Fetcher, MetadataStore, VectorIndex};
