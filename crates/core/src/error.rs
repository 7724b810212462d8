use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("unexpected status {status} fetching {url}")]
    Status { url: String, status: u16 },
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("xml error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("feed is not valid utf-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),

    #[error("malformed feed: {0}")]
    Malformed(String),
}

/// Permanent per-item failures; never retried.
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("feed entry is missing required field {0:?}")]
    MissingField(&'static str),

    #[error("malformed external id: {0:?}")]
    MalformedId(String),

    #[error("malformed published date: {0:?}")]
    MalformedDate(String),
}

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("embedding service rate limited the request")]
    RateLimited,

    #[error("embedding service unavailable: {0}")]
    Unavailable(String),

    #[error("cannot embed empty input at position {0}")]
    EmptyInput(usize),

    #[error("invalid response from embedding service: {0}")]
    BackendResponse(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl EmbedError {
    /// Rate limits, outages, and transport timeouts are worth retrying with
    /// backoff; everything else is permanent for the input.
    pub fn is_retryable(&self) -> bool {
        match self {
            EmbedError::RateLimited | EmbedError::Unavailable(_) => true,
            EmbedError::Http(error) => error.is_timeout() || error.is_connect(),
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("metadata store unavailable: {0}")]
    Unavailable(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt row for {external_id}: {details}")]
    Corrupt { external_id: String, details: String },
}

impl StoreError {
    /// Connectivity-class failures abort the rest of an ingestion run;
    /// row-level failures stay scoped to one entry.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("vector dimension {actual} does not match configured dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Run-level ingestion failures. Per-item failures never surface here; they
/// are recorded in the run report instead.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("feed fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("feed parse failed: {0}")]
    Feed(#[from] FeedError),
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("query text is empty")]
    EmptyQuery,

    #[error("query embedding failed: {0}")]
    Embed(#[from] EmbedError),

    #[error("vector search failed: {0}")]
    Index(#[from] IndexError),

    #[error("metadata lookup failed: {0}")]
    Store(#[from] StoreError),
}
