use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub const ARXIV_BASE_URL: &str = "https://arxiv.org";

/// Canonical normalized record of one paper. `external_id` is the arXiv id
/// (e.g. `2401.01234`) and is globally unique in the metadata store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub external_id: String,
    pub title: String,
    pub abstract_text: String,
    pub authors: Vec<String>,
    pub categories: Vec<String>,
    pub published_at: DateTime<Utc>,
    pub source_url: String,
    pub full_text: Option<String>,
    pub content_hash: String,
}

impl Document {
    pub fn summary_url(&self) -> String {
        format!("{ARXIV_BASE_URL}/abs/{}", self.external_id)
    }

    pub fn pdf_url(&self) -> String {
        format!("{ARXIV_BASE_URL}/pdf/{}", self.external_id)
    }

    pub fn html_url(&self) -> String {
        format!("{ARXIV_BASE_URL}/html/{}", self.external_id)
    }

    /// Published date as an integer in `YYYYMMDD` form, stored alongside the
    /// vector so the index can apply range filters on a scalar.
    pub fn published_at_int(&self) -> i64 {
        self.published_at
            .format("%Y%m%d")
            .to_string()
            .parse()
            .unwrap_or(0)
    }

    /// The exact text the embedder sees. `content_hash` is computed over the
    /// same concatenation, so hash equality means embedding equality.
    pub fn embeddable_text(&self) -> String {
        match &self.full_text {
            Some(full_text) => {
                format!("{}\n\n{}\n\n{}", self.title, self.abstract_text, full_text)
            }
            None => format!("{}\n\n{}", self.title, self.abstract_text),
        }
    }
}

/// An arXiv category tag such as `cs.AI` (archive `cs`, subcategory `AI`)
/// or a bare archive such as `math-ph`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Category {
    pub archive: String,
    pub subcategory: Option<String>,
}

impl Category {
    pub fn parse(raw: &str) -> Self {
        let mut parts = raw.splitn(2, '.');
        let archive = parts.next().unwrap_or_default().to_string();
        let subcategory = parts.next().map(str::to_string);
        Self {
            archive,
            subcategory,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.subcategory {
            Some(subcategory) => write!(f, "{}.{}", self.archive, subcategory),
            None => write!(f, "{}", self.archive),
        }
    }
}

/// One vector representation of a Document under one named model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub document_id: String,
    pub model_id: String,
    pub vector: Vec<f32>,
    pub dimension: usize,
}

impl EmbeddingRecord {
    pub fn new(document_id: impl Into<String>, model_id: impl Into<String>, vector: Vec<f32>) -> Self {
        let dimension = vector.len();
        Self {
            document_id: document_id.into(),
            model_id: model_id.into(),
            vector,
            dimension,
        }
    }
}

/// What a metadata-store upsert actually did, so the pipeline can tell
/// dedupe no-ops apart from real writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Optional metadata filters for similarity search. Categories combine with
/// AND; date bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryFilters {
    pub categories: Vec<String>,
    pub published_after: Option<NaiveDate>,
    pub published_before: Option<NaiveDate>,
}

impl QueryFilters {
    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
            && self.published_after.is_none()
            && self.published_before.is_none()
    }
}

/// Raw hit from the vector index, before hydration.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub document_id: String,
    pub score: f32,
}

/// Hydrated query result, ordered by descending similarity.
#[derive(Debug, Clone)]
pub struct ResultItem {
    pub document: Document,
    pub score: f32,
}

/// The pipeline stage at which an entry failed. `Index` failures leave the
/// metadata store updated but the vector index stale; those ids can be
/// replayed through index-only repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Normalize,
    Embed,
    Persist,
    Index,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Normalize => "normalize",
            Stage::Embed => "embed",
            Stage::Persist => "persist",
            Stage::Index => "index",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryFailure {
    /// External id when known, otherwise the entry's position in the feed.
    pub entry: String,
    pub stage: Stage,
    pub reason: String,
}

/// Terminal outcome of one feed entry's pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryOutcome {
    Ingested { external_id: String },
    Skipped { external_id: String },
    Failed(EntryFailure),
}

/// Aggregate outcome of one ingestion run. Always produced, even when every
/// item failed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestionReport {
    pub ingested: usize,
    pub skipped: usize,
    pub failures: Vec<EntryFailure>,
    /// True when the run stopped dispatching entries early, either because a
    /// collaborator became unavailable or the operator cancelled.
    pub aborted: bool,
}

impl IngestionReport {
    pub fn record(&mut self, outcome: EntryOutcome) {
        match outcome {
            EntryOutcome::Ingested { .. } => self.ingested += 1,
            EntryOutcome::Skipped { .. } => self.skipped += 1,
            EntryOutcome::Failed(failure) => self.failures.push(failure),
        }
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    pub fn total(&self) -> usize {
        self.ingested + self.skipped + self.failures.len()
    }
}

#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Worker-pool width for per-entry pipelines.
    pub concurrency: usize,
    /// Retry cap for retryable embedding failures, first attempt included.
    pub max_attempts: u32,
    /// Base delay for exponential backoff between embedding retries.
    pub base_backoff: Duration,
    /// Fetch and extract the linked HTML full text for each paper.
    pub fetch_full_text: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_attempts: 4,
            base_backoff: Duration::from_millis(250),
            fetch_full_text: false,
        }
    }
}
