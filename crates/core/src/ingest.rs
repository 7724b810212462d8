//! The ingestion pipeline: fetch -> normalize -> dedupe-check -> embed ->
//! persist -> index, per feed entry, with bounded concurrency across
//! entries. One bad item never aborts a run; only collaborator-wide
//! failures do.

use crate::error::{EmbedError, IngestError};
use crate::feed::{parse_feed, FeedEntry};
use crate::models::{
    EmbeddingRecord, EntryFailure, EntryOutcome, IngestOptions, IngestionReport, Stage,
};
use crate::normalize::normalize;
use crate::traits::{Embedder, Fetcher, MetadataStore, VectorIndex};
use rand::Rng;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Cooperative run-level cancellation: stops dispatching new entries while
/// letting in-flight entries reach a terminal state.
#[derive(Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct IngestPipeline<F, E, M, V> {
    inner: Arc<PipelineInner<F, E, M, V>>,
    cancel: CancelHandle,
}

struct PipelineInner<F, E, M, V> {
    fetcher: F,
    embedder: E,
    metadata: M,
    index: V,
    options: IngestOptions,
}

impl<F, E, M, V> IngestPipeline<F, E, M, V>
where
    F: Fetcher + Send + Sync + 'static,
    E: Embedder + Send + Sync + 'static,
    M: MetadataStore + Send + Sync + 'static,
    V: VectorIndex + Send + Sync + 'static,
{
    pub fn new(fetcher: F, embedder: E, metadata: M, index: V, options: IngestOptions) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                fetcher,
                embedder,
                metadata,
                index,
                options,
            }),
            cancel: CancelHandle::default(),
        }
    }

    /// Handle for operator-initiated cancellation of a running ingestion.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Runs one ingestion pass over the feed at `feed_url`. Feed fetch and
    /// parse failures abort the run; everything after that is per-entry and
    /// lands in the report.
    pub async fn run(&self, feed_url: &str) -> Result<IngestionReport, IngestError> {
        let bytes = self.inner.fetcher.fetch(feed_url).await?;
        let entries = parse_feed(&bytes)?;
        info!(feed_url, entries = entries.len(), "starting ingestion run");

        let semaphore = Arc::new(Semaphore::new(self.inner.options.concurrency.max(1)));
        let mut tasks: JoinSet<EntryOutcome> = JoinSet::new();

        for (position, entry) in entries.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                break;
            }
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            if self.cancel.is_cancelled() {
                break;
            }

            let inner = Arc::clone(&self.inner);
            let cancel = self.cancel.clone();
            tasks.spawn(async move {
                let outcome = process_entry(&inner, &cancel, entry, position).await;
                drop(permit);
                outcome
            });
        }

        // The join point is the single place the aggregate report mutates.
        let mut report = IngestionReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => report.record(outcome),
                Err(join_error) => error!(%join_error, "ingestion worker failed to complete"),
            }
        }
        report.aborted = self.cancel.is_cancelled();

        info!(
            ingested = report.ingested,
            skipped = report.skipped,
            failed = report.failed(),
            aborted = report.aborted,
            "ingestion run complete"
        );
        Ok(report)
    }

    /// Index-only recovery for documents whose earlier run ended at the
    /// `index` stage: re-embeds the persisted document and replays the
    /// vector upsert, without touching the metadata row.
    pub async fn repair_index(&self, external_ids: &[String]) -> IngestionReport {
        let mut report = IngestionReport::default();

        for external_id in external_ids {
            if self.cancel.is_cancelled() {
                report.aborted = true;
                break;
            }
            report.record(repair_one(&self.inner, external_id).await);
        }

        report
    }
}

async fn process_entry<F, E, M, V>(
    inner: &PipelineInner<F, E, M, V>,
    cancel: &CancelHandle,
    entry: FeedEntry,
    position: usize,
) -> EntryOutcome
where
    F: Fetcher + Send + Sync,
    E: Embedder + Send + Sync,
    M: MetadataStore + Send + Sync,
    V: VectorIndex + Send + Sync,
{
    let label = entry
        .id
        .clone()
        .unwrap_or_else(|| format!("entry#{position}"));

    // Normalize metadata first; the full-text URL needs the external id.
    let document = match normalize(&entry, None) {
        Ok(document) => document,
        Err(error) => {
            warn!(entry = %label, %error, "normalization failed, entry skipped permanently");
            return failed(label, Stage::Normalize, error.to_string());
        }
    };

    let document = if inner.options.fetch_full_text {
        match inner.fetcher.fetch(&document.html_url()).await {
            Ok(bytes) => {
                let html = String::from_utf8_lossy(&bytes);
                normalize(&entry, Some(&html)).unwrap_or(document)
            }
            Err(fetch_error) => {
                // Full text is best-effort; the paper still embeds on
                // title + abstract alone.
                debug!(
                    external_id = %document.external_id,
                    %fetch_error,
                    "full text unavailable"
                );
                document
            }
        }
    } else {
        document
    };

    // Dedupe check: the metadata store is the source of truth for prior state.
    match inner.metadata.get_by_external_id(&document.external_id).await {
        Ok(Some(existing)) if existing.content_hash == document.content_hash => {
            debug!(external_id = %document.external_id, "content unchanged, skipping");
            return EntryOutcome::Skipped {
                external_id: document.external_id,
            };
        }
        Ok(_) => {}
        Err(store_error) => {
            if store_error.is_unavailable() {
                cancel.cancel();
            }
            return failed(document.external_id, Stage::Persist, store_error.to_string());
        }
    }

    let texts = vec![document.embeddable_text()];
    let embedded = retry_with_backoff(
        || inner.embedder.embed(&texts),
        inner.options.max_attempts,
        inner.options.base_backoff,
    )
    .await;

    let vector = match embedded {
        Ok(mut vectors) if !vectors.is_empty() => vectors.swap_remove(0),
        Ok(_) => {
            return failed(
                document.external_id,
                Stage::Embed,
                "embedder returned no vector".to_string(),
            )
        }
        Err(embed_error) => {
            return failed(document.external_id, Stage::Embed, embed_error.to_string())
        }
    };

    // Persist before indexing: if indexing never happens, the next run's
    // dedupe check still re-detects this entry from the metadata row.
    if let Err(store_error) = inner.metadata.upsert(&document).await {
        if store_error.is_unavailable() {
            cancel.cancel();
        }
        return failed(document.external_id, Stage::Persist, store_error.to_string());
    }

    let record = EmbeddingRecord::new(
        document.external_id.clone(),
        inner.embedder.model_id(),
        vector,
    );
    if let Err(index_error) = inner.index.upsert_vector(&record, &document).await {
        // Metadata is now ahead of the index. The distinct stage lets an
        // operator replay exactly these ids through repair_index.
        return failed(document.external_id, Stage::Index, index_error.to_string());
    }

    debug!(external_id = %document.external_id, "ingested");
    EntryOutcome::Ingested {
        external_id: document.external_id,
    }
}

async fn repair_one<F, E, M, V>(
    inner: &PipelineInner<F, E, M, V>,
    external_id: &str,
) -> EntryOutcome
where
    F: Fetcher + Send + Sync,
    E: Embedder + Send + Sync,
    M: MetadataStore + Send + Sync,
    V: VectorIndex + Send + Sync,
{
    let document = match inner.metadata.get_by_external_id(external_id).await {
        Ok(Some(document)) => document,
        Ok(None) => {
            return failed(
                external_id.to_string(),
                Stage::Persist,
                "document not found in metadata store".to_string(),
            )
        }
        Err(store_error) => {
            return failed(
                external_id.to_string(),
                Stage::Persist,
                store_error.to_string(),
            )
        }
    };

    let texts = vec![document.embeddable_text()];
    let embedded = retry_with_backoff(
        || inner.embedder.embed(&texts),
        inner.options.max_attempts,
        inner.options.base_backoff,
    )
    .await;

    let vector = match embedded {
        Ok(mut vectors) if !vectors.is_empty() => vectors.swap_remove(0),
        Ok(_) => {
            return failed(
                external_id.to_string(),
                Stage::Embed,
                "embedder returned no vector".to_string(),
            )
        }
        Err(embed_error) => {
            return failed(external_id.to_string(), Stage::Embed, embed_error.to_string())
        }
    };

    let record = EmbeddingRecord::new(
        document.external_id.clone(),
        inner.embedder.model_id(),
        vector,
    );
    match inner.index.upsert_vector(&record, &document).await {
        Ok(()) => EntryOutcome::Ingested {
            external_id: document.external_id,
        },
        Err(index_error) => failed(
            document.external_id,
            Stage::Index,
            index_error.to_string(),
        ),
    }
}

fn failed(entry: String, stage: Stage, reason: String) -> EntryOutcome {
    warn!(%entry, %stage, %reason, "entry failed");
    EntryOutcome::Failed(EntryFailure {
        entry,
        stage,
        reason,
    })
}

/// Bounded exponential backoff with jitter for retryable embedding
/// failures. Non-retryable errors and exhausted attempts return the last
/// error to the caller.
pub(crate) async fn retry_with_backoff<T, Op, Fut>(
    mut op: Op,
    max_attempts: u32,
    base: Duration,
) -> Result<T, EmbedError>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EmbedError>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1u32;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(embed_error) if embed_error.is_retryable() && attempt < max_attempts => {
                let exponent = (attempt - 1).min(16);
                let delay = base.saturating_mul(1u32 << exponent);
                let jitter = delay.mul_f64(rand::thread_rng().gen_range(0.0..0.5));
                debug!(attempt, ?delay, "retrying embedding after transient failure");
                tokio::time::sleep(delay + jitter).await;
                attempt += 1;
            }
            Err(embed_error) => return Err(embed_error),
        }
    }
}
