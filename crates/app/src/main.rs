use anyhow::Context;
use arxivist_core::{
    arxiv_feed_url, Category, Embedder, HashEmbedder, HttpFetcher, IngestOptions, IngestPipeline,
    OpenAiEmbedder, QdrantStore, QueryEngine, QueryFilters, SqliteStore, DEFAULT_DIMENSION,
    DEFAULT_MODEL_ID,
};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Every top-level arXiv archive, for `--all-categories`.
const ALL_ARCHIVES: &[&str] = &[
    "astro-ph", "cond-mat", "cs", "econ", "eess", "gr-qc", "hep-ex", "hep-lat", "hep-ph",
    "hep-th", "math", "math-ph", "nlin", "nucl-ex", "nucl-th", "physics", "q-bio", "q-fin",
    "quant-ph", "stat",
];

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "arxivist", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// SQLite database path for paper metadata.
    #[arg(long, default_value = "arxivist.db")]
    db_path: PathBuf,

    /// Qdrant base URL.
    #[arg(long, default_value = "http://localhost:6333")]
    qdrant_url: String,

    /// Prefix for the per-model Qdrant collections.
    #[arg(long, default_value = "papers")]
    collection_prefix: String,

    /// OpenAI API key; required unless --offline.
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    openai_api_key: Option<String>,

    /// Embedding model identity; pins model + version for the corpus.
    #[arg(long, default_value = DEFAULT_MODEL_ID)]
    model_id: String,

    /// Vector dimensionality of the chosen model.
    #[arg(long, default_value_t = DEFAULT_DIMENSION)]
    dimension: usize,

    /// Use the deterministic local embedder instead of the OpenAI API.
    #[arg(long, default_value_t = false)]
    offline: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch the arXiv RSS feed for the given categories and ingest new papers.
    Ingest {
        /// Category to ingest, e.g. cs.AI; repeatable.
        #[arg(long = "category", short = 'c')]
        categories: Vec<String>,

        /// Ingest every top-level arXiv archive.
        #[arg(long, default_value_t = false)]
        all_categories: bool,

        /// Also fetch and embed each paper's HTML full text.
        #[arg(long, default_value_t = false)]
        full_text: bool,

        /// Worker pool width for per-entry pipelines.
        #[arg(long, default_value = "4")]
        concurrency: usize,
    },
    /// Semantic query over the ingested corpus.
    Query {
        /// The question, in natural language.
        text: String,

        /// Number of results to return.
        #[arg(long, default_value = "10")]
        top_k: usize,

        /// Restrict results to a category; repeatable, combined with AND.
        #[arg(long = "category", short = 'c')]
        categories: Vec<String>,

        /// Only papers published on or after this date (YYYY-MM-DD).
        #[arg(long)]
        after: Option<NaiveDate>,

        /// Only papers published on or before this date (YYYY-MM-DD).
        #[arg(long)]
        before: Option<NaiveDate>,
    },
    /// Replay vector-index writes for papers whose ingestion failed at the
    /// index stage.
    RepairIndex {
        /// arXiv ids to re-index.
        ids: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        started_at = %Utc::now().to_rfc3339(),
        "arxivist boot"
    );

    let metadata = SqliteStore::new(&cli.db_path)?;
    let index = QdrantStore::new(&cli.qdrant_url, &cli.collection_prefix, cli.dimension);

    if cli.offline {
        let embedder = HashEmbedder::new(cli.dimension);
        run_command(cli.command, embedder, metadata, index).await
    } else {
        let api_key = cli
            .openai_api_key
            .clone()
            .context("OPENAI_API_KEY is required unless --offline is set")?;
        let embedder = OpenAiEmbedder::new(api_key, cli.model_id.clone(), cli.dimension);
        run_command(cli.command, embedder, metadata, index).await
    }
}

async fn run_command<E>(
    command: Command,
    embedder: E,
    metadata: SqliteStore,
    index: QdrantStore,
) -> anyhow::Result<()>
where
    E: Embedder + Send + Sync + 'static,
{
    match command {
        Command::Ingest {
            categories,
            all_categories,
            full_text,
            concurrency,
        } => {
            let categories = resolve_categories(categories, all_categories)?;
            let feed_url = arxiv_feed_url(&categories);
            info!(%feed_url, categories = categories.len(), "ingesting feed");

            index.ensure_collection(embedder.model_id()).await?;

            let options = IngestOptions {
                concurrency,
                fetch_full_text: full_text,
                ..IngestOptions::default()
            };
            let fetcher = HttpFetcher::new(FETCH_TIMEOUT)?;
            let pipeline = IngestPipeline::new(fetcher, embedder, metadata, index, options);

            let cancel = pipeline.cancel_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, finishing in-flight entries");
                    cancel.cancel();
                }
            });

            let report = pipeline.run(&feed_url).await?;
            println!(
                "ingested={} skipped={} failed={}{}",
                report.ingested,
                report.skipped,
                report.failed(),
                if report.aborted { " (aborted)" } else { "" }
            );
            for failure in &report.failures {
                println!(
                    "  failed entry={} stage={} reason={}",
                    failure.entry, failure.stage, failure.reason
                );
            }
        }
        Command::Query {
            text,
            top_k,
            categories,
            after,
            before,
        } => {
            let filters = QueryFilters {
                categories,
                published_after: after,
                published_before: before,
            };
            let engine = QueryEngine::new(embedder, metadata, index);
            let outcome = engine.query(&text, top_k, &filters).await?;

            if outcome.items.is_empty() {
                println!("no results");
            }
            for item in outcome.items {
                println!(
                    "[{:.4}] {}  {}",
                    item.score, item.document.external_id, item.document.title
                );
                println!("         {}", item.document.summary_url());
            }
            if outcome.dropped > 0 {
                warn!(
                    dropped = outcome.dropped,
                    "results dropped due to index/metadata drift"
                );
            }
        }
        Command::RepairIndex { ids } => {
            index.ensure_collection(embedder.model_id()).await?;
            let fetcher = HttpFetcher::new(FETCH_TIMEOUT)?;
            let pipeline = IngestPipeline::new(
                fetcher,
                embedder,
                metadata,
                index,
                IngestOptions::default(),
            );

            let report = pipeline.repair_index(&ids).await;
            println!("repaired={} failed={}", report.ingested, report.failed());
            for failure in &report.failures {
                println!(
                    "  failed entry={} stage={} reason={}",
                    failure.entry, failure.stage, failure.reason
                );
            }
        }
    }

    Ok(())
}

fn resolve_categories(categories: Vec<String>, all_categories: bool) -> anyhow::Result<Vec<Category>> {
    if all_categories {
        return Ok(ALL_ARCHIVES.iter().map(|raw| Category::parse(raw)).collect());
    }
    if categories.is_empty() {
        anyhow::bail!("specify at least one --category, or --all-categories");
    }
    Ok(categories.iter().map(|raw| Category::parse(raw)).collect())
}
