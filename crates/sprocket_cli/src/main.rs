//! SPROCKET CLI
//!
//! Runs the built-in stored procedures against a redb database file.
//! Each procedure commits whatever fits in one budget; the CLI re-invokes it
//! with the remaining work until nothing is left.

#![warn(missing_docs)]
#![warn(clippy::all)]

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, bail, eyre};
use serde_json::{Value, json};
use sprocket_core::options::MAX_PAGE_SIZE;
use sprocket_core::{CollectionLink, ContinuationToken, CreateOptions, Document, FeedOptions, Query};
use sprocket_runtime::{
    BULK_DELETE, BULK_IMPORT, CompletionOrder, DeleteProgress, HostConfig, InvocationOutcome,
    ScriptHost,
};
use sprocket_storage::{Page, RedbStore, SharedStore, StagedView, StoreConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sprocket")]
#[command(about = "SPROCKET - bounded transactional stored procedures", long_about = None)]
struct Cli {
    /// Database file
    #[arg(long, default_value = "sprocket.redb")]
    db: PathBuf,
    /// Host configuration (JSON); flags below override it
    #[arg(long)]
    config: Option<PathBuf>,
    /// Execution budget per invocation in milliseconds
    #[arg(long)]
    budget_ms: Option<u64>,
    /// Budget kept in reserve by the admission gate, in milliseconds
    #[arg(long)]
    safety_margin_ms: Option<u64>,
    /// Operations allowed to be pending at once
    #[arg(long)]
    max_pending: Option<usize>,
    /// Operations allowed to run at once
    #[arg(long)]
    max_in_flight: Option<usize>,
    /// Completion delivery order
    #[arg(long, value_enum)]
    completion_order: Option<OrderArg>,
    /// Log as JSON lines
    #[arg(long)]
    json_logs: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum OrderArg {
    Submission,
    AsCompleted,
}

impl From<OrderArg> for CompletionOrder {
    fn from(arg: OrderArg) -> Self {
        match arg {
            OrderArg::Submission => Self::Submission,
            OrderArg::AsCompleted => Self::AsCompleted,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Import a JSON array of documents
    Import {
        /// Target collection
        #[arg(short, long)]
        collection: String,
        /// File holding the array
        file: PathBuf,
        /// Overwrite documents that already exist
        #[arg(long)]
        upsert: bool,
    },
    /// Delete documents matching a filter
    Delete {
        /// Target collection
        #[arg(short, long)]
        collection: String,
        /// Filter as JSON, e.g. '{"op":"eq","path":"kind","value":"order"}'
        #[arg(short, long)]
        query: Option<String>,
        /// Matches fetched per page
        #[arg(long)]
        page_size: Option<usize>,
    },
    /// Print one page of a collection
    List {
        /// Collection
        #[arg(short, long)]
        collection: String,
        /// Documents per page
        #[arg(long)]
        page_size: Option<usize>,
        /// Token printed by a previous page
        #[arg(long)]
        continuation: Option<String>,
    },
    /// Count the documents in a collection
    Count {
        /// Collection
        #[arg(short, long)]
        collection: String,
    },
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sprocket=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn host_config(cli: &Cli) -> Result<HostConfig> {
    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => HostConfig::default(),
    };
    if let Some(ms) = cli.budget_ms {
        config = config.with_budget(Duration::from_millis(ms));
    }
    if let Some(ms) = cli.safety_margin_ms {
        config.admission = config
            .admission
            .with_safety_margin(Duration::from_millis(ms));
    }
    if let Some(max) = cli.max_pending {
        config.admission = config.admission.with_max_pending(max);
    }
    if let Some(max) = cli.max_in_flight {
        config = config.with_max_in_flight(max);
    }
    if let Some(order) = cli.completion_order {
        config = config.with_completion_order(order.into());
    }
    Ok(config)
}

fn load_config(path: &Path) -> Result<HostConfig> {
    let raw = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("reading config {}", path.display()))?;
    serde_json::from_str(&raw).wrap_err_with(|| format!("parsing config {}", path.display()))
}

/// Response of a committed invocation
fn committed_response(outcome: InvocationOutcome) -> Result<Value> {
    if let Some(reason) = outcome.status.abort_reason() {
        bail!("invocation {} rolled back: {reason}", outcome.invocation);
    }
    outcome
        .response
        .ok_or_else(|| eyre!("invocation {} returned no response", outcome.invocation))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Summary {
    processed: u64,
    invocations: u64,
}

async fn import(
    host: &ScriptHost,
    collection: &CollectionLink,
    mut documents: Vec<Value>,
    options: &CreateOptions,
) -> Result<Summary> {
    let mut summary = Summary {
        processed: 0,
        invocations: 0,
    };
    loop {
        let body = json!({"documents": documents, "options": options});
        let outcome = host.execute(BULK_IMPORT, collection, body).await?;
        summary.invocations += 1;

        let response = committed_response(outcome)?;
        let created = response
            .as_u64()
            .ok_or_else(|| eyre!("unexpected import response {response}"))?;
        let created = usize::try_from(created)?.min(documents.len());
        documents.drain(..created);
        summary.processed += created as u64;
        tracing::info!(created, remaining = documents.len(), "import batch committed");

        if documents.is_empty() {
            return Ok(summary);
        }
        if created == 0 {
            bail!(
                "no progress with {} documents left; raise the budget or lower the safety margin",
                documents.len()
            );
        }
    }
}

async fn delete(
    host: &ScriptHost,
    collection: &CollectionLink,
    query: Query,
    page_size: Option<usize>,
) -> Result<Summary> {
    let mut summary = Summary {
        processed: 0,
        invocations: 0,
    };
    let mut body = json!({ "query": query });
    if let Some(size) = page_size {
        body["pageSize"] = json!(size);
    }
    loop {
        let outcome = host.execute(BULK_DELETE, collection, body.clone()).await?;
        summary.invocations += 1;

        let progress: DeleteProgress = serde_json::from_value(committed_response(outcome)?)?;
        summary.processed += progress.deleted;
        tracing::info!(deleted = progress.deleted, "delete batch committed");

        if !progress.continuation {
            return Ok(summary);
        }
        if progress.deleted == 0 {
            bail!("no progress; raise the budget or lower the safety margin");
        }
    }
}

async fn list(
    store: &SharedStore,
    config: &StoreConfig,
    collection: &CollectionLink,
    options: &FeedOptions,
) -> Result<Page<Document>> {
    let view = StagedView::new(Arc::clone(store), config.clone());
    Ok(view.read_documents(collection, options).await?)
}

async fn count(store: &SharedStore, config: &StoreConfig, collection: &CollectionLink) -> Result<usize> {
    let view = StagedView::new(Arc::clone(store), config.clone());
    let mut options = FeedOptions::new().with_page_size(MAX_PAGE_SIZE);
    let mut total = 0;
    loop {
        let page = view.read_documents(collection, &options).await?;
        total += page.items.len();
        match page.continuation {
            Some(token) => options = options.with_continuation(Some(token)),
            None => return Ok(total),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = host_config(&cli)?;
    let store: SharedStore = Arc::new(
        RedbStore::open(&cli.db).wrap_err_with(|| format!("opening {}", cli.db.display()))?,
    );
    let host = ScriptHost::new(Arc::clone(&store), config.clone());

    match cli.command {
        Commands::Import {
            collection,
            file,
            upsert,
        } => {
            let collection = CollectionLink::parse(&collection)?;
            let raw = std::fs::read_to_string(&file)
                .wrap_err_with(|| format!("reading {}", file.display()))?;
            let documents: Vec<Value> = serde_json::from_str(&raw)
                .wrap_err_with(|| format!("{} is not a JSON array", file.display()))?;
            let options = CreateOptions {
                upsert,
                ..CreateOptions::default()
            };
            let summary = import(&host, &collection, documents, &options).await?;
            println!(
                "Imported {} documents into {collection} in {} invocations",
                summary.processed, summary.invocations
            );
        }
        Commands::Delete {
            collection,
            query,
            page_size,
        } => {
            let collection = CollectionLink::parse(&collection)?;
            let query = match query {
                Some(raw) => serde_json::from_str(&raw).wrap_err("parsing --query")?,
                None => Query::all(),
            };
            let summary = delete(&host, &collection, query, page_size).await?;
            println!(
                "Deleted {} documents from {collection} in {} invocations",
                summary.processed, summary.invocations
            );
        }
        Commands::List {
            collection,
            page_size,
            continuation,
        } => {
            let collection = CollectionLink::parse(&collection)?;
            let mut options = FeedOptions::new()
                .with_continuation(continuation.map(ContinuationToken::from_raw));
            if let Some(size) = page_size {
                options = options.with_page_size(size);
            }
            let page = list(&store, &config.store, &collection, &options).await?;
            for doc in &page.items {
                println!("{}", serde_json::to_string(doc)?);
            }
            if let Some(token) = page.continuation {
                println!("continuation: {token}");
            }
        }
        Commands::Count { collection } => {
            let collection = CollectionLink::parse(&collection)?;
            println!("{}", count(&store, &config.store, &collection).await?);
        }
    }

    Ok(())
}
