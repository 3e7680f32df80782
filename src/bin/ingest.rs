use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use supportbot::{
    ingest_documents, init_tracing, load_path, IngestConfig, LocalVectorStore, ProviderArgs,
    ThreadSleeper, VectorStore,
};

#[derive(Parser, Debug)]
#[command(
    name = "supportbot-ingest",
    about = "Embed support documents into the local vector collection"
)]
struct IngestCli {
    /// File or directory of documents (.txt, .md, .jsonl, .csv)
    #[arg(long, env = "SUPPORTBOT_DOCS", default_value = "data/docs")]
    docs: PathBuf,

    #[command(flatten)]
    provider: ProviderArgs,

    /// Max number of documents sent per embedding request
    #[arg(long, env = "SUPPORTBOT_BATCH_SIZE", default_value_t = 200)]
    batch_size: usize,

    /// Embedding attempts per batch before giving up
    #[arg(long, env = "SUPPORTBOT_MAX_RETRIES", default_value_t = 3)]
    max_retries: usize,

    /// Seconds to wait before the first retry; doubles on each further retry
    #[arg(long, env = "SUPPORTBOT_RETRY_BASE_DELAY_SECS", default_value_t = 2.0)]
    base_delay_secs: f64,

    /// Add to the existing collection instead of rebuilding it
    #[arg(long, default_value_t = false)]
    append: bool,

    /// Delete an existing collection without asking
    #[arg(long, short = 'y', default_value_t = false)]
    yes: bool,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = IngestCli::parse();
    let base_delay = Duration::try_from_secs_f64(cli.base_delay_secs)
        .map_err(|_| anyhow!("invalid retry base delay {}", cli.base_delay_secs))?;
    let config = IngestConfig::new(cli.batch_size, cli.max_retries, base_delay)?;

    let documents = load_path(&cli.docs)
        .with_context(|| format!("failed to load documents from {:?}", cli.docs))?;
    anyhow::ensure!(
        !documents.is_empty(),
        "no documents found under {:?}",
        cli.docs
    );

    let collection = cli.provider.collection()?;
    let collection_dir = collection.path_in(&cli.provider.data_dir);
    println!(
        "Using embedding model: {} - {}",
        cli.provider.provider,
        collection.model()
    );
    println!("Collection path: {}", collection_dir.display());

    // Provider config errors must surface before anything on disk is touched.
    let embedder = cli.provider.build_embedder()?;

    if LocalVectorStore::exists(&collection_dir) && !cli.append {
        if !cli.yes && !confirm_rebuild(&collection_dir)? {
            println!("Update cancelled.");
            return Ok(());
        }
        LocalVectorStore::remove(&collection_dir)?;
        println!("Removed existing collection.");
    }

    let mut store = LocalVectorStore::open(&collection_dir)?;
    let report = ingest_documents(&documents, &embedder, &mut store, &config, &ThreadSleeper)
        .with_context(|| {
            format!(
                "ingestion into {} stopped; earlier batches remain committed",
                collection_dir.display()
            )
        })?;

    println!(
        "Successfully ingested {} document{} in {} batch{} ({} retr{}); collection now holds {}.",
        report.documents,
        if report.documents == 1 { "" } else { "s" },
        report.batches,
        if report.batches == 1 { "" } else { "es" },
        report.retries,
        if report.retries == 1 { "y" } else { "ies" },
        store.len()
    );
    Ok(())
}

fn confirm_rebuild(dir: &std::path::Path) -> Result<bool> {
    println!(
        "WARNING: this will DELETE the existing collection at {} and rebuild it.",
        dir.display()
    );
    print!("Continue? (yes/no): ");
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "yes" | "y"))
}
