//! Batched document ingestion: partition, embed with exponential backoff, commit to a vector store.
//!
//! Batches are processed strictly one after another. A batch that keeps failing stops the run;
//! everything committed before it stays in the store.

use std::slice::Chunks;
use std::thread;
use std::time::Duration;

use anyhow::anyhow;
use uuid::Uuid;

use crate::document::{Document, Metadata};
use crate::embedder::Embedder;
use crate::vector_store::VectorStore;

/// Default number of documents per embedding request.
pub const DEFAULT_BATCH_SIZE: usize = 200;
/// Default number of embedding attempts per batch.
pub const DEFAULT_MAX_RETRIES: usize = 3;
/// Default wait before the first retry; doubles on each further retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(2);

/// Tuning for one ingestion run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IngestConfig {
    /// Maximum documents per batch.
    pub batch_size: usize,
    /// Total embedding attempts per batch, including the first.
    pub max_retries: usize,
    /// Wait before the first retry.
    pub base_delay: Duration,
}

impl IngestConfig {
    /// Builds a validated config.
    pub fn new(batch_size: usize, max_retries: usize, base_delay: Duration) -> Result<Self, IngestError> {
        let config = Self {
            batch_size,
            max_retries,
            base_delay,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks that every knob is positive.
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.batch_size == 0 {
            return Err(IngestError::InvalidConfig("batch_size must be at least 1".into()));
        }
        if self.max_retries == 0 {
            return Err(IngestError::InvalidConfig("max_retries must be at least 1".into()));
        }
        if self.base_delay.is_zero() {
            return Err(IngestError::InvalidConfig("base_delay must be positive".into()));
        }
        Ok(())
    }

    /// Wait applied after the failed attempt numbered `attempt` (0-based): `base_delay * 2^attempt`.
    pub fn backoff(&self, attempt: usize) -> Duration {
        let factor = u32::try_from(attempt)
            .ok()
            .and_then(|shift| 1u32.checked_shl(shift))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

/// Failure modes of [`ingest_documents`].
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Every embedding attempt for a batch failed.
    #[error("embedding batch {batch_index} failed after {attempts} attempt(s)")]
    RetriesExhausted {
        /// 0-based position of the failing batch.
        batch_index: usize,
        /// Attempts made, equal to `max_retries`.
        attempts: usize,
        /// Error from the last attempt.
        #[source]
        source: anyhow::Error,
    },
    /// The vector store rejected a batch. Store writes are not retried.
    #[error("failed to write batch {batch_index} to the vector store")]
    StoreWrite {
        /// 0-based position of the failing batch.
        batch_index: usize,
        /// Underlying store error.
        #[source]
        source: anyhow::Error,
    },
    /// The run configuration is unusable.
    #[error("invalid ingestion config: {0}")]
    InvalidConfig(String),
}

impl IngestError {
    /// Batch that stopped the run, when the failure is tied to one.
    pub fn batch_index(&self) -> Option<usize> {
        match self {
            IngestError::RetriesExhausted { batch_index, .. }
            | IngestError::StoreWrite { batch_index, .. } => Some(*batch_index),
            IngestError::InvalidConfig(_) => None,
        }
    }
}

/// Group of documents embedded by one provider call.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// 0-based position within the run.
    pub index: usize,
    /// One fresh identifier per document.
    pub ids: Vec<String>,
    /// Document texts, aligned with `ids`.
    pub texts: Vec<String>,
    /// Document metadata, aligned with `ids`.
    pub metadatas: Vec<Metadata>,
}

impl Batch {
    fn from_documents(index: usize, documents: &[Document]) -> Self {
        let mut ids = Vec::with_capacity(documents.len());
        let mut texts = Vec::with_capacity(documents.len());
        let mut metadatas = Vec::with_capacity(documents.len());
        for document in documents {
            ids.push(Uuid::new_v4().to_string());
            texts.push(document.text.clone());
            metadatas.push(document.metadata.clone());
        }
        Self {
            index,
            ids,
            texts,
            metadatas,
        }
    }

    /// Number of documents in the batch.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the batch holds no documents.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Lazily yields consecutive batches; only the current batch is materialized.
pub struct Batches<'a> {
    chunks: Chunks<'a, Document>,
    next_index: usize,
}

impl<'a> Batches<'a> {
    /// Splits `documents` into batches of at most `batch_size` (minimum 1).
    pub fn new(documents: &'a [Document], batch_size: usize) -> Self {
        Self {
            chunks: documents.chunks(batch_size.max(1)),
            next_index: 0,
        }
    }
}

impl Iterator for Batches<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        let chunk = self.chunks.next()?;
        let batch = Batch::from_documents(self.next_index, chunk);
        self.next_index += 1;
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.chunks.size_hint()
    }
}

impl ExactSizeIterator for Batches<'_> {}

/// Materializes every batch up front.
pub fn partition(documents: &[Document], batch_size: usize) -> Vec<Batch> {
    Batches::new(documents, batch_size).collect()
}

/// Blocks between retries.
pub trait Sleeper {
    /// Waits for `duration`.
    fn sleep(&self, duration: Duration);
}

/// Sleeps the current thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

impl<S: Sleeper + ?Sized> Sleeper for &S {
    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration)
    }
}

/// Totals for a completed run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// Batches committed.
    pub batches: usize,
    /// Documents committed.
    pub documents: usize,
    /// Retries performed across all batches.
    pub retries: usize,
}

/// Embeds `documents` batch by batch and writes each batch to `store` before starting the next.
pub fn ingest_documents<E, V, S>(
    documents: &[Document],
    embedder: &E,
    store: &mut V,
    config: &IngestConfig,
    sleeper: &S,
) -> Result<IngestReport, IngestError>
where
    E: Embedder + ?Sized,
    V: VectorStore + ?Sized,
    S: Sleeper + ?Sized,
{
    config.validate()?;
    let batches = Batches::new(documents, config.batch_size);
    let total = batches.len();
    tracing::info!(
        documents = documents.len(),
        batches = total,
        batch_size = config.batch_size,
        "starting ingestion"
    );

    let mut report = IngestReport::default();
    for batch in batches {
        let vectors = embed_with_retry(&batch, embedder, config, sleeper, &mut report.retries)?;
        store
            .add(&batch.ids, &vectors, &batch.metadatas, &batch.texts)
            .map_err(|source| IngestError::StoreWrite {
                batch_index: batch.index,
                source,
            })?;
        report.batches += 1;
        report.documents += batch.len();
        tracing::info!(
            "committed batch {}/{} ({} documents, {} total)",
            batch.index + 1,
            total,
            batch.len(),
            report.documents
        );
    }
    Ok(report)
}

fn embed_with_retry<E, S>(
    batch: &Batch,
    embedder: &E,
    config: &IngestConfig,
    sleeper: &S,
    retries: &mut usize,
) -> Result<Vec<Vec<f32>>, IngestError>
where
    E: Embedder + ?Sized,
    S: Sleeper + ?Sized,
{
    let texts: Vec<&str> = batch.texts.iter().map(String::as_str).collect();
    let mut attempt = 0usize;
    loop {
        let err = match embedder.embed(&texts) {
            Ok(vectors) if vectors.len() == texts.len() => return Ok(vectors),
            Ok(vectors) => anyhow!(
                "embedding provider returned {} vectors for {} texts",
                vectors.len(),
                texts.len()
            ),
            Err(err) => err,
        };
        if attempt + 1 < config.max_retries {
            let delay = config.backoff(attempt);
            tracing::warn!(
                batch = batch.index,
                attempt = attempt + 1,
                max_retries = config.max_retries,
                "embedding failed: {err:#}; retrying in {:.1}s",
                delay.as_secs_f64()
            );
            sleeper.sleep(delay);
            attempt += 1;
            *retries += 1;
            continue;
        }
        return Err(IngestError::RetriesExhausted {
            batch_index: batch.index,
            attempts: attempt + 1,
            source: err,
        });
    }
}
