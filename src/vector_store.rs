//! Persistent vector collection plus the helpers used to name it.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::document::Metadata;

const RECORDS_FILE: &str = "records.jsonl";

/// Index of `(id, vector, metadata, text)` records answering nearest-neighbor queries.
pub trait VectorStore {
    /// Appends records. All four slices must have the same length and be positionally aligned.
    fn add(
        &mut self,
        ids: &[String],
        vectors: &[Vec<f32>],
        metadatas: &[Metadata],
        texts: &[String],
    ) -> Result<()>;

    /// Returns at most `k` records ordered by descending similarity to `query`.
    fn similarity_search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>>;

    /// Number of stored records.
    fn len(&self) -> usize;

    /// Whether the store holds no records.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Record returned by [`VectorStore::similarity_search`].
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    /// Identifier assigned at ingestion time.
    pub id: String,
    /// Stored document text.
    pub text: String,
    /// Stored document metadata.
    pub metadata: Metadata,
    /// Cosine similarity with the query vector.
    pub score: f32,
}

/// Collection identity derived from the embedding model that produced its vectors.
///
/// Vectors from different models are not comparable, so each model gets its own directory.
#[derive(Debug, Clone)]
pub struct CollectionName {
    model: String,
}

impl CollectionName {
    /// Builds a collection name for `model`.
    pub fn new<S: Into<String>>(model: S) -> Result<Self> {
        let model = model.into();
        anyhow::ensure!(!model.trim().is_empty(), "embedding model name is required");
        Ok(Self { model })
    }

    /// Raw model string.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Model name safe for use in paths.
    pub fn label(&self) -> String {
        sanitize_model(&self.model)
    }

    /// Directory name holding the collection, e.g. `vectors_nomic-embed-text-latest`.
    pub fn dir_name(&self) -> String {
        format!("vectors_{}", self.label())
    }

    /// Collection directory under `data_dir`.
    pub fn path_in(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(self.dir_name())
    }
}

fn sanitize_model(input: &str) -> String {
    input.trim().replace(['/', '\\', ':'], "-")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    id: String,
    embedding: Vec<f32>,
    #[serde(default)]
    metadata: Metadata,
    text: String,
}

/// Directory-backed collection: one JSON record per line, loaded fully into memory.
pub struct LocalVectorStore {
    path: PathBuf,
    records: Vec<StoredRecord>,
    dimensions: Option<usize>,
}

impl LocalVectorStore {
    /// Opens the collection at `dir`, creating the directory when missing.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("failed to create {:?}", dir))?;
        let path = dir.join(RECORDS_FILE);
        let records = if path.exists() {
            read_records(&path)?
        } else {
            Vec::new()
        };
        let dimensions = records.first().map(|record| record.embedding.len());
        tracing::debug!(records = records.len(), path = %path.display(), "opened vector store");
        Ok(Self {
            path,
            records,
            dimensions,
        })
    }

    /// Whether a collection has been written at `dir`.
    pub fn exists(dir: &Path) -> bool {
        dir.join(RECORDS_FILE).exists()
    }

    /// Deletes the collection directory at `dir` when present.
    pub fn remove(dir: &Path) -> Result<bool> {
        if !dir.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(dir).with_context(|| format!("failed to remove {:?}", dir))?;
        Ok(true)
    }

    /// Vector length shared by every stored record, once known.
    pub fn dimensions(&self) -> Option<usize> {
        self.dimensions
    }
}

impl VectorStore for LocalVectorStore {
    fn add(
        &mut self,
        ids: &[String],
        vectors: &[Vec<f32>],
        metadatas: &[Metadata],
        texts: &[String],
    ) -> Result<()> {
        anyhow::ensure!(
            ids.len() == vectors.len() && ids.len() == metadatas.len() && ids.len() == texts.len(),
            "misaligned records: {} ids, {} vectors, {} metadatas, {} texts",
            ids.len(),
            vectors.len(),
            metadatas.len(),
            texts.len()
        );
        if ids.is_empty() {
            return Ok(());
        }
        let expected = self.dimensions.unwrap_or(vectors[0].len());
        anyhow::ensure!(expected > 0, "embedding dimension must be positive");
        if let Some(bad) = vectors.iter().find(|vector| vector.len() != expected) {
            anyhow::bail!(
                "embedding dimension {} does not match collection dimension {}",
                bad.len(),
                expected
            );
        }

        let batch: Vec<StoredRecord> = ids
            .iter()
            .zip(vectors)
            .zip(metadatas)
            .zip(texts)
            .map(|(((id, vector), metadata), text)| StoredRecord {
                id: id.clone(),
                embedding: vector.clone(),
                metadata: metadata.clone(),
                text: text.clone(),
            })
            .collect();

        let mut buf = Vec::new();
        for record in &batch {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {:?}", self.path))?;
        let committed = file
            .metadata()
            .with_context(|| format!("failed to stat {:?}", self.path))?
            .len();
        if let Err(err) = file.write_all(&buf).and_then(|()| file.sync_data()) {
            // Roll back to the last committed record so earlier batches stay readable.
            if let Err(rollback) = file.set_len(committed) {
                tracing::error!(
                    path = %self.path.display(),
                    "failed to roll back partial write: {rollback}"
                );
            }
            return Err(err).with_context(|| format!("failed to write {:?}", self.path));
        }

        self.dimensions = Some(expected);
        self.records.extend(batch);
        Ok(())
    }

    fn similarity_search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let mut scored: Vec<(f32, &StoredRecord)> = self
            .records
            .iter()
            .map(|record| (cosine_similarity(query, &record.embedding), record))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored
            .into_iter()
            .map(|(score, record)| SearchHit {
                id: record.id.clone(),
                text: record.text.clone(),
                metadata: record.metadata.clone(),
                score,
            })
            .collect())
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}

/// Records are always written newline-terminated, so a final line without a newline is
/// the tail of an interrupted write. It is dropped and the file truncated back to the
/// last complete record.
fn read_records(path: &Path) -> Result<Vec<StoredRecord>> {
    let file = File::open(path).with_context(|| format!("failed to open {:?}", path))?;
    let mut reader = BufReader::new(file);
    let mut records = Vec::new();
    let mut line = Vec::new();
    let mut offset = 0u64;
    let mut line_no = 0usize;
    loop {
        line.clear();
        let read = reader
            .read_until(b'\n', &mut line)
            .with_context(|| format!("failed to read line {}", line_no + 1))?;
        if read == 0 {
            break;
        }
        line_no += 1;
        if line.last() != Some(&b'\n') {
            tracing::warn!(
                path = %path.display(),
                line = line_no,
                bytes = read,
                "dropping incomplete vector record left by an interrupted write"
            );
            OpenOptions::new()
                .write(true)
                .open(path)
                .and_then(|file| file.set_len(offset))
                .with_context(|| format!("failed to truncate {:?}", path))?;
            break;
        }
        offset += read as u64;
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let record: StoredRecord = serde_json::from_slice(&line)
            .with_context(|| format!("invalid vector record at line {}", line_no))?;
        records.push(record);
    }
    Ok(records)
}

/// Cosine similarity; vectors of different length or zero norm score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::MetadataValue;
    use tempfile::tempdir;

    fn meta(source: &str) -> Metadata {
        let mut m = Metadata::new();
        m.insert("source".into(), MetadataValue::from(source));
        m
    }

    #[test]
    fn collection_names_are_path_safe() {
        let name = CollectionName::new("nomic-embed-text:latest").unwrap();
        assert_eq!(name.dir_name(), "vectors_nomic-embed-text-latest");
        let name = CollectionName::new("org/model\\v2").unwrap();
        assert_eq!(name.label(), "org-model-v2");
        assert!(CollectionName::new("  ").is_err());
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let mut store = LocalVectorStore::open(dir.path()).unwrap();
            store
                .add(
                    &["a".into(), "b".into()],
                    &[vec![1.0, 0.0], vec![0.0, 1.0]],
                    &[meta("a.txt"), meta("b.txt")],
                    &["alpha".into(), "beta".into()],
                )
                .unwrap();
        }
        let store = LocalVectorStore::open(dir.path()).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.dimensions(), Some(2));
        let hits = store.similarity_search(&[0.1, 0.9], 1).unwrap();
        assert_eq!(hits[0].id, "b");
        assert_eq!(hits[0].metadata["source"], MetadataValue::from("b.txt"));
    }

    #[test]
    fn torn_tail_is_dropped_on_reopen() {
        let dir = tempdir().unwrap();
        {
            let mut store = LocalVectorStore::open(dir.path()).unwrap();
            store
                .add(&["a".into()], &[vec![1.0, 0.0]], &[meta("a")], &["alpha".into()])
                .unwrap();
        }
        let records = dir.path().join(RECORDS_FILE);
        let committed = fs::read(&records).unwrap();
        let mut file = OpenOptions::new().append(true).open(&records).unwrap();
        file.write_all(b"{\"id\":\"b\",\"embedding\":[0.0,").unwrap();
        drop(file);

        let mut store = LocalVectorStore::open(dir.path()).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(fs::read(&records).unwrap(), committed);

        store
            .add(&["c".into()], &[vec![0.0, 1.0]], &[meta("c")], &["gamma".into()])
            .unwrap();
        let store = LocalVectorStore::open(dir.path()).unwrap();
        let mut ids: Vec<_> = store
            .similarity_search(&[1.0, 1.0], 5)
            .unwrap()
            .into_iter()
            .map(|hit| hit.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn corrupt_committed_record_is_an_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(RECORDS_FILE), "not json\n").unwrap();
        let err = LocalVectorStore::open(dir.path()).err().expect("corrupt record");
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn misaligned_add_writes_nothing() {
        let dir = tempdir().unwrap();
        let mut store = LocalVectorStore::open(dir.path()).unwrap();
        let err = store
            .add(
                &["a".into(), "b".into()],
                &[vec![1.0]],
                &[meta("a"), meta("b")],
                &["x".into(), "y".into()],
            )
            .unwrap_err();
        assert!(err.to_string().contains("misaligned"));
        assert!(store.is_empty());
        assert!(!LocalVectorStore::exists(dir.path()));
    }

    #[test]
    fn dimension_drift_is_rejected() {
        let dir = tempdir().unwrap();
        let mut store = LocalVectorStore::open(dir.path()).unwrap();
        store
            .add(&["a".into()], &[vec![1.0, 0.0]], &[meta("a")], &["x".into()])
            .unwrap();
        assert!(store
            .add(&["b".into()], &[vec![1.0, 0.0, 0.0]], &[meta("b")], &["y".into()])
            .is_err());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn search_orders_by_similarity_and_caps_k() {
        let dir = tempdir().unwrap();
        let mut store = LocalVectorStore::open(dir.path()).unwrap();
        store
            .add(
                &["x".into(), "y".into(), "z".into()],
                &[vec![1.0, 0.0], vec![0.7, 0.7], vec![-1.0, 0.0]],
                &[meta("x"), meta("y"), meta("z")],
                &["x".into(), "y".into(), "z".into()],
            )
            .unwrap();
        let hits = store.similarity_search(&[1.0, 0.0], 2).unwrap();
        let ids: Vec<_> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["x", "y"]);
        assert!(store.similarity_search(&[1.0, 0.0], 0).unwrap().is_empty());
    }

    #[test]
    fn cosine_handles_degenerate_vectors() {
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
        assert!((cosine_similarity(&[2.0, 0.0], &[5.0, 0.0]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn remove_deletes_collection() {
        let dir = tempdir().unwrap();
        let collection = dir.path().join("vectors_test");
        let mut store = LocalVectorStore::open(&collection).unwrap();
        store
            .add(&["a".into()], &[vec![1.0]], &[meta("a")], &["x".into()])
            .unwrap();
        assert!(LocalVectorStore::exists(&collection));
        assert!(LocalVectorStore::remove(&collection).unwrap());
        assert!(!LocalVectorStore::remove(&collection).unwrap());
    }
}
