//! Source documents read from disk ahead of ingestion.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

/// Scalar metadata value attached to a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    /// Boolean flag.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// Free-form string.
    Str(String),
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::Str(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::Str(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        MetadataValue::Int(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        MetadataValue::Bool(value)
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::Bool(v) => write!(f, "{v}"),
            MetadataValue::Int(v) => write!(f, "{v}"),
            MetadataValue::Float(v) => write!(f, "{v}"),
            MetadataValue::Str(v) => f.write_str(v),
        }
    }
}

/// Metadata map keyed by field name. Ordered so serialized records are stable.
pub type Metadata = BTreeMap<String, MetadataValue>;

/// A unit of text submitted for embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Body text submitted to the embedding model.
    pub text: String,
    /// Scalar fields stored next to the vector (e.g. `source`).
    #[serde(default)]
    pub metadata: Metadata,
}

impl Document {
    /// Builds a document with empty metadata.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: Metadata::new(),
        }
    }

    /// Adds a metadata field, replacing any previous value.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Returns the `source` metadata field when present.
    pub fn source(&self) -> Option<String> {
        self.metadata.get("source").map(|value| value.to_string())
    }
}

/// Loads documents from a single file or recursively from a directory.
pub fn load_path(path: &Path) -> Result<Vec<Document>> {
    let meta = fs::metadata(path).with_context(|| format!("failed to stat {:?}", path))?;
    if meta.is_dir() {
        return load_directory(path);
    }
    let source = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    load_file(path, &source)
}

/// Walks `root` in sorted order and loads every `.txt`, `.md`, `.jsonl` and `.csv` file.
pub fn load_directory(root: &Path) -> Result<Vec<Document>> {
    let mut documents = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.with_context(|| format!("failed to walk {:?}", root))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let source = path
            .strip_prefix(root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");
        documents.extend(load_file(path, &source)?);
    }
    tracing::debug!(count = documents.len(), root = %root.display(), "loaded documents");
    Ok(documents)
}

fn load_file(path: &Path, source: &str) -> Result<Vec<Document>> {
    match extension(path).as_deref() {
        Some("txt") | Some("md") => {
            let text =
                fs::read_to_string(path).with_context(|| format!("failed to read {:?}", path))?;
            if text.trim().is_empty() {
                return Ok(Vec::new());
            }
            Ok(vec![Document::new(text).with_metadata("source", source)])
        }
        Some("jsonl") => load_jsonl(path, source),
        Some("csv") => load_csv(path, source),
        _ => Ok(Vec::new()),
    }
}

fn load_jsonl(path: &Path, source: &str) -> Result<Vec<Document>> {
    let file = File::open(path).with_context(|| format!("failed to open {:?}", path))?;
    let reader = BufReader::new(file);
    let mut documents = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read line {} of {:?}", line_no + 1, path))?;
        if line.trim().is_empty() {
            continue;
        }
        let mut document: Document = serde_json::from_str(&line)
            .with_context(|| format!("invalid document at line {} of {:?}", line_no + 1, path))?;
        if document.text.trim().is_empty() {
            continue;
        }
        document
            .metadata
            .entry("source".to_string())
            .or_insert_with(|| source.into());
        document
            .metadata
            .entry("line".to_string())
            .or_insert(MetadataValue::Int(line_no as i64 + 1));
        documents.push(document);
    }
    Ok(documents)
}

/// Header names whose column becomes the document text; other columns become metadata.
const CSV_TEXT_COLUMNS: [&str; 3] = ["text", "content", "page_content"];

/// One document per row. Without a recognised text column every field is rendered as a
/// `header: value` line.
fn load_csv(path: &Path, source: &str) -> Result<Vec<Document>> {
    let mut reader =
        csv::Reader::from_path(path).with_context(|| format!("failed to open {:?}", path))?;
    let headers = reader
        .headers()
        .with_context(|| format!("failed to read header of {:?}", path))?
        .clone();
    let text_column = headers
        .iter()
        .position(|header| CSV_TEXT_COLUMNS.contains(&header.trim().to_ascii_lowercase().as_str()));

    let mut documents = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("invalid row {} of {:?}", row, path))?;
        let mut document = match text_column {
            Some(column) => {
                let text = record.get(column).unwrap_or_default();
                if text.trim().is_empty() {
                    continue;
                }
                let mut document = Document::new(text);
                for (index, (header, value)) in headers.iter().zip(record.iter()).enumerate() {
                    if index != column && !value.trim().is_empty() {
                        document = document.with_metadata(header.trim(), value.trim());
                    }
                }
                document
            }
            None => {
                if record.iter().all(|value| value.trim().is_empty()) {
                    continue;
                }
                let text = headers
                    .iter()
                    .zip(record.iter())
                    .map(|(header, value)| format!("{}: {}", header.trim(), value.trim()))
                    .collect::<Vec<_>>()
                    .join("\n");
                Document::new(text)
            }
        };
        document
            .metadata
            .entry("source".to_string())
            .or_insert_with(|| source.into());
        document
            .metadata
            .entry("row".to_string())
            .or_insert(MetadataValue::Int(row as i64));
        documents.push(document);
    }
    Ok(documents)
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
}
