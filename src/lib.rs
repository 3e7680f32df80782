#![warn(missing_docs)]
//! Core library entry points for the supportbot retrieval chatbot.

pub mod config;
pub mod document;
pub mod embedder;
pub mod ingest;
pub mod llm;
pub mod vector_store;
pub mod workflow;

pub use config::{init_tracing, ProviderArgs, ProviderKind};
pub use document::{load_path, Document, MetadataValue};
pub use embedder::Embedder;
pub use ingest::{
    ingest_documents, partition, Batch, Batches, IngestConfig, IngestError, IngestReport, Sleeper,
    ThreadSleeper,
};
pub use llm::{ChatMessage, ChatModel, Role};
pub use vector_store::{CollectionName, LocalVectorStore, SearchHit, VectorStore};
pub use workflow::{ChatState, MemorySaver, NodeUpdate, Workflow};
