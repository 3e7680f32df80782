//! Command-line and environment configuration shared by the binaries.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Args, ValueEnum};
use tracing_subscriber::EnvFilter;

use crate::embedder::{Embedder, OllamaEmbedder, OpenAiEmbedder};
use crate::llm::{ChatModel, OllamaChat, OpenAiChat};
use crate::vector_store::CollectionName;

const OLLAMA_BASE_URL: &str = "http://localhost:11434";
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Installs the stderr log subscriber. `RUST_LOG` overrides the `info` default.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // A second call (e.g. from tests) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Backend serving embeddings and chat completions.
#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum ProviderKind {
    /// Local Ollama server.
    Ollama,
    /// OpenAI or any compatible API.
    Openai,
}

impl ProviderKind {
    /// Base URL used when none is configured.
    pub fn default_base_url(self) -> &'static str {
        match self {
            ProviderKind::Ollama => OLLAMA_BASE_URL,
            ProviderKind::Openai => OPENAI_BASE_URL,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Ollama => f.write_str("ollama"),
            ProviderKind::Openai => f.write_str("openai"),
        }
    }
}

/// Provider and storage settings flattened into every binary's CLI.
#[derive(Args, Debug, Clone)]
pub struct ProviderArgs {
    /// Embedding and chat backend
    #[arg(long, env = "SUPPORTBOT_PROVIDER", value_enum, default_value_t = ProviderKind::Ollama)]
    pub provider: ProviderKind,

    /// Provider base URL (defaults to the provider's standard endpoint)
    #[arg(long, env = "SUPPORTBOT_BASE_URL")]
    pub base_url: Option<String>,

    /// API key for the OpenAI provider
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Embedding model identifier
    #[arg(long, env = "SUPPORTBOT_EMBEDDING_MODEL", default_value = "nomic-embed-text")]
    pub embedding_model: String,

    /// Optional embedding dimension override (OpenAI only)
    #[arg(long, env = "SUPPORTBOT_EMBEDDING_DIMENSIONS")]
    pub embedding_dimensions: Option<usize>,

    /// Max seconds to wait for each provider request
    #[arg(long, env = "SUPPORTBOT_TIMEOUT_SECS", default_value_t = 60)]
    pub timeout_secs: u64,

    /// Directory holding vector collections
    #[arg(long, env = "SUPPORTBOT_DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,
}

impl ProviderArgs {
    /// Configured base URL or the provider default.
    pub fn base_url(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| self.provider.default_base_url().to_string())
    }

    /// Per-request timeout, at least one second.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    /// Collection identity for the configured embedding model.
    pub fn collection(&self) -> Result<CollectionName> {
        CollectionName::new(self.embedding_model.clone())
    }

    /// Directory of the collection for the configured embedding model.
    pub fn collection_dir(&self) -> Result<PathBuf> {
        Ok(self.collection()?.path_in(&self.data_dir))
    }

    /// Builds the embedding client for the configured provider.
    pub fn build_embedder(&self) -> Result<Box<dyn Embedder>> {
        let embedder: Box<dyn Embedder> = match self.provider {
            ProviderKind::Ollama => Box::new(OllamaEmbedder::new(
                self.base_url(),
                self.embedding_model.clone(),
                self.timeout(),
            )?),
            ProviderKind::Openai => Box::new(OpenAiEmbedder::new(
                self.require_api_key()?,
                self.base_url(),
                self.embedding_model.clone(),
                self.embedding_dimensions,
                self.timeout(),
            )?),
        };
        Ok(embedder)
    }

    /// Builds the chat client for the configured provider.
    pub fn build_chat_model(&self, model: &str, temperature: f32) -> Result<Box<dyn ChatModel>> {
        let chat: Box<dyn ChatModel> = match self.provider {
            ProviderKind::Ollama => Box::new(OllamaChat::new(
                self.base_url(),
                model.to_string(),
                temperature,
                self.timeout(),
            )?),
            ProviderKind::Openai => Box::new(OpenAiChat::new(
                self.require_api_key()?,
                self.base_url(),
                model.to_string(),
                temperature,
                self.timeout(),
            )?),
        };
        Ok(chat)
    }

    fn require_api_key(&self) -> Result<String> {
        self.api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| anyhow!("OPENAI_API_KEY must be set for the OpenAI provider"))
    }
}
