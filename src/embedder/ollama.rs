//! Ollama embedding client.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::Embedder;

/// Blocking embeddings client for a local Ollama server.
#[derive(Clone)]
pub struct OllamaEmbedder {
    client: Client,
    endpoint: String,
    model: String,
}

impl OllamaEmbedder {
    /// Builds a new Ollama embeddings client.
    ///
    /// # Arguments
    /// * `base_url` - Server root, e.g. `http://localhost:11434`
    /// * `model` - Embedding model pulled into the server (e.g. `nomic-embed-text`)
    pub fn new(base_url: String, model: String, timeout: Duration) -> Result<Self> {
        anyhow::ensure!(
            base_url.starts_with("http://") || base_url.starts_with("https://"),
            "Ollama base URL must be an http(s) URL"
        );
        anyhow::ensure!(!model.trim().is_empty(), "missing embedding model name");
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build Ollama HTTP client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/api/embed", base_url.trim_end_matches('/')),
            model,
        })
    }

    /// Model identifier sent with every request.
    pub fn model(&self) -> &str {
        &self.model
    }
}

impl Embedder for OllamaEmbedder {
    fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let request = EmbedRequest {
            model: &self.model,
            input: texts,
            truncate: true,
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .with_context(|| format!("failed to call Ollama at {}", self.endpoint))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp
                .text()
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            anyhow::bail!("Ollama embed request failed ({}): {}", status, body);
        }
        let payload: EmbedResponse = resp
            .json()
            .context("failed to parse Ollama embed response")?;
        anyhow::ensure!(
            payload.embeddings.len() == texts.len(),
            "Ollama returned {} embeddings for {} inputs",
            payload.embeddings.len(),
            texts.len()
        );
        Ok(payload.embeddings)
    }
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
    // Server-side truncation for inputs longer than the model context.
    truncate: bool,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    #[serde(default)]
    embeddings: Vec<Vec<f32>>,
}
