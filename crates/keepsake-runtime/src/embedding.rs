//! [`OllamaEmbedder`] – remote embeddings for the vector index.
//!
//! Talks to a locally-running [Ollama](https://ollama.com) server
//! (`http://localhost:11434`) through its `/api/embeddings` endpoint. The
//! client is blocking: the memory system calls embedders from its own index
//! worker threads, never from async tasks.
//!
//! # Example
//!
//! ```rust,no_run
//! use keepsake_memory::semantic_index::Embedder;
//! use keepsake_runtime::embedding::OllamaEmbedder;
//!
//! let embedder = OllamaEmbedder::new("http://localhost:11434", "nomic-embed-text");
//! if embedder.is_available() {
//!     let vector = embedder.embed("walked along the river").unwrap();
//!     assert!(!vector.is_empty());
//! }
//! ```

use std::time::Duration;

use keepsake_memory::semantic_index::{EmbedError, Embedder};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default Ollama base URL.
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
/// Default embedding model.
pub const DEFAULT_EMBEDDING_MODEL: &str = "nomic-embed-text";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ─────────────────────────────────────────────────────────────────────────────
// Wire shapes
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

/// A single model entry returned by Ollama's `/api/tags` endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct OllamaModel {
    pub name: String,
}

#[derive(Deserialize)]
struct TagsResponse {
    models: Vec<OllamaModel>,
}

// ─────────────────────────────────────────────────────────────────────────────
// OllamaEmbedder
// ─────────────────────────────────────────────────────────────────────────────

pub struct OllamaEmbedder {
    base_url: String,
    model: String,
    client: reqwest::blocking::Client,
}

impl OllamaEmbedder {
    /// Create an embedder for `model` served at `base_url`.
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            client,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Models downloaded on the server.
    pub fn fetch_models(&self) -> Result<Vec<OllamaModel>, EmbedError> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| EmbedError::Unreachable(format!("{url}: {e}")))?;
        if !response.status().is_success() {
            return Err(EmbedError::InvalidResponse(format!("HTTP {}", response.status())));
        }
        let tags: TagsResponse = response
            .json()
            .map_err(|e| EmbedError::InvalidResponse(e.to_string()))?;
        Ok(tags.models)
    }

    /// Whether the server answers and has the configured model.
    ///
    /// Model names are matched with and without their `:tag` suffix.
    pub fn is_available(&self) -> bool {
        match self.fetch_models() {
            Ok(models) => models.iter().any(|m| {
                m.name == self.model || m.name.split(':').next() == Some(self.model.as_str())
            }),
            Err(e) => {
                debug!(error = %e, "ollama probe failed");
                false
            }
        }
    }
}

impl Embedder for OllamaEmbedder {
    fn name(&self) -> &str {
        &self.model
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let url = format!("{}/api/embeddings", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&EmbeddingRequest {
                model: &self.model,
                prompt: text,
            })
            .send()
            .map_err(|e| EmbedError::Unreachable(format!("{url}: {e}")))?;
        if !response.status().is_success() {
            return Err(EmbedError::InvalidResponse(format!("HTTP {}", response.status())));
        }
        let body: EmbeddingResponse = response
            .json()
            .map_err(|e| EmbedError::InvalidResponse(e.to_string()))?;
        if body.embedding.is_empty() {
            return Err(EmbedError::InvalidResponse("empty embedding".to_string()));
        }
        Ok(body.embedding)
    }
}
