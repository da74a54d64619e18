//! `keepsake-runtime` – Process plumbing around the memory system.
//!
//! # Modules
//!
//! - [`scheduler`] – [`ConsolidationScheduler`][scheduler::ConsolidationScheduler]:
//!   a tokio task that runs memory consolidation every six hours, retries
//!   sooner after a failed pass and stops on a shutdown signal.
//! - [`embedding`] – [`OllamaEmbedder`][embedding::OllamaEmbedder]: an
//!   [`Embedder`][keepsake_memory::semantic_index::Embedder] backed by a
//!   local [Ollama](https://ollama.com) server (`/api/embeddings`), plus the
//!   `/api/tags` availability probe.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: installs the
//!   global `tracing` subscriber with an optional OTLP span exporter. Set
//!   `OTEL_EXPORTER_OTLP_ENDPOINT` to export traces to any OTLP collector.

pub mod embedding;
pub mod scheduler;
pub mod telemetry;

pub use embedding::OllamaEmbedder;
pub use scheduler::{ConsolidationScheduler, SchedulerConfig, SchedulerHandle};
pub use telemetry::{TracerProviderGuard, init_tracing};
