//! `keepsake-memory` – The Companion's Long-Term Memory.
//!
//! Persists conversations, life events and interaction logs to a local
//! SQLite substrate, scores and links them on write, and serves hybrid
//! semantic/keyword recall to concurrent callers.
//!
//! # Modules
//!
//! - [`store`] – [`MemoryStore`][store::MemoryStore]: durable record and
//!   relation persistence with one SQLite handle per thread.
//! - [`scorer`] – pure write-time importance scoring.
//! - [`keywords`] – keyword extraction for tags and queries.
//! - [`relations`] – links each new record to related earlier ones.
//! - [`semantic_index`] – optional nearest-neighbour index
//!   ([`VectorIndex`][semantic_index::VectorIndex],
//!   [`GuardedIndex`][semantic_index::GuardedIndex]).
//! - [`retrieval`] – semantic-then-keyword recall with access counting.
//! - [`cache`] – snapshot-swapped views of important and recent records.
//! - [`consolidation`] – expiry, reinforcement and decay passes.
//! - [`system`] – [`MemorySystem`], the facade tying everything together.

mod connection;
pub mod cache;
pub mod consolidation;
pub mod error;
pub mod keywords;
pub mod relations;
pub mod retrieval;
pub mod scorer;
pub mod semantic_index;
pub mod store;
pub mod system;

pub use connection::DEFAULT_BUSY_TIMEOUT;
pub use error::{MemoryError, Result};
pub use system::{ConversationContext, MemoryConfig, MemoryStats, MemorySystem, PurgeCriteria};
