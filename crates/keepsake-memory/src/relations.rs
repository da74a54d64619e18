//! Relation building for freshly written records.
//!
//! After a record is stored, its first three tags are used to find up to
//! three earlier records sharing one of them (highest importance first, then
//! newest). A `semantic` edge of strength `1.0` is written from the new
//! record to each. Edges are never mutated afterwards.

use chrono::{DateTime, Utc};
use keepsake_types::{RecordId, RelationKind};
use tracing::{debug, warn};

use crate::error::{MemoryError, Result};
use crate::keywords::MAX_QUERY_KEYWORDS;
use crate::store::{MemoryStore, RecordFilter};

/// Maximum number of edges created per new record.
pub const MAX_LINKS_PER_RECORD: usize = 3;

/// Strength assigned to keyword-derived edges.
pub const SEMANTIC_STRENGTH: f32 = 1.0;

/// Link record `id` to related earlier records, returning the number of edges
/// written.
///
/// A candidate that disappears between lookup and insert is skipped. Any
/// other store failure is returned; callers treat it as non-fatal.
pub fn link_new_record(store: &MemoryStore, id: RecordId, tags: &[String], now: DateTime<Utc>) -> Result<usize> {
    let keywords: Vec<String> = tags.iter().take(MAX_QUERY_KEYWORDS).cloned().collect();
    if keywords.is_empty() {
        return Ok(0);
    }

    let candidates = store.query(
        &RecordFilter::new()
            .any_tags(keywords)
            .exclude([id])
            .live_at(now)
            .limit(MAX_LINKS_PER_RECORD),
    )?;

    let mut linked = 0;
    for candidate in candidates {
        match store.create_relation(id, candidate.id, RelationKind::Semantic, SEMANTIC_STRENGTH) {
            Ok(()) => linked += 1,
            Err(MemoryError::NotFound(missing)) => {
                warn!(from = id, missing, "relation endpoint vanished; skipping");
            }
            Err(e) => return Err(e),
        }
    }
    debug!(id, linked, "linked memory record");
    Ok(linked)
}
