//! Durable record store.
//!
//! Persists [`MemoryRecord`]s and the relation graph between them to SQLite.
//! The store is the only component that writes record or relation rows.
//! Every thread gets its own connection (see [`crate::connection`]); the
//! store itself holds no lock and is `Send + Sync`.
//!
//! # Storage layout
//!
//! Table `memories`:
//!
//! | column        | type    | description                                       |
//! |---------------|---------|---------------------------------------------------|
//! | id            | INTEGER | `AUTOINCREMENT` primary key, never reused         |
//! | kind          | TEXT    | kind label (`conversation`, `interaction_send`, …)|
//! | content       | TEXT    | tagged JSON [`MemoryContent`]                     |
//! | metadata      | TEXT    | JSON [`RecordMetadata`]                           |
//! | importance    | INTEGER | `1..=100`, enforced by a `CHECK` constraint       |
//! | created_at    | TEXT    | RFC-3339 UTC, microsecond precision               |
//! | access_count  | INTEGER | retrieval batches that returned the record        |
//! | last_accessed | TEXT    | RFC-3339 UTC, NULL until first retrieval          |
//! | expires_at    | TEXT    | RFC-3339 UTC, NULL for permanent records          |
//! | tags          | TEXT    | comma-joined keywords (at most five)              |
//!
//! Table `memory_relations` holds `(from_id, to_id, kind, strength)` edges.
//! There are no foreign keys: edges may outlive either endpoint.
//!
//! All timestamps share one fixed-width format, so string comparison in SQL
//! is chronological comparison.
//!
//! # Example
//!
//! ```rust
//! use keepsake_memory::store::{MemoryStore, NewRecord, RecordFilter};
//! use keepsake_types::{Importance, MemoryKind};
//!
//! let store = MemoryStore::open_in_memory().unwrap();
//! let record = NewRecord::event(
//!     MemoryKind::event("system").unwrap(),
//!     serde_json::json!({ "note": "woke up early" }),
//! )
//! .unwrap()
//! .importance(Importance::new(60))
//! .tags(vec!["woke".into(), "early".into()]);
//!
//! let id = store.create_record(record).unwrap();
//! let found = store.query(&RecordFilter::new().any_tag("early")).unwrap();
//! assert_eq!(found[0].id, id);
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use keepsake_types::{
    Importance, MemoryContent, MemoryKind, MemoryRecord, RecordId, RecordMetadata, Relation,
    RelationKind,
};
use rusqlite::types::{Type, Value as SqlValue};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde::Serialize;
use tracing::{debug, warn};

use crate::connection::{ConnectionSource, DEFAULT_BUSY_TIMEOUT};
use crate::error::{MemoryError, Result};
use crate::keywords::{MAX_QUERY_KEYWORDS, MAX_TAGS};

/// Upper bound on the serialised size of a record's content.
pub const MAX_CONTENT_BYTES: usize = 64 * 1024;

const SELECT_COLUMNS: &str = "m.id, m.kind, m.content, m.metadata, m.importance, m.created_at, \
     m.access_count, m.last_accessed, m.expires_at, m.tags";

/// Shared predicate deciding whether a row is still live at `?`.
///
/// Read filters and [`MemoryStore::delete_expired`] both use it, so a record
/// is never visible to readers after the instant consolidation would delete it.
const LIVE_PREDICATE: &str = "(expires_at IS NULL OR expires_at > ?)";

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS memories (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            kind          TEXT    NOT NULL,
            content       TEXT    NOT NULL,
            metadata      TEXT    NOT NULL DEFAULT '{}',
            importance    INTEGER NOT NULL DEFAULT 50 CHECK (importance BETWEEN 1 AND 100),
            created_at    TEXT    NOT NULL,
            access_count  INTEGER NOT NULL DEFAULT 0,
            last_accessed TEXT,
            expires_at    TEXT,
            tags          TEXT    NOT NULL DEFAULT ''
        );
        CREATE INDEX IF NOT EXISTS idx_memories_kind ON memories(kind);
        CREATE INDEX IF NOT EXISTS idx_memories_created_at ON memories(created_at);
        CREATE INDEX IF NOT EXISTS idx_memories_importance ON memories(importance);
        CREATE TABLE IF NOT EXISTS memory_relations (
            from_id  INTEGER NOT NULL,
            to_id    INTEGER NOT NULL,
            kind     TEXT    NOT NULL,
            strength REAL    NOT NULL DEFAULT 1.0
        );
        CREATE INDEX IF NOT EXISTS idx_relations_from ON memory_relations(from_id);
        CREATE INDEX IF NOT EXISTS idx_relations_to ON memory_relations(to_id);",
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Timestamp helpers
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Escape `%`, `_` and the escape character itself for a `LIKE ... ESCAPE '\'`.
fn like_escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

// ─────────────────────────────────────────────────────────────────────────────
// NewRecord
// ─────────────────────────────────────────────────────────────────────────────

/// A record about to be written. Built by writers, consumed by
/// [`MemoryStore::create_record`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewRecord {
    pub kind: MemoryKind,
    pub content: MemoryContent,
    pub metadata: RecordMetadata,
    pub importance: Importance,
    pub tags: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl NewRecord {
    pub fn new(kind: MemoryKind, content: MemoryContent) -> Self {
        let size = content.text_len();
        Self {
            kind,
            content,
            metadata: RecordMetadata {
                size,
                ..RecordMetadata::default()
            },
            importance: Importance::NEUTRAL,
            tags: Vec::new(),
            expires_at: None,
        }
    }

    /// Event record from a JSON payload. The payload must be an object.
    pub fn event(kind: MemoryKind, payload: serde_json::Value) -> Result<Self> {
        match payload {
            serde_json::Value::Object(payload) => {
                Ok(Self::new(kind, MemoryContent::Event { payload }))
            }
            other => Err(MemoryError::MalformedRecord(format!(
                "event payload must be a JSON object, got {other}"
            ))),
        }
    }

    pub fn metadata(mut self, metadata: RecordMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn importance(mut self, importance: Importance) -> Self {
        self.importance = importance;
        self
    }

    pub fn tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn expires_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = at;
        self
    }

    /// Reject records that must never reach the store and normalise the tag
    /// list (trimmed, comma-free, distinct, at most [`MAX_TAGS`]).
    fn validate(&mut self) -> Result<()> {
        if MemoryKind::from_label(&self.kind.label()).ok().as_ref() != Some(&self.kind) {
            return Err(MemoryError::MalformedRecord(format!(
                "kind label '{}' does not round-trip",
                self.kind
            )));
        }
        match (&self.kind, &self.content) {
            (MemoryKind::Conversation, MemoryContent::Conversation { user, agent, .. }) => {
                if user.trim().is_empty() && agent.trim().is_empty() {
                    return Err(MemoryError::MalformedRecord(
                        "conversation has neither user nor agent text".to_string(),
                    ));
                }
            }
            (MemoryKind::Conversation, MemoryContent::Event { .. }) => {
                return Err(MemoryError::MalformedRecord(
                    "conversation kind requires conversation content".to_string(),
                ));
            }
            (_, MemoryContent::Conversation { .. }) => {
                return Err(MemoryError::MalformedRecord(format!(
                    "kind '{}' cannot carry conversation content",
                    self.kind
                )));
            }
            (_, MemoryContent::Event { .. }) => {}
        }

        let context_emotion = match &self.content {
            MemoryContent::Conversation { context, .. } => Some(&context.emotion),
            MemoryContent::Event { .. } => None,
        };
        for emotion in context_emotion.into_iter().chain(self.metadata.emotion.as_ref()) {
            if !emotion.in_range() {
                return Err(MemoryError::MalformedRecord(
                    "emotion dials must be finite values in 0..=100".to_string(),
                ));
            }
        }

        let mut tags: Vec<String> = Vec::with_capacity(MAX_TAGS);
        for tag in &self.tags {
            let clean: String = tag.trim().chars().filter(|c| *c != ',').collect();
            if !clean.is_empty() && !tags.contains(&clean) {
                tags.push(clean);
            }
            if tags.len() == MAX_TAGS {
                break;
            }
        }
        self.tags = tags;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Filters and predicates
// ─────────────────────────────────────────────────────────────────────────────

/// How to match a record's kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KindMatch {
    Exact(MemoryKind),
    /// Label prefix, e.g. `"interaction_"`.
    Prefix(String),
}

impl KindMatch {
    fn push_sql(&self, clauses: &mut Vec<String>, params: &mut Vec<SqlValue>) {
        match self {
            KindMatch::Exact(kind) => {
                clauses.push("kind = ?".to_string());
                params.push(SqlValue::Text(kind.label()));
            }
            KindMatch::Prefix(prefix) => {
                clauses.push("kind LIKE ? ESCAPE '\\'".to_string());
                params.push(SqlValue::Text(format!("{}%", like_escape(prefix))));
            }
        }
    }
}

/// Result ordering for [`MemoryStore::query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordOrder {
    /// Importance descending, then newest first.
    #[default]
    ImportanceThenRecency,
    /// Newest first.
    Recency,
}

impl RecordOrder {
    fn sql(self) -> &'static str {
        match self {
            RecordOrder::ImportanceThenRecency => {
                "ORDER BY m.importance DESC, m.created_at DESC, m.id DESC"
            }
            RecordOrder::Recency => "ORDER BY m.created_at DESC, m.id DESC",
        }
    }
}

/// Selection criteria for [`MemoryStore::query`].
///
/// A fresh filter excludes records already expired at construction time;
/// use [`live_at`](Self::live_at) to pin the instant or
/// [`include_expired`](Self::include_expired) to see everything.
#[derive(Debug, Clone)]
pub struct RecordFilter {
    pub kind: Option<KindMatch>,
    /// Tag substrings, OR-combined. Only the first three are used.
    pub tags_any: Vec<String>,
    pub min_importance: Option<Importance>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub exclude_ids: Vec<RecordId>,
    pub live_at: Option<DateTime<Utc>>,
    pub order: RecordOrder,
    pub limit: Option<usize>,
}

impl Default for RecordFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordFilter {
    pub fn new() -> Self {
        Self {
            kind: None,
            tags_any: Vec::new(),
            min_importance: None,
            created_after: None,
            created_before: None,
            exclude_ids: Vec::new(),
            live_at: Some(Utc::now()),
            order: RecordOrder::default(),
            limit: None,
        }
    }

    pub fn kind(mut self, kind: MemoryKind) -> Self {
        self.kind = Some(KindMatch::Exact(kind));
        self
    }

    pub fn kind_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.kind = Some(KindMatch::Prefix(prefix.into()));
        self
    }

    pub fn any_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags_any.push(tag.into());
        self
    }

    pub fn any_tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.tags_any.extend(tags);
        self
    }

    pub fn min_importance(mut self, importance: Importance) -> Self {
        self.min_importance = Some(importance);
        self
    }

    pub fn created_between(mut self, after: Option<DateTime<Utc>>, before: Option<DateTime<Utc>>) -> Self {
        self.created_after = after;
        self.created_before = before;
        self
    }

    pub fn exclude(mut self, ids: impl IntoIterator<Item = RecordId>) -> Self {
        self.exclude_ids.extend(ids);
        self
    }

    pub fn live_at(mut self, now: DateTime<Utc>) -> Self {
        self.live_at = Some(now);
        self
    }

    pub fn include_expired(mut self) -> Self {
        self.live_at = None;
        self
    }

    pub fn order(mut self, order: RecordOrder) -> Self {
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn to_sql(&self) -> (String, Vec<SqlValue>) {
        let mut clauses = Vec::new();
        let mut params = Vec::new();

        if let Some(kind) = &self.kind {
            kind.push_sql(&mut clauses, &mut params);
        }
        let tags: Vec<&String> = self
            .tags_any
            .iter()
            .filter(|t| !t.trim().is_empty())
            .take(MAX_QUERY_KEYWORDS)
            .collect();
        if !tags.is_empty() {
            let ors = vec!["tags LIKE ? ESCAPE '\\'"; tags.len()].join(" OR ");
            clauses.push(format!("({ors})"));
            for tag in tags {
                params.push(SqlValue::Text(format!("%{}%", like_escape(tag.trim()))));
            }
        }
        if let Some(min) = self.min_importance {
            clauses.push("importance >= ?".to_string());
            params.push(SqlValue::Integer(i64::from(min)));
        }
        if let Some(after) = self.created_after {
            clauses.push("created_at >= ?".to_string());
            params.push(SqlValue::Text(ts(after)));
        }
        if let Some(before) = self.created_before {
            clauses.push("created_at < ?".to_string());
            params.push(SqlValue::Text(ts(before)));
        }
        if !self.exclude_ids.is_empty() {
            let marks = vec!["?"; self.exclude_ids.len()].join(", ");
            clauses.push(format!("id NOT IN ({marks})"));
            params.extend(self.exclude_ids.iter().map(|id| SqlValue::Integer(*id)));
        }
        if let Some(now) = self.live_at {
            clauses.push(LIVE_PREDICATE.to_string());
            params.push(SqlValue::Text(ts(now)));
        }

        let mut sql = format!("SELECT {SELECT_COLUMNS} FROM memories m");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push(' ');
        sql.push_str(self.order.sql());
        if let Some(limit) = self.limit {
            sql.push_str(" LIMIT ?");
            params.push(SqlValue::Integer(limit as i64));
        }
        (sql, params)
    }
}

/// Criteria for [`MemoryStore::delete_where`]. All set conditions must hold.
/// A predicate with no condition matches nothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeletePredicate {
    pub kind: Option<KindMatch>,
    /// Importance strictly below this value.
    pub importance_below: Option<Importance>,
    /// Not retrieved since this instant (records never retrieved fall back
    /// to their creation time).
    pub idle_since: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl DeletePredicate {
    fn is_empty(&self) -> bool {
        self.kind.is_none()
            && self.importance_below.is_none()
            && self.idle_since.is_none()
            && self.created_before.is_none()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Stats
// ─────────────────────────────────────────────────────────────────────────────

/// Aggregate counters over the whole store.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreStats {
    pub total_records: u64,
    pub by_kind: BTreeMap<String, u64>,
    /// Mean importance rounded to two decimals; `0.0` for an empty store.
    pub average_importance: f64,
    pub relations: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// MemoryStore
// ─────────────────────────────────────────────────────────────────────────────

/// SQLite-backed store of memory records and relations.
pub struct MemoryStore {
    source: ConnectionSource,
}

impl MemoryStore {
    /// Open (or create) a persistent store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Open a persistent store whose handles wait at most `busy_timeout` on a
    /// locked database.
    pub fn open_with_timeout(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let source = ConnectionSource::open_file(path.as_ref(), busy_timeout, init_schema)?;
        Ok(Self { source })
    }

    /// Open a temporary in-memory store (useful for testing).
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            source: ConnectionSource::open_in_memory(init_schema)?,
        })
    }

    /// Release the calling thread's database handle.
    pub fn close_thread_connection(&self) {
        self.source.release_current_thread();
    }

    // ── writes ────────────────────────────────────────────────────────────────

    /// Validate and persist a new record, returning its id.
    pub fn create_record(&self, record: NewRecord) -> Result<RecordId> {
        self.insert_record(record, Utc::now()).map(|r| r.id)
    }

    /// Validate and persist a new record created at `created_at`, returning
    /// the stored row.
    pub fn insert_record(&self, mut record: NewRecord, created_at: DateTime<Utc>) -> Result<MemoryRecord> {
        record.validate()?;
        let content = serde_json::to_string(&record.content)?;
        if content.len() > MAX_CONTENT_BYTES {
            return Err(MemoryError::MalformedRecord(format!(
                "content is {} bytes, limit is {MAX_CONTENT_BYTES}",
                content.len()
            )));
        }
        let metadata = serde_json::to_string(&record.metadata)?;
        let tags = record.tags.join(",");
        let id = self.source.with(|conn| {
            conn.execute(
                "INSERT INTO memories
                     (kind, content, metadata, importance, created_at, access_count, last_accessed, expires_at, tags)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, NULL, ?6, ?7)",
                params![
                    record.kind.label(),
                    content,
                    metadata,
                    i64::from(record.importance),
                    ts(created_at),
                    record.expires_at.map(ts),
                    tags,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        debug!(id, kind = %record.kind, importance = %record.importance, "stored memory record");
        Ok(MemoryRecord {
            id,
            kind: record.kind,
            content: record.content,
            metadata: record.metadata,
            importance: record.importance,
            created_at: parse_ts(5, &ts(created_at))?,
            access_count: 0,
            last_accessed: None,
            expires_at: record.expires_at.map(|t| parse_ts(8, &ts(t))).transpose()?,
            tags: record.tags,
        })
    }

    /// Record a directed edge. Returns [`MemoryError::NotFound`] naming the
    /// missing endpoint when either record has been deleted meanwhile.
    pub fn create_relation(&self, from_id: RecordId, to_id: RecordId, kind: RelationKind, strength: f32) -> Result<()> {
        let missing = self.source.with(|conn| {
            let inserted = conn.execute(
                "INSERT INTO memory_relations (from_id, to_id, kind, strength)
                 SELECT ?1, ?2, ?3, ?4
                 WHERE EXISTS (SELECT 1 FROM memories WHERE id = ?1)
                   AND EXISTS (SELECT 1 FROM memories WHERE id = ?2)",
                params![from_id, to_id, kind.as_str(), f64::from(strength)],
            )?;
            if inserted == 1 {
                return Ok(None);
            }
            let from_exists: bool = conn.query_row(
                "SELECT EXISTS (SELECT 1 FROM memories WHERE id = ?1)",
                params![from_id],
                |r| r.get(0),
            )?;
            Ok(Some(if from_exists { to_id } else { from_id }))
        })?;
        match missing {
            None => Ok(()),
            Some(id) => Err(MemoryError::NotFound(id)),
        }
    }

    /// Overwrite a record's importance (clamped by construction).
    pub fn update_importance(&self, id: RecordId, importance: Importance) -> Result<()> {
        let changed = self.source.with(|conn| {
            conn.execute(
                "UPDATE memories SET importance = ?2 WHERE id = ?1",
                params![id, i64::from(importance)],
            )
        })?;
        if changed == 0 {
            return Err(MemoryError::NotFound(id));
        }
        Ok(())
    }

    /// Count one access at `now`: `access_count += 1`, `last_accessed = now`.
    pub fn touch_access(&self, id: RecordId, now: DateTime<Utc>) -> Result<()> {
        let changed = self.source.with(|conn| {
            conn.execute(
                "UPDATE memories SET access_count = access_count + 1, last_accessed = ?2 WHERE id = ?1",
                params![id, ts(now)],
            )
        })?;
        if changed == 0 {
            return Err(MemoryError::NotFound(id));
        }
        Ok(())
    }

    /// Touch every id once in a single transaction. Returns the ids that
    /// still existed; missing ones are skipped.
    pub fn touch_many(&self, ids: &[RecordId], now: DateTime<Utc>) -> Result<Vec<RecordId>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let stamp = ts(now);
        self.source.with(|conn| {
            let tx = conn.unchecked_transaction()?;
            let mut touched = Vec::with_capacity(ids.len());
            {
                let mut stmt = tx.prepare_cached(
                    "UPDATE memories SET access_count = access_count + 1, last_accessed = ?2 WHERE id = ?1",
                )?;
                for id in ids {
                    if stmt.execute(params![id, stamp])? == 1 {
                        touched.push(*id);
                    }
                }
            }
            tx.commit()?;
            Ok(touched)
        })
    }

    /// Delete every record expired at `now`, returning the removed ids.
    pub fn delete_expired(&self, now: DateTime<Utc>) -> Result<Vec<RecordId>> {
        self.source.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "DELETE FROM memories WHERE NOT {LIVE_PREDICATE} RETURNING id"
            ))?;
            let ids = stmt.query_map(params![ts(now)], |r| r.get(0))?;
            ids.collect()
        })
    }

    /// Delete every record matching `predicate`, returning the removed ids.
    pub fn delete_where(&self, predicate: &DeletePredicate) -> Result<Vec<RecordId>> {
        if predicate.is_empty() {
            warn!("delete_where called with an empty predicate; nothing deleted");
            return Ok(Vec::new());
        }
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        if let Some(kind) = &predicate.kind {
            kind.push_sql(&mut clauses, &mut values);
        }
        if let Some(below) = predicate.importance_below {
            clauses.push("importance < ?".to_string());
            values.push(SqlValue::Integer(i64::from(below)));
        }
        if let Some(since) = predicate.idle_since {
            clauses.push("COALESCE(last_accessed, created_at) < ?".to_string());
            values.push(SqlValue::Text(ts(since)));
        }
        if let Some(before) = predicate.created_before {
            clauses.push("created_at < ?".to_string());
            values.push(SqlValue::Text(ts(before)));
        }
        let sql = format!(
            "DELETE FROM memories WHERE {} RETURNING id",
            clauses.join(" AND ")
        );
        self.source.with(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let ids = stmt.query_map(params_from_iter(values.iter()), |r| r.get(0))?;
            ids.collect()
        })
    }

    /// Raise the importance of frequently retrieved records:
    /// `importance = min(100, importance + step)` where
    /// `access_count >= min_access` and `importance < below`.
    pub fn reinforce_frequent(&self, min_access: u32, below: Importance, step: u8) -> Result<usize> {
        self.source.with(|conn| {
            conn.execute(
                "UPDATE memories SET importance = MIN(100, importance + ?3)
                 WHERE access_count >= ?1 AND importance < ?2",
                params![min_access, i64::from(below), step],
            )
        })
    }

    /// Lower the importance of records last retrieved before `cutoff`:
    /// `importance = max(1, importance - step)` where `importance > above`.
    /// Records never retrieved are left alone.
    pub fn decay_idle(&self, cutoff: DateTime<Utc>, above: Importance, step: u8) -> Result<usize> {
        self.source.with(|conn| {
            conn.execute(
                "UPDATE memories SET importance = MAX(1, importance - ?3)
                 WHERE last_accessed IS NOT NULL AND last_accessed < ?1 AND importance > ?2",
                params![ts(cutoff), i64::from(above), step],
            )
        })
    }

    // ── reads ─────────────────────────────────────────────────────────────────

    /// Return the records selected by `filter`.
    pub fn query(&self, filter: &RecordFilter) -> Result<Vec<MemoryRecord>> {
        let (sql, values) = filter.to_sql();
        self.source.with(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(values.iter()), row_to_record)?;
            rows.collect()
        })
    }

    /// Fetch a single record regardless of expiry.
    pub fn get(&self, id: RecordId) -> Result<MemoryRecord> {
        self.source
            .with(|conn| {
                conn.query_row(
                    &format!("SELECT {SELECT_COLUMNS} FROM memories m WHERE m.id = ?1"),
                    params![id],
                    row_to_record,
                )
                .optional()
            })?
            .ok_or(MemoryError::NotFound(id))
    }

    /// Fetch the records live at `now` among `ids`, in the order given.
    /// Missing or expired ids are skipped.
    pub fn get_many(&self, ids: &[RecordId], now: DateTime<Utc>) -> Result<Vec<MemoryRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let marks = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM memories m WHERE m.id IN ({marks}) AND {LIVE_PREDICATE}"
        );
        let mut values: Vec<SqlValue> = ids.iter().map(|id| SqlValue::Integer(*id)).collect();
        values.push(SqlValue::Text(ts(now)));
        let found: Vec<MemoryRecord> = self.source.with(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(values.iter()), row_to_record)?;
            rows.collect()
        })?;
        let mut by_id: HashMap<RecordId, MemoryRecord> = found.into_iter().map(|r| (r.id, r)).collect();
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    /// The `limit` newest records live at `now`.
    pub fn recent(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<MemoryRecord>> {
        self.query(
            &RecordFilter::new()
                .live_at(now)
                .order(RecordOrder::Recency)
                .limit(limit),
        )
    }

    /// Creation time of the newest record whose kind label starts with
    /// `kind_prefix`.
    pub fn last_created_at(&self, kind_prefix: &str) -> Result<Option<DateTime<Utc>>> {
        let raw: Option<String> = self.source.with(|conn| {
            conn.query_row(
                "SELECT created_at FROM memories WHERE kind LIKE ?1 ESCAPE '\\'
                 ORDER BY created_at DESC LIMIT 1",
                params![format!("{}%", like_escape(kind_prefix))],
                |r| r.get(0),
            )
            .optional()
        })?;
        Ok(raw.map(|s| parse_ts(0, &s)).transpose()?)
    }

    /// Every record with its flattened text, oldest first. Used to rebuild
    /// derived indices.
    pub fn all_texts(&self) -> Result<Vec<(RecordId, String)>> {
        let records = self.query(&RecordFilter::new().include_expired().order(RecordOrder::Recency))?;
        Ok(records.into_iter().rev().map(|r| (r.id, r.content.text())).collect())
    }

    /// Outgoing edges of `id`, including dangling ones.
    pub fn relations_from(&self, id: RecordId) -> Result<Vec<Relation>> {
        self.source.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT from_id, to_id, kind, strength FROM memory_relations
                 WHERE from_id = ?1 ORDER BY rowid ASC",
            )?;
            let rows = stmt.query_map(params![id], |row| {
                let kind_raw: String = row.get(2)?;
                let kind = RelationKind::from_label(&kind_raw).ok_or_else(|| {
                    rusqlite::Error::InvalidColumnType(2, kind_raw, Type::Text)
                })?;
                let strength: f64 = row.get(3)?;
                Ok(Relation {
                    from_id: row.get(0)?,
                    to_id: row.get(1)?,
                    kind,
                    strength: strength as f32,
                })
            })?;
            rows.collect()
        })
    }

    /// Records linked to `id` in either direction that still exist and are
    /// live at `now`, strongest and most important first. Dangling edges are
    /// skipped.
    pub fn related_records(&self, id: RecordId, now: DateTime<Utc>, limit: usize) -> Result<Vec<MemoryRecord>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM memories m
             JOIN (
                 SELECT to_id AS other, strength FROM memory_relations WHERE from_id = ?1
                 UNION ALL
                 SELECT from_id AS other, strength FROM memory_relations WHERE to_id = ?1
             ) r ON r.other = m.id
             WHERE m.id != ?1 AND {}
             GROUP BY m.id
             ORDER BY MAX(r.strength) DESC, m.importance DESC, m.created_at DESC
             LIMIT ?3",
            LIVE_PREDICATE.replace('?', "?2")
        );
        self.source.with(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![id, ts(now), limit as i64], row_to_record)?;
            rows.collect()
        })
    }

    /// Aggregate counters over the whole store.
    pub fn stats(&self) -> Result<StoreStats> {
        self.source.with(|conn| {
            let (total, avg): (i64, Option<f64>) = conn.query_row(
                "SELECT COUNT(*), AVG(importance) FROM memories",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )?;
            let relations: i64 =
                conn.query_row("SELECT COUNT(*) FROM memory_relations", [], |r| r.get(0))?;
            let mut stmt = conn.prepare("SELECT kind, COUNT(*) FROM memories GROUP BY kind ORDER BY kind")?;
            let by_kind = stmt
                .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)? as u64)))?
                .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;
            Ok(StoreStats {
                total_records: total as u64,
                by_kind,
                average_importance: (avg.unwrap_or(0.0) * 100.0).round() / 100.0,
                relations: relations as u64,
            })
        })
    }
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<MemoryRecord> {
    let kind_raw: String = row.get(1)?;
    let kind = MemoryKind::from_label(&kind_raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?;
    let created_raw: String = row.get(5)?;
    let last_raw: Option<String> = row.get(7)?;
    let expires_raw: Option<String> = row.get(8)?;
    let tags_raw: String = row.get(9)?;
    let access_count: i64 = row.get(6)?;
    Ok(MemoryRecord {
        id: row.get(0)?,
        kind,
        content: json_column(row, 2)?,
        metadata: json_column(row, 3)?,
        importance: Importance::new(row.get(4)?),
        created_at: parse_ts(5, &created_raw)?,
        access_count: access_count.max(0) as u32,
        last_accessed: last_raw.map(|s| parse_ts(7, &s)).transpose()?,
        expires_at: expires_raw.map(|s| parse_ts(8, &s)).transpose()?,
        tags: tags_raw
            .split(',')
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect(),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
