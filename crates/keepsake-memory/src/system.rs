//! The memory facade used by the rest of the companion.
//!
//! [`MemorySystem`] wires the store, scorer, relation builder, optional
//! semantic index, cache and consolidation job together. It is `Send +
//! Sync`; share it behind an `Arc` and call it from any thread.
//!
//! Write path: score → persist → link relations → index → push to cache.
//! Only the persist step can fail the write; the later steps are
//! best-effort and log their failures.
//!
//! # Example
//!
//! ```rust
//! use keepsake_memory::{ConversationContext, MemorySystem};
//!
//! let memory = MemorySystem::open_in_memory(None).unwrap();
//! memory
//!     .record_conversation("My birthday is in May", "I'll remember that!", ConversationContext::default())
//!     .unwrap();
//! let hits = memory.retrieve_related("birthday", 3);
//! assert_eq!(hits.len(), 1);
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use keepsake_types::{
    Direction, EmotionSnapshot, Importance, MemoryContent, MemoryKind, MemoryRecord, RecordId,
    RecordMetadata, SituationContext,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::cache::{DEFAULT_CACHE_SIZE, DEFAULT_IMPORTANT_THRESHOLD, MemoryCache};
use crate::connection::DEFAULT_BUSY_TIMEOUT;
use crate::consolidation::{ConsolidationJob, ConsolidationPolicy, ConsolidationReport};
use crate::error::{MemoryError, Result};
use crate::keywords;
use crate::relations;
use crate::retrieval::{RetrievalEngine, RetrievedMemory};
use crate::scorer;
use crate::semantic_index::{
    DEFAULT_INDEX_TIMEOUT, Embedder, GuardedIndex, SemanticIndex, VectorIndex,
};
use crate::store::{DeletePredicate, KindMatch, MemoryStore, NewRecord, StoreStats};

/// Related-record fan-out used when none is given.
pub const DEFAULT_RELATED_LIMIT: usize = 5;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Settings for [`MemorySystem::open`].
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryConfig {
    /// Root data directory. Databases live under `<data_path>/memory/`.
    pub data_path: PathBuf,
    pub cache_size: usize,
    pub important_threshold: Importance,
    pub busy_timeout: Duration,
    pub index_timeout: Duration,
    pub policy: ConsolidationPolicy,
}

impl MemoryConfig {
    pub fn new(data_path: impl Into<PathBuf>) -> Self {
        Self {
            data_path: data_path.into(),
            cache_size: DEFAULT_CACHE_SIZE,
            important_threshold: DEFAULT_IMPORTANT_THRESHOLD,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            index_timeout: DEFAULT_INDEX_TIMEOUT,
            policy: ConsolidationPolicy::default(),
        }
    }

    pub fn memory_dir(&self) -> PathBuf {
        self.data_path.join("memory")
    }

    pub fn records_path(&self) -> PathBuf {
        self.memory_dir().join("memories.db")
    }

    pub fn vectors_path(&self) -> PathBuf {
        self.memory_dir().join("vectors.db")
    }
}

/// Open the vector index for `config`, or `None` if it cannot be opened.
///
/// The index is optional: a failure here is logged and the system runs on
/// keyword search alone.
pub fn open_semantic_index(config: &MemoryConfig, embedder: Box<dyn Embedder>) -> Option<Arc<dyn SemanticIndex>> {
    match VectorIndex::open(config.vectors_path(), embedder) {
        Ok(index) => Some(Arc::new(index)),
        Err(e) => {
            warn!(error = %e, "semantic index unavailable; falling back to keyword search");
            None
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Call arguments and results
// ─────────────────────────────────────────────────────────────────────────────

/// Situation supplied by the conversation handler with each exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationContext {
    pub participant_id: Option<String>,
    pub emotion: EmotionSnapshot,
    pub message_type: String,
    /// When the exchange happened; defaults to the write time.
    pub timestamp: Option<DateTime<Utc>>,
}

impl Default for ConversationContext {
    fn default() -> Self {
        Self {
            participant_id: None,
            emotion: EmotionSnapshot::default(),
            message_type: "text".to_string(),
            timestamp: None,
        }
    }
}

/// What [`MemorySystem::purge_stale`] removes. Conditions are AND-combined;
/// with none set nothing is removed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PurgeCriteria {
    pub kind: Option<KindMatch>,
    pub importance_below: Option<Importance>,
    /// Not retrieved (or, if never retrieved, not created) for this long.
    pub idle_for: Option<chrono::Duration>,
    pub older_than: Option<chrono::Duration>,
}

impl PurgeCriteria {
    fn at(&self, now: DateTime<Utc>) -> DeletePredicate {
        DeletePredicate {
            kind: self.kind.clone(),
            importance_below: self.importance_below,
            idle_since: self.idle_for.map(|d| now - d),
            created_before: self.older_than.map(|d| now - d),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryStats {
    #[serde(flatten)]
    pub store: StoreStats,
    pub cached_recent: usize,
    pub cached_important: usize,
    pub semantic_index: bool,
}

/// Payload field that, when an integer, overrides the computed importance
/// of an event.
const IMPORTANCE_FIELD: &str = "importance";

// ─────────────────────────────────────────────────────────────────────────────
// MemorySystem
// ─────────────────────────────────────────────────────────────────────────────

pub struct MemorySystem {
    store: Arc<MemoryStore>,
    index: Option<Arc<dyn SemanticIndex>>,
    cache: MemoryCache,
    retrieval: RetrievalEngine,
    consolidation: ConsolidationJob,
}

impl MemorySystem {
    /// Open the persistent system described by `config`.
    ///
    /// `index` is wrapped so each call is bounded by `config.index_timeout`.
    pub fn open(config: &MemoryConfig, index: Option<Arc<dyn SemanticIndex>>) -> Result<Self> {
        std::fs::create_dir_all(config.memory_dir())?;
        let store = MemoryStore::open_with_timeout(config.records_path(), config.busy_timeout)?;
        info!(path = %config.records_path().display(), semantic = index.is_some(), "opened memory store");
        Self::from_store(store, config, index)
    }

    /// Open a system backed by an in-memory store with default settings.
    pub fn open_in_memory(index: Option<Arc<dyn SemanticIndex>>) -> Result<Self> {
        Self::from_store(MemoryStore::open_in_memory()?, &MemoryConfig::new("."), index)
    }

    /// Assemble a system around an already opened store.
    pub fn from_store(
        store: MemoryStore,
        config: &MemoryConfig,
        index: Option<Arc<dyn SemanticIndex>>,
    ) -> Result<Self> {
        let store = Arc::new(store);
        let index: Option<Arc<dyn SemanticIndex>> = index.map(|inner| {
            Arc::new(GuardedIndex::new(inner, config.index_timeout)) as Arc<dyn SemanticIndex>
        });
        let cache = MemoryCache::new(config.cache_size, config.important_threshold);
        cache.reload(&store, Utc::now())?;
        Ok(Self {
            retrieval: RetrievalEngine::new(Arc::clone(&store), index.clone()),
            consolidation: ConsolidationJob::new(config.policy),
            store,
            index,
            cache,
        })
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn has_semantic_index(&self) -> bool {
        self.index.is_some()
    }

    // ── writes ────────────────────────────────────────────────────────────────

    /// Store one conversational exchange.
    pub fn record_conversation(&self, user: &str, agent: &str, ctx: ConversationContext) -> Result<RecordId> {
        let now = Utc::now();
        let content = MemoryContent::Conversation {
            user: user.to_string(),
            agent: agent.to_string(),
            context: SituationContext {
                emotion: ctx.emotion.clone(),
                timestamp: ctx.timestamp.unwrap_or(now),
                message_type: ctx.message_type,
            },
        };
        let metadata = RecordMetadata {
            participant_id: ctx.participant_id,
            emotion: (!ctx.emotion.is_empty()).then_some(ctx.emotion),
            size: content.text_len(),
            ..RecordMetadata::default()
        };
        let kind = MemoryKind::Conversation;
        let importance = scorer::score(&kind, &content, &metadata);
        let tags = keywords::tags_for(&content.text());
        let record = NewRecord::new(kind, content)
            .metadata(metadata)
            .importance(importance)
            .tags(tags);
        self.write(record, now)
    }

    /// Store a system or life event. `payload` must be a JSON object.
    pub fn record_event(&self, kind: MemoryKind, payload: serde_json::Value) -> Result<RecordId> {
        self.write_event(kind, payload, None)
    }

    /// Store an event that stops being retrievable after `ttl`.
    pub fn record_event_expiring(
        &self,
        kind: MemoryKind,
        payload: serde_json::Value,
        ttl: chrono::Duration,
    ) -> Result<RecordId> {
        self.write_event(kind, payload, Some(Utc::now() + ttl))
    }

    /// Log a message received from or sent to the user.
    pub fn record_interaction(&self, direction: Direction, payload: serde_json::Value) -> Result<RecordId> {
        self.write_event(MemoryKind::Interaction(direction), payload, None)
    }

    fn write_event(
        &self,
        kind: MemoryKind,
        payload: serde_json::Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<RecordId> {
        let override_importance = payload
            .get(IMPORTANCE_FIELD)
            .and_then(serde_json::Value::as_i64)
            .map(Importance::new);
        let record = NewRecord::event(kind, payload)?;
        let importance = override_importance
            .unwrap_or_else(|| scorer::score(&record.kind, &record.content, &record.metadata));
        let tags = keywords::tags_for(&record.content.text());
        self.write(
            record.importance(importance).tags(tags).expires_at(expires_at),
            Utc::now(),
        )
    }

    fn write(&self, record: NewRecord, now: DateTime<Utc>) -> Result<RecordId> {
        let stored = self.store.insert_record(record, now)?;
        let id = stored.id;

        if let Err(e) = relations::link_new_record(&self.store, id, &stored.tags, now) {
            warn!(id, error = %e, "failed to link memory record");
        }
        if let Some(index) = &self.index {
            if let Err(e) = index.index(id, &stored.content.text()) {
                warn!(id, error = %e, "failed to index memory record");
            }
        }
        self.cache.push_recent(stored, now);
        Ok(id)
    }

    // ── reads ─────────────────────────────────────────────────────────────────

    /// Records related to `query`, semantic hits first. Failures are logged
    /// and produce an empty result.
    pub fn retrieve_related(&self, query: &str, limit: usize) -> Vec<RetrievedMemory> {
        match self.retrieval.retrieve(query, limit, Utc::now()) {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "memory retrieval failed");
                Vec::new()
            }
        }
    }

    /// The `limit` newest live records, read from the store.
    pub fn recent(&self, limit: usize) -> Result<Vec<MemoryRecord>> {
        self.store.recent(limit, Utc::now())
    }

    /// Creation time of the newest record whose kind starts with `kind_prefix`.
    pub fn last_timestamp_of(&self, kind_prefix: &str) -> Result<Option<DateTime<Utc>>> {
        self.store.last_created_at(kind_prefix)
    }

    pub fn cached_recent(&self, limit: usize) -> Vec<MemoryRecord> {
        self.cache.recent(limit)
    }

    pub fn cached_important(&self) -> Vec<MemoryRecord> {
        self.cache.important()
    }

    /// Records linked to `id` by relation edges.
    pub fn related_to(&self, id: RecordId, limit: usize) -> Result<Vec<MemoryRecord>> {
        self.store.related_records(id, Utc::now(), limit)
    }

    pub fn stats(&self) -> Result<MemoryStats> {
        let snapshot = self.cache.snapshot();
        Ok(MemoryStats {
            store: self.store.stats()?,
            cached_recent: snapshot.recent.len(),
            cached_important: snapshot.important.len(),
            semantic_index: self.index.is_some(),
        })
    }

    // ── maintenance ───────────────────────────────────────────────────────────

    /// One consolidation pass, or `None` if one is already running.
    pub fn run_consolidation(&self) -> Option<ConsolidationReport> {
        self.consolidation
            .run(&self.store, &self.cache, self.index.as_deref(), Utc::now())
    }

    /// Delete the records matching `criteria`, returning how many went.
    pub fn purge_stale(&self, criteria: &PurgeCriteria) -> Result<usize> {
        let now = Utc::now();
        let removed = self.store.delete_where(&criteria.at(now))?;
        if removed.is_empty() {
            return Ok(0);
        }
        if let Some(index) = &self.index {
            if let Err(e) = index.remove(&removed) {
                warn!(error = %e, removed = removed.len(), "failed to drop purged records from semantic index");
            }
        }
        if let Err(e) = self.cache.reload(&self.store, now) {
            warn!(error = %e, "failed to reload cache after purge");
        }
        info!(removed = removed.len(), "purged stale memories");
        Ok(removed.len())
    }

    /// Repopulate the semantic index from every stored record.
    pub fn rebuild_semantic_index(&self) -> Result<usize> {
        let index = self
            .index
            .as_ref()
            .ok_or_else(|| MemoryError::IndexUnavailable("no semantic index configured".to_string()))?;
        let records = self.store.all_texts()?;
        index.rebuild(&records)
    }

    /// Release the calling thread's database handle.
    pub fn close_thread_connection(&self) {
        self.store.close_thread_connection();
    }
}


/// End-to-end behaviour through the public API.
#[cfg(test)]
mod scenarios {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    use chrono::{Duration, Utc};
    use crate::cache::MemoryCache;
    use crate::consolidation::{ConsolidationJob, ConsolidationPolicy};
    use crate::semantic_index::SemanticIndex;
    use crate::store::{MemoryStore, NewRecord, RecordFilter};
    use crate::{ConversationContext, MemoryConfig, MemoryError, MemorySystem};
    use keepsake_types::{EmotionSnapshot, Importance, MemoryKind, RecordId, RelationKind};
    use serde_json::json;

    fn note(text: &str, importance: i64, tags: &[&str]) -> NewRecord {
        NewRecord::event(MemoryKind::event("note").unwrap(), json!({ "text": text }))
            .unwrap()
            .importance(Importance::new(importance))
            .tags(tags.iter().map(|t| t.to_string()).collect())
    }

    struct Unreachable;

    impl SemanticIndex for Unreachable {
        fn index(&self, _id: RecordId, _text: &str) -> crate::Result<()> {
            Err(MemoryError::IndexUnavailable("vector service offline".into()))
        }

        fn search(&self, _query: &str, _k: usize) -> crate::Result<Vec<RecordId>> {
            Err(MemoryError::IndexUnavailable("vector service offline".into()))
        }
    }

    #[test]
    fn created_record_is_returned_once_and_unaccessed() {
        let store = MemoryStore::open_in_memory().unwrap();
        let id = store.create_record(note("first snow", 77, &["snow"])).unwrap();
        let found = store.query(&RecordFilter::new().any_tag("snow")).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, id);
        assert!((1..=100).contains(&found[0].importance.value()));
        assert_eq!(found[0].access_count, 0);
    }

    #[test]
    fn touching_twice_counts_twice() {
        let store = MemoryStore::open_in_memory().unwrap();
        let id = store.create_record(note("x", 50, &[])).unwrap();
        let t = Utc::now();
        store.touch_access(id, t).unwrap();
        store.touch_access(id, t).unwrap();
        let rec = store.get(id).unwrap();
        assert_eq!(rec.access_count, 2);
        assert_eq!(rec.last_accessed.map(|a| a.timestamp_micros()), Some(t.timestamp_micros()));
    }

    #[test]
    fn consolidation_reinforces_and_clamps() {
        let store = MemoryStore::open_in_memory().unwrap();
        let cache = MemoryCache::new(20, Importance::new(70));
        let now = Utc::now();
        let mid = store.create_record(note("mid", 50, &[])).unwrap();
        let high = store.create_record(note("high", 98, &[])).unwrap();
        for _ in 0..10 {
            store.touch_many(&[mid, high], now).unwrap();
        }

        ConsolidationJob::default().run(&store, &cache, None, now).unwrap();
        assert_eq!(store.get(mid).unwrap().importance.value(), 55);
        // Default guard only reinforces records below 90.
        assert_eq!(store.get(high).unwrap().importance.value(), 98);

        let no_guard = ConsolidationPolicy {
            reinforce_below: Importance::MAX,
            ..ConsolidationPolicy::default()
        };
        ConsolidationJob::new(no_guard).run(&store, &cache, None, now).unwrap();
        assert_eq!(store.get(high).unwrap().importance.value(), 100);
    }

    #[test]
    fn expired_record_hidden_before_and_removed_after_consolidation() {
        let memory = MemorySystem::open_in_memory(None).unwrap();
        let id = memory
            .record_event_expiring(
                MemoryKind::event("reminder").unwrap(),
                json!({ "what": "concert tickets on sale" }),
                Duration::seconds(-1),
            )
            .unwrap();
        assert!(memory.retrieve_related("concert tickets", 5).is_empty());
        assert!(memory.store().get(id).is_ok());

        let report = memory.run_consolidation().unwrap();
        assert_eq!(report.expired_removed, 1);
        assert!(matches!(memory.store().get(id), Err(MemoryError::NotFound(_))));
    }

    #[test]
    fn keyword_hits_rank_by_importance() {
        let memory = MemorySystem::open_in_memory(None).unwrap();
        let b = memory
            .record_event(MemoryKind::event("note").unwrap(), json!({ "text": "hiking boots", "importance": 40 }))
            .unwrap();
        let a = memory
            .record_event(MemoryKind::event("note").unwrap(), json!({ "text": "hiking trip", "importance": 80 }))
            .unwrap();
        let ids: Vec<_> = memory
            .retrieve_related("hiking", 2)
            .into_iter()
            .map(|m| m.record.id)
            .collect();
        assert_eq!(ids, vec![a, b]);
    }

    #[test]
    fn new_record_links_to_best_overlapping_records() {
        let store = MemoryStore::open_in_memory().unwrap();
        let p = store.create_record(note("p", 90, &["beach"])).unwrap();
        let q = store.create_record(note("q", 60, &["sunset"])).unwrap();
        let r = store.create_record(note("r", 30, &["beach", "sunset"])).unwrap();
        let s = store.create_record(note("s", 10, &["sunset"])).unwrap();
        let x = store.create_record(note("x", 50, &["beach", "sunset"])).unwrap();

        let tags = vec!["beach".to_string(), "sunset".to_string()];
        let linked = crate::relations::link_new_record(&store, x, &tags, Utc::now()).unwrap();
        assert!(linked <= 3);
        let edges = store.relations_from(x).unwrap();
        let targets: Vec<_> = edges.iter().map(|e| e.to_id).collect();
        assert_eq!(targets, vec![p, q, r]);
        assert!(!targets.contains(&s));
        assert!(edges.iter().all(|e| e.kind == RelationKind::Semantic && e.strength == 1.0));
    }

    #[test]
    fn more_significant_conversations_never_score_lower() {
        let memory = MemorySystem::open_in_memory(None).unwrap();
        let base = "We talked for a while about the weekend and the weather";
        let extras = ["", " love", " love promise", " love promise birthday", " love promise birthday forever"];
        let mut last = 0u8;
        for extra in extras {
            let id = memory
                .record_conversation(&format!("{base}{extra}"), "That sounds lovely.", ConversationContext::default())
                .unwrap();
            let importance = memory.store().get(id).unwrap().importance.value();
            assert!(importance >= last, "{importance} < {last}");
            last = importance;
        }
    }

    #[test]
    fn unavailable_index_falls_back_to_keywords() {
        let memory = MemorySystem::open_in_memory(Some(Arc::new(Unreachable))).unwrap();
        let id = memory
            .record_conversation("你好", "你好呀", ConversationContext::default())
            .unwrap();
        let hits = memory.retrieve_related("你好", 3);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.id, id);
    }

    #[test]
    fn concurrent_writers_get_distinct_ids() {
        let dir = tempfile::tempdir().unwrap();
        let memory = Arc::new(MemorySystem::open(&MemoryConfig::new(dir.path()), None).unwrap());

        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let memory = Arc::clone(&memory);
                thread::spawn(move || {
                    let mut ids = Vec::new();
                    for i in 0..25 {
                        let ctx = ConversationContext {
                            emotion: EmotionSnapshot::new().with("happiness", 60.0),
                            ..ConversationContext::default()
                        };
                        let user = format!("worker {worker} message {i} about gardening");
                        ids.push(memory.record_conversation(&user, "noted", ctx).unwrap());
                    }
                    memory.close_thread_connection();
                    ids
                })
            })
            .collect();

        let mut all = Vec::new();
        for h in handles {
            all.extend(h.join().unwrap());
        }
        let distinct: HashSet<_> = all.iter().copied().collect();
        assert_eq!(all.len(), 100);
        assert_eq!(distinct.len(), 100);
        assert_eq!(memory.stats().unwrap().store.total_records, 100);
    }

    #[test]
    fn cache_recent_view_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = MemoryConfig::new(dir.path());
        config.cache_size = 5;
        let memory = MemorySystem::open(&config, None).unwrap();
        let mut ids = Vec::new();
        for i in 0..12 {
            ids.push(
                memory
                    .record_event(MemoryKind::event("note").unwrap(), json!({ "n": format!("entry {i}") }))
                    .unwrap(),
            );
        }
        let cached: Vec<_> = memory.cached_recent(100).into_iter().map(|r| r.id).collect();
        let expected: Vec<_> = ids.iter().rev().take(5).copied().collect();
        assert_eq!(cached, expected);
    }

    #[test]
    fn reopened_system_sees_previous_records_in_cache() {
        let dir = tempfile::tempdir().unwrap();
        let config = MemoryConfig::new(dir.path());
        let id = {
            let memory = MemorySystem::open(&config, None).unwrap();
            memory
                .record_event(MemoryKind::event("milestone").unwrap(), json!({ "what": "first date", "importance": 95 }))
                .unwrap()
        };
        let memory = MemorySystem::open(&config, None).unwrap();
        let important: Vec<_> = memory.cached_important().into_iter().map(|r| r.id).collect();
        assert_eq!(important, vec![id]);
    }
}
