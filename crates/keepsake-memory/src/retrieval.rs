//! Hybrid retrieval: semantic hits first, keyword-tag hits to fill the rest.
//!
//! Every record handed back has been counted as accessed exactly once, in a
//! single store transaction, and the returned copies reflect that update.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use keepsake_types::{MemoryRecord, RecordId};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::Result;
use crate::keywords;
use crate::semantic_index::{MAX_SEMANTIC_HITS, SemanticIndex};
use crate::store::{MemoryStore, RecordFilter};

/// Queries this short (in characters) skip the semantic path.
const MIN_SEMANTIC_QUERY_CHARS: usize = 2;

/// Which path produced a retrieved record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalSource {
    Semantic,
    Keyword,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedMemory {
    pub record: MemoryRecord,
    pub source: RetrievalSource,
}

pub struct RetrievalEngine {
    store: Arc<MemoryStore>,
    index: Option<Arc<dyn SemanticIndex>>,
}

impl RetrievalEngine {
    pub fn new(store: Arc<MemoryStore>, index: Option<Arc<dyn SemanticIndex>>) -> Self {
        Self { store, index }
    }

    /// Up to `limit` records related to `query`, deduplicated by id.
    ///
    /// Semantic failures are logged and ignored. Store failures on the
    /// keyword path or the access update are returned.
    pub fn retrieve(&self, query: &str, limit: usize, now: DateTime<Utc>) -> Result<Vec<RetrievedMemory>> {
        let query = query.trim();
        if query.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let mut found: Vec<RetrievedMemory> = Vec::with_capacity(limit);
        let mut seen: HashSet<RecordId> = HashSet::new();

        for record in self.semantic_hits(query, limit, now) {
            if seen.insert(record.id) {
                found.push(RetrievedMemory {
                    record,
                    source: RetrievalSource::Semantic,
                });
            }
        }
        found.truncate(limit);

        if found.len() < limit {
            let keywords = keywords::query_keywords(query);
            if !keywords.is_empty() {
                let filter = RecordFilter::new()
                    .any_tags(keywords)
                    .exclude(seen.iter().copied())
                    .live_at(now)
                    .limit(limit - found.len());
                for record in self.store.query(&filter)? {
                    if seen.insert(record.id) {
                        found.push(RetrievedMemory {
                            record,
                            source: RetrievalSource::Keyword,
                        });
                    }
                }
            }
        }

        if found.is_empty() {
            return Ok(found);
        }

        let ids: Vec<RecordId> = found.iter().map(|m| m.record.id).collect();
        let touched: HashSet<RecordId> = self.store.touch_many(&ids, now)?.into_iter().collect();
        let stamp = now.trunc_subsecs(6);
        found.retain_mut(|m| {
            if !touched.contains(&m.record.id) {
                return false;
            }
            m.record.access_count += 1;
            m.record.last_accessed = Some(stamp);
            true
        });
        debug!(query, returned = found.len(), "retrieved memories");
        Ok(found)
    }

    fn semantic_hits(&self, query: &str, limit: usize, now: DateTime<Utc>) -> Vec<MemoryRecord> {
        let Some(index) = &self.index else {
            return Vec::new();
        };
        if query.chars().count() <= MIN_SEMANTIC_QUERY_CHARS {
            return Vec::new();
        }
        let ids = match index.search(query, limit.min(MAX_SEMANTIC_HITS)) {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "semantic search failed; using keyword search only");
                return Vec::new();
            }
        };
        match self.store.get_many(&ids, now) {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "failed to load semantic hits");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MemoryError;
    use crate::semantic_index::{HashingEmbedder, VectorIndex};
    use crate::store::NewRecord;
    use chrono::Duration;
    use keepsake_types::{Importance, MemoryKind};
    use serde_json::json;

    struct Broken;

    impl SemanticIndex for Broken {
        fn index(&self, _id: RecordId, _text: &str) -> Result<()> {
            Err(MemoryError::IndexUnavailable("down".into()))
        }

        fn search(&self, _query: &str, _k: usize) -> Result<Vec<RecordId>> {
            Err(MemoryError::IndexUnavailable("down".into()))
        }
    }

    fn add(store: &MemoryStore, text: &str, importance: i64, tags: &[&str]) -> RecordId {
        let rec = NewRecord::event(MemoryKind::event("note").unwrap(), json!({ "text": text }))
            .unwrap()
            .importance(Importance::new(importance))
            .tags(tags.iter().map(|t| t.to_string()).collect());
        store.create_record(rec).unwrap()
    }

    #[test]
    fn keyword_hits_ordered_by_importance() {
        let store = Arc::new(MemoryStore::open_in_memory().unwrap());
        let b = add(&store, "b", 40, &["garden"]);
        let a = add(&store, "a", 80, &["garden"]);
        let engine = RetrievalEngine::new(Arc::clone(&store), None);

        let got = engine.retrieve("the garden", 2, Utc::now()).unwrap();
        let ids: Vec<_> = got.iter().map(|m| m.record.id).collect();
        assert_eq!(ids, vec![a, b]);
        assert!(got.iter().all(|m| m.source == RetrievalSource::Keyword));
    }

    #[test]
    fn returned_records_reflect_the_access_update() {
        let store = Arc::new(MemoryStore::open_in_memory().unwrap());
        let id = add(&store, "x", 50, &["piano"]);
        let engine = RetrievalEngine::new(Arc::clone(&store), None);
        let now = Utc::now();

        let got = engine.retrieve("piano", 5, now).unwrap();
        assert_eq!(got[0].record.access_count, 1);
        let stored = store.get(id).unwrap();
        assert_eq!(stored.access_count, 1);
        assert_eq!(stored.last_accessed, got[0].record.last_accessed);
    }

    #[test]
    fn empty_query_touches_nothing() {
        let store = Arc::new(MemoryStore::open_in_memory().unwrap());
        let id = add(&store, "x", 50, &["piano"]);
        let engine = RetrievalEngine::new(Arc::clone(&store), None);
        assert!(engine.retrieve("   ", 5, Utc::now()).unwrap().is_empty());
        assert!(engine.retrieve("piano", 0, Utc::now()).unwrap().is_empty());
        assert_eq!(store.get(id).unwrap().access_count, 0);
    }

    #[test]
    fn semantic_hits_come_first_and_are_not_duplicated() {
        let store = Arc::new(MemoryStore::open_in_memory().unwrap());
        let index = Arc::new(VectorIndex::open_in_memory(Box::new(HashingEmbedder::default())).unwrap());
        let sem = add(&store, "sailing lessons by the harbour", 30, &["sailing", "harbour"]);
        index.index(sem, "sailing lessons by the harbour").unwrap();
        let kw = add(&store, "unrelated text", 90, &["harbour"]);

        let engine = RetrievalEngine::new(Arc::clone(&store), Some(index));
        let got = engine.retrieve("harbour sailing", 5, Utc::now()).unwrap();
        let ids: Vec<_> = got.iter().map(|m| (m.record.id, m.source)).collect();
        assert_eq!(
            ids,
            vec![(sem, RetrievalSource::Semantic), (kw, RetrievalSource::Keyword)]
        );
        assert_eq!(store.get(sem).unwrap().access_count, 1);
    }

    #[test]
    fn broken_index_falls_back_to_keywords() {
        let store = Arc::new(MemoryStore::open_in_memory().unwrap());
        let id = add(&store, "greeting", 60, &["你好"]);
        let engine = RetrievalEngine::new(Arc::clone(&store), Some(Arc::new(Broken)));

        let got = engine.retrieve("你好", 3, Utc::now()).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].record.id, id);
        let got = engine.retrieve("你好世界朋友", 3, Utc::now()).unwrap();
        assert!(got.is_empty(), "tag '你好' is not a substring match for '你好世界朋友'");
    }

    #[test]
    fn expired_records_are_not_retrieved() {
        let store = Arc::new(MemoryStore::open_in_memory().unwrap());
        let now = Utc::now();
        let rec = NewRecord::event(MemoryKind::event("note").unwrap(), json!({ "text": "old" }))
            .unwrap()
            .tags(vec!["ticket".into()])
            .expires_at(Some(now - Duration::seconds(1)));
        store.create_record(rec).unwrap();
        let engine = RetrievalEngine::new(Arc::clone(&store), None);
        assert!(engine.retrieve("ticket", 5, now).unwrap().is_empty());
    }
}
