//! Optional nearest-neighbour text index over record content.
//!
//! The record store works without any index; every caller holds an
//! `Option<Arc<dyn SemanticIndex>>` and falls back to keyword search when it
//! is `None` or when a call fails.
//!
//! The shipped [`VectorIndex`] embeds text with a pluggable [`Embedder`] and
//! keeps one vector per record in its own SQLite file, separate from the
//! record table. It is derived data: [`SemanticIndex::rebuild`] repopulates
//! it from the store.
//!
//! # Storage layout
//!
//! | column      | type    | description                              |
//! |-------------|---------|------------------------------------------|
//! | record_id   | INTEGER | id of the record in `memories`           |
//! | model       | TEXT    | embedder name                            |
//! | dim         | INTEGER | vector length                            |
//! | embedding   | BLOB    | little-endian `f32` values               |
//! | indexed_at  | TEXT    | RFC-3339 UTC timestamp                   |

use std::path::Path;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use chrono::Utc;
use keepsake_types::RecordId;
use rusqlite::{Connection, params};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionSource, DEFAULT_BUSY_TIMEOUT};
use crate::error::{MemoryError, Result};
use crate::keywords;
use crate::store::ts;

/// Default time allowed for one index call before it counts as unavailable.
pub const DEFAULT_INDEX_TIMEOUT: Duration = Duration::from_millis(500);

/// Largest number of hits a retrieval asks the index for.
pub const MAX_SEMANTIC_HITS: usize = 10;

// ─────────────────────────────────────────────────────────────────────────────
// Traits
// ─────────────────────────────────────────────────────────────────────────────

/// A text index mapping record ids to searchable content.
pub trait SemanticIndex: Send + Sync {
    /// Add or replace the entry for `id`.
    fn index(&self, id: RecordId, text: &str) -> Result<()>;

    /// Up to `k` ids ranked best first.
    fn search(&self, query: &str, k: usize) -> Result<Vec<RecordId>>;

    /// Forget the given ids.
    fn remove(&self, _ids: &[RecordId]) -> Result<()> {
        Ok(())
    }

    /// Replace the whole index with `records`, returning how many were
    /// indexed. The default indexes one record at a time and skips failures.
    fn rebuild(&self, records: &[(RecordId, String)]) -> Result<usize> {
        let mut indexed = 0;
        for (id, text) in records {
            match self.index(*id, text) {
                Ok(()) => indexed += 1,
                Err(e) => warn!(id, error = %e, "failed to index record during rebuild"),
            }
        }
        Ok(indexed)
    }
}

/// Errors produced by an [`Embedder`].
#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("embedding backend unreachable: {0}")]
    Unreachable(String),
    #[error("embedding backend returned an invalid response: {0}")]
    InvalidResponse(String),
}

impl From<EmbedError> for MemoryError {
    fn from(err: EmbedError) -> Self {
        MemoryError::IndexUnavailable(err.to_string())
    }
}

/// Turns text into a dense vector.
pub trait Embedder: Send + Sync {
    /// Stable name recorded next to each stored vector.
    fn name(&self) -> &str;

    fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, EmbedError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// HashingEmbedder
// ─────────────────────────────────────────────────────────────────────────────

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(FNV_OFFSET, |h, b| (h ^ u64::from(*b)).wrapping_mul(FNV_PRIME))
}

/// Local, deterministic embedder using feature hashing.
///
/// Features are the keyword tokens of the text (weight 1.0) and the
/// character bigrams inside each alphanumeric run (weight 0.5), so
/// unsegmented CJK text still shares features with its sub-phrases. The
/// vector is L2-normalised; text without features maps to the zero vector.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub const DEFAULT_DIMENSION: usize = 256;

    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn add(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let h = fnv1a(feature.as_bytes());
        let slot = (h % self.dimension as u64) as usize;
        let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
        vector[slot] += sign * weight;
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DIMENSION)
    }
}

impl Embedder for HashingEmbedder {
    fn name(&self) -> &str {
        "hashing"
    }

    fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, EmbedError> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in keywords::tokens(text) {
            self.add(&mut vector, &token, 1.0);
        }
        let lowered = text.to_lowercase();
        for run in lowered.split(|c: char| !c.is_alphanumeric()) {
            let chars: Vec<char> = run.chars().collect();
            for pair in chars.windows(2) {
                let bigram: String = pair.iter().collect();
                self.add(&mut vector, &format!("#{bigram}"), 0.5);
            }
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        Ok(vector)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Vector helpers
// ─────────────────────────────────────────────────────────────────────────────

fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Cosine similarity of two equal-length vectors; `0.0` if either is zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

fn is_zero(v: &[f32]) -> bool {
    v.iter().all(|x| *x == 0.0)
}

// ─────────────────────────────────────────────────────────────────────────────
// VectorIndex
// ─────────────────────────────────────────────────────────────────────────────

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS memory_embeddings (
            record_id  INTEGER PRIMARY KEY,
            model      TEXT    NOT NULL,
            dim        INTEGER NOT NULL,
            embedding  BLOB    NOT NULL,
            indexed_at TEXT    NOT NULL
        );",
    )
}

/// Brute-force cosine index persisted in SQLite.
pub struct VectorIndex {
    source: ConnectionSource,
    embedder: Box<dyn Embedder>,
}

impl VectorIndex {
    /// Open (or create) the index file at `path`.
    pub fn open(path: impl AsRef<Path>, embedder: Box<dyn Embedder>) -> Result<Self> {
        let source = ConnectionSource::open_file(path.as_ref(), DEFAULT_BUSY_TIMEOUT, init_schema)?;
        info!(path = %path.as_ref().display(), embedder = embedder.name(), "opened vector index");
        Ok(Self { source, embedder })
    }

    pub fn open_in_memory(embedder: Box<dyn Embedder>) -> Result<Self> {
        Ok(Self {
            source: ConnectionSource::open_in_memory(init_schema)?,
            embedder,
        })
    }

    /// Number of stored vectors.
    pub fn len(&self) -> Result<usize> {
        let n: i64 = self
            .source
            .with(|c| c.query_row("SELECT COUNT(*) FROM memory_embeddings", [], |r| r.get(0)))?;
        Ok(n as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn write(&self, conn: &Connection, id: RecordId, embedding: &[f32]) -> rusqlite::Result<usize> {
        conn.execute(
            "INSERT OR REPLACE INTO memory_embeddings (record_id, model, dim, embedding, indexed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id,
                self.embedder.name(),
                embedding.len() as i64,
                embedding_to_bytes(embedding),
                ts(Utc::now()),
            ],
        )
    }
}

impl SemanticIndex for VectorIndex {
    fn index(&self, id: RecordId, text: &str) -> Result<()> {
        let embedding = self.embedder.embed(text)?;
        if is_zero(&embedding) {
            debug!(id, "no features to index");
            return Ok(());
        }
        self.source.with(|conn| self.write(conn, id, &embedding))?;
        Ok(())
    }

    fn search(&self, query: &str, k: usize) -> Result<Vec<RecordId>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let query_embedding = self.embedder.embed(query)?;
        if is_zero(&query_embedding) {
            return Ok(Vec::new());
        }
        let rows: Vec<(RecordId, Vec<u8>)> = self.source.with(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT record_id, embedding FROM memory_embeddings WHERE dim = ?1 AND model = ?2",
            )?;
            let rows = stmt.query_map(
                params![query_embedding.len() as i64, self.embedder.name()],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )?;
            rows.collect()
        })?;

        let mut scored: Vec<(RecordId, f32)> = rows
            .into_iter()
            .map(|(id, blob)| (id, cosine_similarity(&bytes_to_embedding(&blob), &query_embedding)))
            .filter(|(_, score)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(b.0.cmp(&a.0)));
        scored.truncate(k);
        Ok(scored.into_iter().map(|(id, _)| id).collect())
    }

    fn remove(&self, ids: &[RecordId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.source.with(|conn| {
            let tx = conn.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare_cached("DELETE FROM memory_embeddings WHERE record_id = ?1")?;
                for id in ids {
                    stmt.execute(params![id])?;
                }
            }
            tx.commit()
        })?;
        Ok(())
    }

    fn rebuild(&self, records: &[(RecordId, String)]) -> Result<usize> {
        let mut embedded = Vec::with_capacity(records.len());
        for (id, text) in records {
            match self.embedder.embed(text) {
                Ok(v) if !is_zero(&v) => embedded.push((*id, v)),
                Ok(_) => {}
                Err(e) => warn!(id, error = %e, "failed to embed record during rebuild"),
            }
        }
        self.source.with(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute("DELETE FROM memory_embeddings", [])?;
            for (id, embedding) in &embedded {
                self.write(&tx, *id, embedding)?;
            }
            tx.commit()
        })?;
        info!(indexed = embedded.len(), total = records.len(), "rebuilt vector index");
        Ok(embedded.len())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// GuardedIndex
// ─────────────────────────────────────────────────────────────────────────────

type Job = Box<dyn FnOnce(&dyn SemanticIndex) + Send>;

/// Runs every call of an inner index on one long-lived worker thread and
/// gives up after a timeout, reporting [`MemoryError::IndexUnavailable`].
///
/// A call that times out keeps running on the worker and its result is
/// discarded. Calls queued behind it whose deadline has passed by the time
/// the worker reaches them are skipped. Because the worker is a single
/// thread, the inner index keeps one database handle for its lifetime.
///
/// `rebuild` is forwarded without a timeout.
pub struct GuardedIndex {
    inner: Arc<dyn SemanticIndex>,
    timeout: Duration,
    jobs: Option<mpsc::Sender<Job>>,
}

impl GuardedIndex {
    pub fn new(inner: Arc<dyn SemanticIndex>, timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let worker_inner = Arc::clone(&inner);
        let spawned = std::thread::Builder::new()
            .name("keepsake-index".to_string())
            .spawn(move || {
                for job in rx {
                    job(worker_inner.as_ref());
                }
                debug!("semantic index worker stopped");
            });
        let jobs = match spawned {
            Ok(_) => Some(tx),
            Err(e) => {
                warn!(error = %e, "cannot spawn semantic index worker; index calls will fail");
                None
            }
        };
        Self { inner, timeout, jobs }
    }

    fn call<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn SemanticIndex) -> Result<T> + Send + 'static,
    {
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| MemoryError::IndexUnavailable("index worker is not running".to_string()))?;
        let deadline = Instant::now() + self.timeout;
        let (tx, rx) = mpsc::sync_channel(1);
        let job: Job = Box::new(move |inner: &dyn SemanticIndex| {
            if Instant::now() >= deadline {
                debug!(op, "skipping semantic index call past its deadline");
                return;
            }
            let _ = tx.send(f(inner));
        });
        jobs.send(job)
            .map_err(|_| MemoryError::IndexUnavailable("index worker has stopped".to_string()))?;
        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(MemoryError::IndexUnavailable(format!(
                "{op} timed out after {} ms",
                self.timeout.as_millis()
            ))),
            Err(RecvTimeoutError::Disconnected) => Err(MemoryError::IndexUnavailable(format!(
                "{op} was dropped without a result"
            ))),
        }
    }
}

impl SemanticIndex for GuardedIndex {
    fn index(&self, id: RecordId, text: &str) -> Result<()> {
        let text = text.to_string();
        self.call("index", move |inner| inner.index(id, &text))
    }

    fn search(&self, query: &str, k: usize) -> Result<Vec<RecordId>> {
        let query = query.to_string();
        self.call("search", move |inner| inner.search(&query, k))
    }

    fn remove(&self, ids: &[RecordId]) -> Result<()> {
        let ids = ids.to_vec();
        self.call("remove", move |inner| inner.remove(&ids))
    }

    fn rebuild(&self, records: &[(RecordId, String)]) -> Result<usize> {
        self.inner.rebuild(records)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> VectorIndex {
        VectorIndex::open_in_memory(Box::new(HashingEmbedder::default())).unwrap()
    }

    struct Stalled;

    impl SemanticIndex for Stalled {
        fn index(&self, _id: RecordId, _text: &str) -> Result<()> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(())
        }

        fn search(&self, _query: &str, _k: usize) -> Result<Vec<RecordId>> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(vec![1])
        }
    }

    /// Records which thread served each call.
    #[derive(Default)]
    struct ThreadRecorder {
        threads: std::sync::Mutex<Vec<std::thread::ThreadId>>,
    }

    impl SemanticIndex for ThreadRecorder {
        fn index(&self, _id: RecordId, _text: &str) -> Result<()> {
            self.threads.lock().unwrap().push(std::thread::current().id());
            Ok(())
        }

        fn search(&self, _query: &str, _k: usize) -> Result<Vec<RecordId>> {
            self.threads.lock().unwrap().push(std::thread::current().id());
            Ok(Vec::new())
        }
    }

    struct Offline;

    impl Embedder for Offline {
        fn name(&self) -> &str {
            "offline"
        }

        fn embed(&self, _text: &str) -> std::result::Result<Vec<f32>, EmbedError> {
            Err(EmbedError::Unreachable("connection refused".into()))
        }
    }

    #[test]
    fn cosine_identical_vectors_is_one() {
        let v = vec![0.3, 0.4, 0.5];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_zero_vector_returns_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn embedding_bytes_roundtrip() {
        let v = vec![1.5f32, -0.25, 3.0];
        assert_eq!(bytes_to_embedding(&embedding_to_bytes(&v)), v);
    }

    #[test]
    fn hashing_embedder_is_deterministic_and_normalised() {
        let e = HashingEmbedder::default();
        let a = e.embed("walking the dog in the park").unwrap();
        let b = e.embed("walking the dog in the park").unwrap();
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!(is_zero(&e.embed("?!").unwrap()));
    }

    #[test]
    fn search_ranks_closest_text_first() {
        let idx = index();
        idx.index(1, "we baked a chocolate cake for the party").unwrap();
        idx.index(2, "the train to the mountains was late").unwrap();
        idx.index(3, "chocolate cake recipe with extra cocoa").unwrap();

        let hits = idx.search("chocolate cake", 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.contains(&1) && hits.contains(&3));
        assert!(idx.search("chocolate cake", 0).unwrap().is_empty());
    }

    #[test]
    fn cjk_subphrases_share_features() {
        let idx = index();
        idx.index(7, "你好，今天天气不错").unwrap();
        idx.index(8, "明天去上班").unwrap();
        assert_eq!(idx.search("你好吗", 1).unwrap(), vec![7]);
    }

    #[test]
    fn index_replaces_and_remove_forgets() {
        let idx = index();
        idx.index(1, "apples and pears").unwrap();
        idx.index(1, "apples and pears again").unwrap();
        assert_eq!(idx.len().unwrap(), 1);
        idx.remove(&[1]).unwrap();
        assert!(idx.is_empty().unwrap());
        assert!(idx.search("apples", 3).unwrap().is_empty());
    }

    #[test]
    fn rebuild_replaces_contents() {
        let idx = index();
        idx.index(99, "stale entry").unwrap();
        let n = idx
            .rebuild(&[(1, "sunny beach holiday".into()), (2, "...".into())])
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(idx.search("stale entry", 5).unwrap(), Vec::<RecordId>::new());
        assert_eq!(idx.search("beach", 5).unwrap(), vec![1]);
    }

    #[test]
    fn embedder_failure_is_index_unavailable() {
        let idx = VectorIndex::open_in_memory(Box::new(Offline)).unwrap();
        assert!(matches!(idx.index(1, "text"), Err(MemoryError::IndexUnavailable(_))));
        assert!(matches!(idx.search("text", 3), Err(MemoryError::IndexUnavailable(_))));
    }

    #[test]
    fn guarded_index_times_out_slow_calls() {
        let guarded = GuardedIndex::new(Arc::new(Stalled), Duration::from_millis(20));
        assert!(matches!(guarded.search("anything", 3), Err(MemoryError::IndexUnavailable(_))));
        assert!(matches!(guarded.index(1, "x"), Err(MemoryError::IndexUnavailable(_))));
    }

    #[test]
    fn guarded_index_passes_through_fast_calls() {
        let inner: Arc<dyn SemanticIndex> = Arc::new(index());
        let guarded = GuardedIndex::new(inner, Duration::from_secs(5));
        guarded.index(4, "guitar lessons on tuesday").unwrap();
        assert_eq!(guarded.search("guitar", 3).unwrap(), vec![4]);
        guarded.remove(&[4]).unwrap();
        assert!(guarded.search("guitar", 3).unwrap().is_empty());
    }

    #[test]
    fn guarded_index_reuses_one_worker_thread() {
        let recorder = Arc::new(ThreadRecorder::default());
        let guarded = GuardedIndex::new(recorder.clone(), Duration::from_secs(5));
        for id in 0..5 {
            guarded.index(id, "x").unwrap();
            guarded.search("x", 1).unwrap();
        }
        let threads = recorder.threads.lock().unwrap();
        assert_eq!(threads.len(), 10);
        assert!(threads.iter().all(|t| *t == threads[0]));
        assert_ne!(threads[0], std::thread::current().id());
    }

    #[test]
    fn guarded_index_skips_calls_queued_past_their_deadline() {
        struct Counting {
            calls: std::sync::atomic::AtomicUsize,
        }
        impl SemanticIndex for Counting {
            fn index(&self, _id: RecordId, _text: &str) -> Result<()> {
                self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(200));
                Ok(())
            }

            fn search(&self, _query: &str, _k: usize) -> Result<Vec<RecordId>> {
                self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(Vec::new())
            }
        }

        let inner = Arc::new(Counting {
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let guarded = GuardedIndex::new(inner.clone(), Duration::from_millis(20));
        assert!(guarded.index(1, "slow").is_err());
        assert!(guarded.search("queued", 1).is_err());
        std::thread::sleep(Duration::from_millis(400));
        assert_eq!(inner.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
