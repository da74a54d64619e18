//! Connection-per-thread access to a shared SQLite database.
//!
//! A [`ConnectionSource`] never hands one [`Connection`] to two threads.
//! Each thread that touches the source lazily opens its own handle, stored in
//! a thread-local map keyed by the source's instance id. All handles point at
//! the same database, so concurrent writers are serialised by SQLite's own
//! locking (WAL journal plus `busy_timeout`) instead of an in-process mutex.
//!
//! Dropping a source unregisters its id. Other threads still holding a handle
//! for it evict that handle the next time they use any source, so a
//! long-lived worker thread does not keep a dead database open.
//!
//! Schema initialisation runs on every freshly opened handle. It must be
//! idempotent (`CREATE ... IF NOT EXISTS`) so that redundant or racing
//! initialisation from several threads is harmless.

use std::cell::{Cell, RefCell};
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::debug;

use crate::error::Result;

/// Default time a handle waits on a locked database before failing.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Ids of sources that have not been dropped.
static LIVE_SOURCES: Mutex<BTreeSet<u64>> = Mutex::new(BTreeSet::new());

/// Bumped after every source drop.
static RETIRED: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static CONNECTIONS: RefCell<HashMap<u64, Connection>> = RefCell::new(HashMap::new());
    /// Value of [`RETIRED`] at this thread's last sweep.
    static SWEPT: Cell<u64> = const { Cell::new(0) };
}

fn register_source() -> u64 {
    let id = NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed);
    LIVE_SOURCES.lock().insert(id);
    id
}

/// Drop this thread's handles for sources that no longer exist.
fn sweep_retired(map: &mut HashMap<u64, Connection>) {
    let retired = RETIRED.load(Ordering::Acquire);
    if SWEPT.with(Cell::get) == retired {
        return;
    }
    let live = LIVE_SOURCES.lock();
    let before = map.len();
    map.retain(|id, _| live.contains(id));
    if map.len() != before {
        debug!(evicted = before - map.len(), thread = ?std::thread::current().id(), "evicted handles of dropped sources");
    }
    SWEPT.with(|swept| swept.set(retired));
}

/// Schema hook run on each new handle.
pub(crate) type SchemaInit = fn(&Connection) -> rusqlite::Result<()>;

enum Target {
    File(PathBuf),
    /// Named shared-cache in-memory database (`file:<name>?mode=memory&cache=shared`).
    SharedMemory(String),
}

pub(crate) struct ConnectionSource {
    id: u64,
    target: Target,
    busy_timeout: Duration,
    init: SchemaInit,
    // Keeps a shared in-memory database alive while per-thread handles come
    // and go. Never used for queries.
    _anchor: Option<Mutex<Connection>>,
}

impl ConnectionSource {
    /// Open a file-backed source, creating parent directories as needed. The
    /// calling thread's handle is opened eagerly so an unusable path fails
    /// here rather than on the first write.
    pub(crate) fn open_file(path: &Path, busy_timeout: Duration, init: SchemaInit) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let source = Self {
            id: register_source(),
            target: Target::File(path.to_path_buf()),
            busy_timeout,
            init,
            _anchor: None,
        };
        source.with(|_| Ok(()))?;
        Ok(source)
    }

    /// Open a private in-memory source that is still shared between the
    /// threads using it.
    pub(crate) fn open_in_memory(init: SchemaInit) -> Result<Self> {
        let id = register_source();
        let name = format!(
            "file:keepsake-{}-{id}?mode=memory&cache=shared",
            std::process::id()
        );
        let mut source = Self {
            id,
            target: Target::SharedMemory(name.clone()),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            init,
            _anchor: None,
        };
        let anchor = Connection::open(&name)?;
        anchor.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
        init(&anchor)?;
        source._anchor = Some(Mutex::new(anchor));
        Ok(source)
    }

    /// Run `f` against the calling thread's handle, opening it on first use.
    ///
    /// `f` must not re-enter this source.
    pub(crate) fn with<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        CONNECTIONS.with(|cell| {
            let mut map = cell.borrow_mut();
            sweep_retired(&mut map);
            let conn = match map.entry(self.id) {
                Entry::Occupied(slot) => slot.into_mut(),
                Entry::Vacant(slot) => slot.insert(self.connect()?),
            };
            Ok(f(conn)?)
        })
    }

    /// Drop the calling thread's handle, if any. The next call to
    /// [`with`](Self::with) on this thread reopens it.
    pub(crate) fn release_current_thread(&self) {
        let _ = CONNECTIONS.try_with(|cell| {
            if let Ok(mut map) = cell.try_borrow_mut() {
                map.remove(&self.id);
            }
        });
    }

    fn connect(&self) -> rusqlite::Result<Connection> {
        let conn = match &self.target {
            Target::File(path) => {
                let conn = Connection::open(path)?;
                conn.busy_timeout(self.busy_timeout)?;
                conn.execute_batch(
                    "PRAGMA journal_mode = WAL;
                     PRAGMA synchronous = NORMAL;",
                )?;
                conn
            }
            Target::SharedMemory(name) => {
                let conn = Connection::open(name)?;
                conn.busy_timeout(self.busy_timeout)?;
                conn
            }
        };
        (self.init)(&conn)?;
        debug!(source = self.id, thread = ?std::thread::current().id(), "opened per-thread connection");
        Ok(conn)
    }
}

impl Drop for ConnectionSource {
    fn drop(&mut self) {
        self.release_current_thread();
        LIVE_SOURCES.lock().remove(&self.id);
        RETIRED.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
fn open_handles_on_this_thread() -> Vec<u64> {
    CONNECTIONS.with(|cell| {
        let mut ids: Vec<u64> = cell.borrow().keys().copied().collect();
        ids.sort_unstable();
        ids
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn init(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch("CREATE TABLE IF NOT EXISTS t (v INTEGER NOT NULL);")
    }

    fn count(source: &ConnectionSource) -> i64 {
        source
            .with(|c| c.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0)))
            .unwrap()
    }

    #[test]
    fn in_memory_source_is_shared_across_threads() {
        let source = Arc::new(ConnectionSource::open_in_memory(init).unwrap());
        source.with(|c| c.execute("INSERT INTO t (v) VALUES (1)", [])).unwrap();

        let remote = Arc::clone(&source);
        std::thread::spawn(move || {
            remote.with(|c| c.execute("INSERT INTO t (v) VALUES (2)", [])).unwrap();
            remote.release_current_thread();
        })
        .join()
        .unwrap();

        assert_eq!(count(&source), 2);
    }

    #[test]
    fn separate_in_memory_sources_are_isolated() {
        let a = ConnectionSource::open_in_memory(init).unwrap();
        let b = ConnectionSource::open_in_memory(init).unwrap();
        a.with(|c| c.execute("INSERT INTO t (v) VALUES (1)", [])).unwrap();
        assert_eq!(count(&a), 1);
        assert_eq!(count(&b), 0);
    }

    #[test]
    fn released_handle_is_reopened_on_demand() {
        let dir = tempfile::tempdir().unwrap();
        let source = ConnectionSource::open_file(&dir.path().join("db.sqlite"), DEFAULT_BUSY_TIMEOUT, init).unwrap();
        source.with(|c| c.execute("INSERT INTO t (v) VALUES (1)", [])).unwrap();
        source.release_current_thread();
        assert_eq!(count(&source), 1);
    }

    #[test]
    fn open_file_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("deeper").join("db.sqlite");
        let _source = ConnectionSource::open_file(&path, DEFAULT_BUSY_TIMEOUT, init).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn long_lived_thread_evicts_handles_of_dropped_sources() {
        type Job = Box<dyn FnOnce() -> Vec<u64> + Send>;
        let (jobs, rx) = std::sync::mpsc::channel::<Job>();
        let (reply, results) = std::sync::mpsc::channel();
        let worker = std::thread::spawn(move || {
            for job in rx {
                reply.send(job()).unwrap();
            }
        });

        let dropped = Arc::new(ConnectionSource::open_in_memory(init).unwrap());
        let kept = Arc::new(ConnectionSource::open_in_memory(init).unwrap());
        let (dropped_id, kept_id) = (dropped.id, kept.id);

        let (a, b) = (Arc::clone(&dropped), Arc::clone(&kept));
        jobs.send(Box::new(move || {
            a.with(|_| Ok(())).unwrap();
            b.with(|_| Ok(())).unwrap();
            open_handles_on_this_thread()
        }))
        .unwrap();
        let open = results.recv().unwrap();
        assert!(open.contains(&dropped_id) && open.contains(&kept_id));

        drop(dropped);

        let b = Arc::clone(&kept);
        jobs.send(Box::new(move || {
            b.with(|_| Ok(())).unwrap();
            open_handles_on_this_thread()
        }))
        .unwrap();
        let open = results.recv().unwrap();
        assert!(!open.contains(&dropped_id));
        assert!(open.contains(&kept_id));

        drop(jobs);
        worker.join().unwrap();
    }
}
