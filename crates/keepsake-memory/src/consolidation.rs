//! Periodic maintenance: expiry, reinforcement, decay and cache reload.
//!
//! A [`ConsolidationJob`] is `Idle` or `Running`. Calling [`run`] while a run
//! is in progress returns `None` instead of starting a second pass. The
//! timer lives outside this crate; the job only knows how to do one pass.
//!
//! Each step is attempted even when an earlier one failed. Failures are
//! logged and listed in the returned [`ConsolidationReport`].
//!
//! [`run`]: ConsolidationJob::run

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Duration, Utc};
use keepsake_types::Importance;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cache::MemoryCache;
use crate::semantic_index::SemanticIndex;
use crate::store::MemoryStore;

/// Thresholds applied by one consolidation pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationPolicy {
    /// Records retrieved at least this often are reinforced.
    pub reinforce_min_access: u32,
    /// Only records strictly below this importance are reinforced.
    pub reinforce_below: Importance,
    pub reinforce_step: u8,
    /// Records not retrieved for longer than this many days decay.
    pub decay_after_days: u32,
    /// Only records strictly above this importance decay.
    pub decay_above: Importance,
    pub decay_step: u8,
}

impl Default for ConsolidationPolicy {
    fn default() -> Self {
        Self {
            reinforce_min_access: 10,
            reinforce_below: Importance::new(90),
            reinforce_step: 5,
            decay_after_days: 30,
            decay_above: Importance::new(20),
            decay_step: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsolidationStep {
    PurgeExpired,
    Reinforce,
    Decay,
    ReloadCache,
}

impl fmt::Display for ConsolidationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConsolidationStep::PurgeExpired => "purge_expired",
            ConsolidationStep::Reinforce => "reinforce",
            ConsolidationStep::Decay => "decay",
            ConsolidationStep::ReloadCache => "reload_cache",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Running,
}

/// Outcome of one consolidation pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsolidationReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub expired_removed: usize,
    pub reinforced: usize,
    pub decayed: usize,
    pub cache_reloaded: bool,
    pub failures: Vec<(ConsolidationStep, String)>,
}

impl ConsolidationReport {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            started_at: now,
            finished_at: now,
            expired_removed: 0,
            reinforced: 0,
            decayed: 0,
            cache_reloaded: false,
            failures: Vec::new(),
        }
    }

    /// True when every step succeeded.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn fail(&mut self, step: ConsolidationStep, error: impl fmt::Display) {
        warn!(%step, %error, "consolidation step failed");
        self.failures.push((step, error.to_string()));
    }
}

struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct ConsolidationJob {
    policy: ConsolidationPolicy,
    running: AtomicBool,
}

impl ConsolidationJob {
    pub fn new(policy: ConsolidationPolicy) -> Self {
        Self {
            policy,
            running: AtomicBool::new(false),
        }
    }

    pub fn policy(&self) -> &ConsolidationPolicy {
        &self.policy
    }

    pub fn state(&self) -> JobState {
        if self.running.load(Ordering::Acquire) {
            JobState::Running
        } else {
            JobState::Idle
        }
    }

    /// Perform one pass at `now`. Returns `None` if another pass is running.
    pub fn run(
        &self,
        store: &MemoryStore,
        cache: &MemoryCache,
        index: Option<&dyn SemanticIndex>,
        now: DateTime<Utc>,
    ) -> Option<ConsolidationReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("consolidation already running; skipping");
            return None;
        }
        let _guard = RunGuard(&self.running);
        let policy = &self.policy;
        let mut report = ConsolidationReport::new(now);

        match store.delete_expired(now) {
            Ok(ids) => {
                report.expired_removed = ids.len();
                if let (Some(index), false) = (index, ids.is_empty()) {
                    if let Err(e) = index.remove(&ids) {
                        warn!(error = %e, removed = ids.len(), "failed to drop expired records from semantic index");
                    }
                }
            }
            Err(e) => report.fail(ConsolidationStep::PurgeExpired, e),
        }

        match store.reinforce_frequent(policy.reinforce_min_access, policy.reinforce_below, policy.reinforce_step) {
            Ok(n) => report.reinforced = n,
            Err(e) => report.fail(ConsolidationStep::Reinforce, e),
        }

        let cutoff = now - Duration::days(i64::from(policy.decay_after_days));
        match store.decay_idle(cutoff, policy.decay_above, policy.decay_step) {
            Ok(n) => report.decayed = n,
            Err(e) => report.fail(ConsolidationStep::Decay, e),
        }

        match cache.reload(store, now) {
            Ok(()) => report.cache_reloaded = true,
            Err(e) => report.fail(ConsolidationStep::ReloadCache, e),
        }

        report.finished_at = Utc::now();
        info!(
            expired = report.expired_removed,
            reinforced = report.reinforced,
            decayed = report.decayed,
            failures = report.failures.len(),
            "memory consolidation finished"
        );
        Some(report)
    }
}

impl Default for ConsolidationJob {
    fn default() -> Self {
        Self::new(ConsolidationPolicy::default())
    }
}
