//! [`ConsolidationScheduler`] – the timer behind memory maintenance.
//!
//! Runs [`MemorySystem::run_consolidation`] every [`SchedulerConfig::interval`]
//! (six hours by default) on tokio's blocking pool. After a failed or skipped
//! pass the next attempt comes sooner, after
//! [`SchedulerConfig::retry_after`] (one hour by default).
//!
//! The scheduler stops when [`SchedulerHandle::shutdown`] is awaited. A pass
//! already in flight is allowed to finish first.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use keepsake_memory::MemorySystem;
//! use keepsake_runtime::scheduler::{ConsolidationScheduler, SchedulerConfig};
//!
//! # async fn demo() {
//! let memory = Arc::new(MemorySystem::open_in_memory(None).unwrap());
//! let handle = ConsolidationScheduler::new(memory, SchedulerConfig::default()).spawn();
//! // ... run the companion ...
//! handle.shutdown().await;
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use keepsake_memory::MemorySystem;
use keepsake_memory::consolidation::ConsolidationReport;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{error, info, warn};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Delay between successful passes.
    pub interval: Duration,
    /// Delay after a pass that failed, was skipped, or panicked.
    pub retry_after: Duration,
    /// Run a pass immediately instead of waiting one interval first.
    pub run_at_start: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            retry_after: DEFAULT_RETRY_AFTER,
            run_at_start: false,
        }
    }
}

/// Outcome of the most recent completed pass.
#[derive(Debug, Clone, PartialEq)]
pub struct LastRun {
    pub at: DateTime<Utc>,
    pub report: ConsolidationReport,
}

pub struct ConsolidationScheduler {
    memory: Arc<MemorySystem>,
    config: SchedulerConfig,
}

impl ConsolidationScheduler {
    pub fn new(memory: Arc<MemorySystem>, config: SchedulerConfig) -> Self {
        Self { memory, config }
    }

    /// Start the timer on the current tokio runtime.
    pub fn spawn(self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (last_tx, last_rx) = watch::channel(None);
        let task = tokio::spawn(run_loop(self.memory, self.config, shutdown_rx, last_tx));
        SchedulerHandle {
            shutdown: shutdown_tx,
            last_run: last_rx,
            task,
        }
    }
}

/// Control handle returned by [`ConsolidationScheduler::spawn`].
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    last_run: watch::Receiver<Option<LastRun>>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// The most recent completed pass, if any.
    pub fn last_run(&self) -> Option<LastRun> {
        self.last_run.borrow().clone()
    }

    /// A receiver notified after every completed pass.
    pub fn subscribe(&self) -> watch::Receiver<Option<LastRun>> {
        self.last_run.clone()
    }

    /// Stop scheduling and wait for the timer task to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "consolidation scheduler task failed");
        }
    }
}

async fn run_loop(
    memory: Arc<MemorySystem>,
    config: SchedulerConfig,
    mut shutdown: watch::Receiver<bool>,
    last_run: watch::Sender<Option<LastRun>>,
) {
    info!(
        interval_secs = config.interval.as_secs(),
        retry_secs = config.retry_after.as_secs(),
        "consolidation scheduler started"
    );
    let mut deadline = if config.run_at_start {
        Instant::now()
    } else {
        Instant::now() + config.interval
    };

    loop {
        tokio::select! {
            _ = sleep_until(deadline) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        let worker = Arc::clone(&memory);
        let outcome = tokio::task::spawn_blocking(move || worker.run_consolidation()).await;
        let delay = match outcome {
            Ok(Some(report)) => {
                let clean = report.is_clean();
                if !clean {
                    warn!(failures = report.failures.len(), "consolidation finished with failures");
                }
                last_run.send_replace(Some(LastRun {
                    at: Utc::now(),
                    report,
                }));
                if clean { config.interval } else { config.retry_after }
            }
            Ok(None) => {
                info!("consolidation pass skipped; another pass is running");
                config.retry_after
            }
            Err(e) => {
                error!(error = %e, "consolidation pass panicked");
                config.retry_after
            }
        };
        deadline = Instant::now() + delay;
    }
    info!("consolidation scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use keepsake_types::{Importance, MemoryKind};
    use serde_json::json;

    fn fast() -> SchedulerConfig {
        SchedulerConfig {
            interval: Duration::from_millis(20),
            retry_after: Duration::from_millis(20),
            run_at_start: true,
        }
    }

    #[tokio::test]
    async fn runs_passes_and_records_last_run() {
        let memory = Arc::new(MemorySystem::open_in_memory(None).unwrap());
        memory
            .record_event_expiring(
                MemoryKind::event("reminder").unwrap(),
                json!({ "what": "stale" }),
                chrono::Duration::seconds(-1),
            )
            .unwrap();

        let handle = ConsolidationScheduler::new(Arc::clone(&memory), fast()).spawn();
        let mut updates = handle.subscribe();
        tokio::time::timeout(Duration::from_secs(5), updates.wait_for(|r| r.is_some()))
            .await
            .unwrap()
            .unwrap();

        let last = handle.last_run().unwrap();
        assert!(last.report.is_clean());
        handle.shutdown().await;
        assert_eq!(memory.stats().unwrap().store.total_records, 0);
    }

    #[tokio::test]
    async fn keeps_running_on_schedule() {
        let memory = Arc::new(MemorySystem::open_in_memory(None).unwrap());
        let id = memory
            .record_event(MemoryKind::event("note").unwrap(), json!({ "text": "x", "importance": 50 }))
            .unwrap();
        for _ in 0..10 {
            memory.store().touch_access(id, Utc::now()).unwrap();
        }

        let handle = ConsolidationScheduler::new(Arc::clone(&memory), fast()).spawn();
        let mut updates = handle.subscribe();
        for _ in 0..3 {
            tokio::time::timeout(Duration::from_secs(5), updates.changed())
                .await
                .unwrap()
                .unwrap();
        }
        handle.shutdown().await;
        // Reinforced once per pass, three passes at least.
        assert!(memory.store().get(id).unwrap().importance >= Importance::new(65));
    }

    #[tokio::test]
    async fn shutdown_before_first_pass_is_prompt() {
        let memory = Arc::new(MemorySystem::open_in_memory(None).unwrap());
        let handle = ConsolidationScheduler::new(memory, SchedulerConfig::default()).spawn();
        tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .unwrap();
    }

    #[test]
    fn default_schedule_matches_maintenance_cadence() {
        let config = SchedulerConfig::default();
        assert_eq!(config.interval, Duration::from_secs(21_600));
        assert_eq!(config.retry_after, Duration::from_secs(3_600));
        assert!(!config.run_at_start);
    }
}
