//! Periodic, non-reentrant driver over WAL compaction.
//!
//! The driver sleeps for the configured interval and then attempts a run, so
//! the first compaction happens one full interval after startup, never at
//! boot. Runs are throttled by a minimum spacing unless forced, and a single
//! failed iteration is logged without tearing down the loop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::CompactionConfig;
use crate::error::Result;
use crate::heartbeat::unix_now;
use crate::storage::KeyValueStorage;

/// Runs kept in the status history.
const HISTORY_LIMIT: usize = 10;

/// Smallest accepted scheduling interval in seconds.
const MIN_INTERVAL_SECS: u64 = 60;

/// Outcome of one completed compaction run.
#[derive(Debug, Clone, Serialize)]
pub struct CompactionRun {
    /// Unix seconds when the run started.
    pub timestamp: u64,
    /// Wall time the run took.
    pub duration_seconds: f64,
    /// Sealed segments merged.
    pub segments_compacted: usize,
    /// Entries dropped as redundant.
    pub entries_removed: u64,
}

/// Status snapshot for the compaction endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct CompactionStatus {
    /// Whether the periodic driver is allowed to run.
    pub enabled: bool,
    /// Sleep between scheduled attempts, seconds.
    pub compaction_interval_seconds: u64,
    /// Minimum spacing between non-forced runs, seconds.
    pub min_compaction_interval_seconds: u64,
    /// Unix seconds of the last successful run, if any.
    pub last_compaction: Option<u64>,
    /// Whether a run is in flight right now.
    pub compaction_running: bool,
    /// Most recent runs, oldest first.
    pub compaction_history: Vec<CompactionRun>,
}

struct LastRun {
    at: Instant,
    unix: u64,
}

/// Background compaction scheduler.
pub struct CompactionService {
    storage: Arc<KeyValueStorage>,
    enabled: AtomicBool,
    interval_secs: AtomicU64,
    min_interval_secs: u64,
    running: AtomicBool,
    last_run: Mutex<Option<LastRun>>,
    history: Mutex<VecDeque<CompactionRun>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl CompactionService {
    /// Create a scheduler over `storage` with the given configuration.
    #[must_use]
    pub fn new(storage: Arc<KeyValueStorage>, config: CompactionConfig) -> Self {
        Self {
            storage,
            enabled: AtomicBool::new(config.enabled),
            interval_secs: AtomicU64::new(config.interval_secs),
            min_interval_secs: config.min_interval_secs,
            running: AtomicBool::new(false),
            last_run: Mutex::new(None),
            history: Mutex::new(VecDeque::new()),
            driver: Mutex::new(None),
        }
    }

    /// Launch the periodic driver. No-op when disabled or already started.
    pub fn start(self: &Arc<Self>) {
        if !self.enabled.load(Ordering::SeqCst) {
            info!("compaction service is disabled");
            return;
        }
        let mut driver = self.driver.lock();
        if driver.is_some() {
            warn!("compaction service already running");
            return;
        }
        let service = Arc::clone(self);
        *driver = Some(tokio::spawn(async move {
            loop {
                let interval = service.interval_secs.load(Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(interval)).await;
                let worker = Arc::clone(&service);
                let outcome =
                    tokio::task::spawn_blocking(move || worker.run(false)).await;
                match outcome {
                    Ok(Err(e)) => error!("error in compaction loop: {e}"),
                    Err(e) => error!("compaction task failed: {e}"),
                    Ok(Ok(_)) => {}
                }
            }
        }));
        info!(
            "started log compaction service (interval: {}s)",
            self.interval_secs.load(Ordering::SeqCst)
        );
    }

    /// Cancel the periodic driver. An in-flight run finishes on the blocking
    /// pool; only the sleeping loop is interrupted.
    pub fn stop(&self) {
        if let Some(handle) = self.driver.lock().take() {
            handle.abort();
            info!("stopped log compaction service");
        }
    }

    /// Run compaction now.
    ///
    /// Returns `(0, 0)` without touching the WAL when a run is already in
    /// flight, or when the minimum spacing since the last run has not passed
    /// and `force` is off. Errors from the WAL propagate; the running flag is
    /// always restored.
    pub fn run(&self, force: bool) -> Result<(usize, u64)> {
        if !force && self.too_soon() {
            return Ok((0, 0));
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("compaction already in progress, skipping");
            return Ok((0, 0));
        }

        let result = self.execute();
        self.running.store(false, Ordering::SeqCst);
        result
    }

    /// Enable or disable the periodic driver. Takes effect at its next tick;
    /// direct `run` calls are unaffected.
    pub fn set_enabled(&self, enabled: bool) -> bool {
        self.enabled.store(enabled, Ordering::SeqCst);
        enabled
    }

    /// Change the scheduling interval, clamped to at least one minute.
    /// Returns the applied value.
    pub fn set_interval(&self, seconds: u64) -> u64 {
        let applied = seconds.max(MIN_INTERVAL_SECS);
        self.interval_secs.store(applied, Ordering::SeqCst);
        applied
    }

    /// Current status and recent history.
    #[must_use]
    pub fn status(&self) -> CompactionStatus {
        CompactionStatus {
            enabled: self.enabled.load(Ordering::SeqCst),
            compaction_interval_seconds: self.interval_secs.load(Ordering::SeqCst),
            min_compaction_interval_seconds: self.min_interval_secs,
            last_compaction: self.last_run.lock().as_ref().map(|run| run.unix),
            compaction_running: self.running.load(Ordering::SeqCst),
            compaction_history: self.history.lock().iter().cloned().collect(),
        }
    }

    fn too_soon(&self) -> bool {
        let last_run = self.last_run.lock();
        let Some(last) = last_run.as_ref() else {
            return false;
        };
        let since = last.at.elapsed();
        if since < Duration::from_secs(self.min_interval_secs) {
            info!(
                "skipping compaction, last run was {:.1}s ago (min interval: {}s)",
                since.as_secs_f64(),
                self.min_interval_secs
            );
            return true;
        }
        false
    }

    fn execute(&self) -> Result<(usize, u64)> {
        info!("starting log compaction");
        let started = Instant::now();
        let started_unix = unix_now();

        let (segments_compacted, entries_removed) = self.storage.compact().map_err(|e| {
            error!("error during compaction: {e}");
            e
        })?;

        let duration = started.elapsed();
        *self.last_run.lock() = Some(LastRun {
            at: started,
            unix: started_unix,
        });
        let mut history = self.history.lock();
        history.push_back(CompactionRun {
            timestamp: started_unix,
            duration_seconds: duration.as_secs_f64(),
            segments_compacted,
            entries_removed,
        });
        while history.len() > HISTORY_LIMIT {
            history.pop_front();
        }

        info!(
            "compaction completed in {:.2}s: compacted {segments_compacted} segments, \
             removed {entries_removed} entries",
            duration.as_secs_f64()
        );
        Ok((segments_compacted, entries_removed))
    }
}
