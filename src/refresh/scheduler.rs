//! Auto-refresh scheduler.
//!
//! Two background tasks cooperate:
//!
//! 1. The scan loop wakes every `scan_interval`, adds any repository the
//!    target tracks but the due-table lacks (clones made by other processes
//!    sharing the cache root), then removes every due path that is not
//!    already refreshing from the due-table and hands it to the worker loop.
//! 2. The worker loop admits each path through a counting semaphore and runs
//!    the refresh in a tracked task.  When a refresh finishes the path is
//!    rescheduled: at the normal cadence on success, with a backoff of twice
//!    the longer interval on failure.
//!
//! Refresh failures never escape the loops; they are logged and retried via
//! rescheduling.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::activity::{classify, Activity};
use super::RefreshReport;
use crate::config::AutoRefreshConfig;
use crate::error::CacheError;

/// Callback interface the scheduler drives.
#[async_trait]
pub trait RefreshTarget: Send + Sync {
    async fn refresh(&self, path: &Path) -> Result<RefreshReport, CacheError>;

    /// Most recent commit (or file modification) time for `path`.
    async fn last_activity(&self, path: &Path) -> anyhow::Result<Option<DateTime<Utc>>>;

    /// Every path that should be on the due-table.
    async fn tracked_paths(&self) -> Result<Vec<PathBuf>, CacheError>;
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub enabled: bool,
    pub active_interval: Duration,
    pub inactive_interval: Duration,
    pub activity_window: Duration,
    pub startup_delay: Duration,
    pub scan_interval: Duration,
    pub max_concurrent_refreshes: usize,
    pub stop_grace_period: Duration,
}

impl SchedulerSettings {
    /// Interval applied after a failed refresh.
    pub fn backoff_interval(&self) -> Duration {
        self.active_interval.max(self.inactive_interval) * 2
    }
}

impl From<&AutoRefreshConfig> for SchedulerSettings {
    fn from(config: &AutoRefreshConfig) -> Self {
        Self {
            enabled: config.enabled,
            active_interval: config.active_interval(),
            inactive_interval: config.inactive_interval(),
            activity_window: config.activity_window(),
            startup_delay: config.startup_delay(),
            scan_interval: config.scan_interval(),
            max_concurrent_refreshes: config.max_concurrent_refreshes.max(1),
            stop_grace_period: config.stop_grace_period(),
        }
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AutoRefreshStatus {
    pub enabled: bool,
    pub running: bool,
    pub scheduled_count: usize,
    pub active_count: usize,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ScheduleState {
    /// Path -> next due time.
    scheduled: HashMap<PathBuf, Instant>,
    /// Paths scheduled at least once since construction.
    seen: HashSet<PathBuf>,
    /// Paths handed to the worker loop whose refresh has not finished.
    active: HashSet<PathBuf>,
}

struct Running {
    cancel: CancellationToken,
    scan: JoinHandle<()>,
    worker: JoinHandle<()>,
}

pub struct AutoRefreshScheduler {
    settings: SchedulerSettings,
    target: Weak<dyn RefreshTarget>,
    state: Mutex<ScheduleState>,
    permits: Arc<Semaphore>,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for AutoRefreshScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoRefreshScheduler")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl AutoRefreshScheduler {
    pub fn new(settings: SchedulerSettings, target: Weak<dyn RefreshTarget>) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_concurrent_refreshes.max(1)));
        Self {
            settings,
            target,
            state: Mutex::new(ScheduleState::default()),
            permits,
            running: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    // -- scheduling ---------------------------------------------------------

    /// Put `path` on the due-table.  The first time a path is seen it becomes
    /// due after the startup delay; afterwards after the active or inactive
    /// interval depending on its recent activity.
    pub async fn schedule(&self, path: &Path) {
        if !self.settings.enabled {
            return;
        }

        let first = !lock(&self.state).seen.contains(path);
        let delay = if first {
            self.settings.startup_delay
        } else {
            match self.classify(path).await {
                Activity::Active => self.settings.active_interval,
                Activity::Inactive => self.settings.inactive_interval,
            }
        };

        let due = Instant::now() + delay;
        let mut state = lock(&self.state);
        state.seen.insert(path.to_path_buf());
        state.scheduled.insert(path.to_path_buf(), due);
        debug!(path = %path.display(), delay_secs = delay.as_secs(), first, "repository scheduled for refresh");
    }

    /// Reschedule `path` after a failed refresh.
    pub fn schedule_backoff(&self, path: &Path) {
        if !self.settings.enabled {
            return;
        }
        let delay = self.settings.backoff_interval();
        let mut state = lock(&self.state);
        state.seen.insert(path.to_path_buf());
        state.scheduled.insert(path.to_path_buf(), Instant::now() + delay);
        debug!(path = %path.display(), delay_secs = delay.as_secs(), "refresh backed off");
    }

    /// Forget `path` entirely (the entry was deleted).
    pub fn unschedule(&self, path: &Path) {
        let mut state = lock(&self.state);
        state.scheduled.remove(path);
        state.seen.remove(path);
    }

    pub fn next_refresh_at(&self, path: &Path) -> Option<Instant> {
        lock(&self.state).scheduled.get(path).copied()
    }

    async fn classify(&self, path: &Path) -> Activity {
        let Some(target) = self.target.upgrade() else {
            return Activity::Inactive;
        };
        match target.last_activity(path).await {
            Ok(last) => classify(last, Utc::now(), self.settings.activity_window),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "activity lookup failed; treating as inactive");
                Activity::Inactive
            }
        }
    }

    /// Schedule every tracked path that is neither on the due-table nor
    /// refreshing.  Returns how many were added.
    pub async fn sync_tracked(&self) -> Result<usize, CacheError> {
        if !self.settings.enabled {
            return Ok(0);
        }
        let Some(target) = self.target.upgrade() else {
            return Ok(0);
        };
        let tracked = target.tracked_paths().await?;
        let missing: Vec<PathBuf> = {
            let state = lock(&self.state);
            tracked
                .into_iter()
                .filter(|p| !state.scheduled.contains_key(p) && !state.active.contains(p))
                .collect()
        };
        for path in &missing {
            self.schedule(path).await;
        }
        if !missing.is_empty() {
            debug!(added = missing.len(), "untracked repositories scheduled");
        }
        Ok(missing.len())
    }

    /// Remove and return every path due at `now` that is not refreshing,
    /// marking each one active.
    fn take_due(&self, now: Instant) -> Vec<PathBuf> {
        let mut state = lock(&self.state);
        let ScheduleState { scheduled, active, .. } = &mut *state;
        let due: Vec<PathBuf> = scheduled
            .iter()
            .filter(|(path, at)| **at <= now && !active.contains(*path))
            .map(|(path, _)| path.clone())
            .collect();
        for path in &due {
            scheduled.remove(path);
            active.insert(path.clone());
        }
        due
    }

    /// Put a dispatched path that never started back on the due-table.
    fn requeue(&self, path: PathBuf) {
        let mut state = lock(&self.state);
        state.active.remove(&path);
        state.scheduled.insert(path, Instant::now());
    }

    // -- lifecycle ----------------------------------------------------------

    /// Spawn the scan and worker loops.  No-op when disabled or already
    /// running.
    pub fn start(self: &Arc<Self>) {
        if !self.settings.enabled {
            debug!("auto-refresh disabled; not starting scheduler");
            return;
        }
        let mut running = lock(&self.running);
        if running.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let scan = tokio::spawn(Arc::clone(self).scan_loop(tx, cancel.clone()));
        let worker = tokio::spawn(Arc::clone(self).worker_loop(rx, cancel.clone()));
        *running = Some(Running { cancel, scan, worker });

        info!(
            scan_interval_secs = self.settings.scan_interval.as_secs(),
            max_concurrent = self.settings.max_concurrent_refreshes,
            "auto-refresh scheduler started"
        );
    }

    /// Signal both loops to exit and wait for them.  In-flight refreshes get
    /// `stop_grace_period` to finish before they are aborted.
    pub async fn stop(&self) {
        if !self.settings.enabled {
            return;
        }
        let Some(running) = lock(&self.running).take() else {
            return;
        };

        running.cancel.cancel();
        if let Err(e) = running.scan.await {
            error!(error = %e, "scan loop terminated abnormally");
        }
        if let Err(e) = running.worker.await {
            error!(error = %e, "worker loop terminated abnormally");
        }
        info!("auto-refresh scheduler stopped");
    }

    pub fn status(&self) -> AutoRefreshStatus {
        let running = lock(&self.running).is_some();
        let state = lock(&self.state);
        AutoRefreshStatus {
            enabled: self.settings.enabled,
            running,
            scheduled_count: state.scheduled.len(),
            active_count: state.active.len(),
        }
    }

    // -- loops --------------------------------------------------------------

    async fn scan_loop(self: Arc<Self>, tx: mpsc::UnboundedSender<PathBuf>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.sync_tracked().await {
                warn!(error = %e, "failed to read tracked repositories");
            }

            let due = self.take_due(Instant::now());
            if !due.is_empty() {
                debug!(count = due.len(), "repositories due for refresh");
            }
            for path in due {
                if let Err(returned) = tx.send(path) {
                    // Worker gone; put the path back so a later start sees it.
                    self.requeue(returned.0);
                    return;
                }
            }
        }
        debug!("scan loop exiting");
    }

    async fn worker_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<PathBuf>, cancel: CancellationToken) {
        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = result {
                        if e.is_panic() {
                            error!(error = %e, "refresh task panicked");
                        }
                    }
                }
                received = rx.recv() => {
                    let Some(path) = received else { break };
                    let permit = tokio::select! {
                        _ = cancel.cancelled() => {
                            self.requeue(path);
                            break;
                        }
                        permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                            Ok(p) => p,
                            Err(_) => {
                                self.requeue(path);
                                break;
                            }
                        },
                    };
                    let this = Arc::clone(&self);
                    tasks.spawn(async move {
                        let _permit = permit;
                        this.run_refresh(path).await;
                    });
                }
            }
        }

        // Paths handed over but never started stay due for the next start.
        rx.close();
        while let Ok(path) = rx.try_recv() {
            self.requeue(path);
        }

        let grace = self.settings.stop_grace_period;
        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = tasks.len(),
                grace_secs = grace.as_secs(),
                "aborting refreshes still running after grace period"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
        debug!("worker loop exiting");
    }

    #[instrument(skip(self, path), fields(path = %path.display()))]
    async fn run_refresh(self: Arc<Self>, path: PathBuf) {
        let mut guard = ActiveGuard {
            scheduler: Arc::clone(&self),
            path: path.clone(),
            finished: false,
        };

        let Some(target) = self.target.upgrade() else {
            guard.finished = true;
            return;
        };

        info!("auto-refreshing repository");
        match target.refresh(&path).await {
            Ok(RefreshReport::Success { commit }) => {
                info!(%commit, "auto-refresh succeeded");
                self.schedule(&path).await;
            }
            Ok(RefreshReport::NotARepository) => {
                debug!("not a repository; nothing to pull");
                self.schedule(&path).await;
            }
            Ok(RefreshReport::Error { error }) => {
                warn!(%error, "auto-refresh failed");
                self.schedule_backoff(&path);
            }
            Err(CacheError::NotFound(_)) => {
                debug!("entry no longer exists; dropping from schedule");
                self.unschedule(&path);
            }
            Err(e @ (CacheError::WorktreeBusy(_) | CacheError::CloneInProgress(_))) => {
                debug!(error = %e, "worktree busy; retrying at normal cadence");
                self.schedule(&path).await;
            }
            Err(e) => {
                warn!(error = %e, kind = e.kind(), "auto-refresh failed");
                self.schedule_backoff(&path);
            }
        }
        guard.finished = true;
    }
}

/// Clears the active flag however a refresh task ends; an unfinished
/// (panicked or aborted) refresh is rescheduled with backoff.
struct ActiveGuard {
    scheduler: Arc<AutoRefreshScheduler>,
    path: PathBuf,
    finished: bool,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut state = lock(&self.scheduler.state);
        state.active.remove(&self.path);
        if !self.finished && self.scheduler.settings.enabled {
            let due = Instant::now() + self.scheduler.settings.backoff_interval();
            state.scheduled.insert(self.path.clone(), due);
        }
    }
}
