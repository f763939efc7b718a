//! Repository cache manager.
//!
//! Owns the metadata store, the in-memory handle map, the background clone
//! jobs and the auto-refresh scheduler.  Clone requests return as soon as a
//! `pending` record is written; the clone itself runs as a tracked task that
//! later moves the record to `complete` or `failed`.  Callers poll the
//! metadata for progress.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::entry::{CacheEntry, CacheStrategy, CloneState};
use super::handle::RepoHandle;
use super::metadata::{entry_key, MetadataStore};
use super::path::resolve_cache_path;
use super::validation::validate_deletable_path;
use crate::config::{CacheConfig, Config, CredentialsConfig};
use crate::credentials::{authenticated_url, canonical_url, redact};
use crate::error::CacheError;
use crate::forge::{self, Provider};
use crate::git::{self, VersionControl};
use crate::refresh::{AutoRefreshScheduler, AutoRefreshStatus, RefreshReport, RefreshTarget, SchedulerSettings};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

// ---------------------------------------------------------------------------
// Operation results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloneRequestStatus {
    /// A new clone job was started.
    Pending,
    AlreadyCloned,
    SwitchedBranch,
    /// Another request's clone of the same path is still running.
    Cloning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CloneOutcome {
    pub status: CloneRequestStatus,
    pub path: PathBuf,
    pub branch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteReport {
    pub deleted_paths: Vec<PathBuf>,
    pub failed_count: usize,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    /// Substring the entry URL must contain.
    pub url: Option<String>,
    pub status: Option<CloneState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CachedRepository {
    #[serde(flatten)]
    pub entry: CacheEntry,
    pub size_mb: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheListing {
    pub repositories: Vec<CachedRepository>,
    /// Entries in the cache, regardless of the filter.
    pub total_cached: usize,
    pub max_cached_repos: usize,
    pub cache_dir: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoverySummary {
    /// In-flight records from a previous process, now `failed`.
    pub interrupted: usize,
    /// Records whose directory no longer exists.
    pub dropped: usize,
}

/// Per-entry outcome inside a delete call.
enum EntryRemoval {
    Deleted,
    /// No record and no directory, or another caller is deleting it.
    Missing,
    Failed(String),
}

/// Result of claiming a path for a new clone under the metadata lock.
enum Claim {
    Claimed,
    InFlight,
    Complete(Option<String>),
}

// ---------------------------------------------------------------------------
// RepositoryManager
// ---------------------------------------------------------------------------

pub struct RepositoryManager {
    cache: CacheConfig,
    credentials: CredentialsConfig,
    /// Canonicalized cache root; every resolved path lives under it.
    root: PathBuf,
    store: MetadataStore,
    vcs: Arc<dyn VersionControl>,
    handles: Mutex<HashMap<PathBuf, Arc<RepoHandle>>>,
    clone_jobs: Mutex<HashMap<PathBuf, JoinHandle<()>>>,
    clone_permits: Arc<Semaphore>,
    /// Paths with a delete in progress.
    deleting: Mutex<HashSet<PathBuf>>,
    /// Paths with a pull or branch switch running in their worktree.
    busy: Mutex<HashSet<PathBuf>>,
    scheduler: Arc<AutoRefreshScheduler>,
}

impl std::fmt::Debug for RepositoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryManager")
            .field("root", &self.root)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RepositoryManager {
    /// Create the cache root if needed and build a manager over it.
    pub fn new(config: &Config, vcs: Arc<dyn VersionControl>) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.cache.root).with_context(|| {
            format!("failed to create cache root: {}", config.cache.root.display())
        })?;
        let root = std::fs::canonicalize(&config.cache.root).with_context(|| {
            format!("failed to resolve cache root: {}", config.cache.root.display())
        })?;
        let store = MetadataStore::new(root.join(&config.cache.metadata_file));
        let settings = SchedulerSettings::from(&config.auto_refresh);
        let clone_permits = Arc::new(Semaphore::new(config.clone.max_concurrent_clones.max(1)));

        info!(
            root = %root.display(),
            max_cached_repos = config.cache.max_cached_repos,
            auto_refresh = settings.enabled,
            "repository manager initialised"
        );

        Ok(Arc::new_cyclic(|weak: &Weak<Self>| {
            let target: Weak<dyn RefreshTarget> = weak.clone();
            Self {
                cache: config.cache.clone(),
                credentials: config.credentials.clone(),
                root,
                store,
                vcs,
                handles: Mutex::new(HashMap::new()),
                clone_jobs: Mutex::new(HashMap::new()),
                clone_permits,
                deleting: Mutex::new(HashSet::new()),
                busy: Mutex::new(HashSet::new()),
                scheduler: Arc::new(AutoRefreshScheduler::new(settings, target)),
            }
        }))
    }

    pub fn cache_root(&self) -> &Path {
        &self.root
    }

    pub fn max_cached_repos(&self) -> usize {
        self.cache.max_cached_repos
    }

    // -----------------------------------------------------------------------
    // Clone
    // -----------------------------------------------------------------------

    /// Request a cached clone of `url`.
    ///
    /// Returns immediately: `pending` when a background clone was started,
    /// `cloning` when one is already running for the resolved path,
    /// `already_cloned` or `switched_branch` when the entry is complete.
    #[instrument(skip(self, url), fields(url = %redact(url)))]
    pub async fn clone_repository(
        self: &Arc<Self>,
        url: &str,
        branch: Option<&str>,
        strategy: CacheStrategy,
    ) -> Result<CloneOutcome, CacheError> {
        let branch = branch.map(str::trim).filter(|b| !b.is_empty()).map(str::to_string);
        let canonical = canonical_url(url);
        let path = resolve_cache_path(&self.root, &canonical, branch.as_deref(), strategy)?;

        if let Some(existing) = self.store.get(&path).await? {
            match existing.state() {
                CloneState::Complete => {
                    let same_branch = match branch.as_deref() {
                        None => true,
                        Some(b) => existing.current_branch.as_deref() == Some(b),
                    };
                    if same_branch {
                        self.touch(&path).await?;
                        debug!(path = %path.display(), "repository already cloned");
                        return Ok(CloneOutcome {
                            status: CloneRequestStatus::AlreadyCloned,
                            path,
                            branch: existing.current_branch,
                        });
                    }
                    if let Some(target) = branch.as_deref() {
                        return self.switch_branch(&existing, target).await;
                    }
                }
                state if state.is_in_flight() => {
                    debug!(path = %path.display(), %state, "clone already in progress");
                    return Ok(CloneOutcome {
                        status: CloneRequestStatus::Cloning,
                        path,
                        branch: existing.current_branch,
                    });
                }
                _ => debug!(path = %path.display(), "retrying failed clone"),
            }
        }

        let location = forge::parse_repo_url(&canonical)?;
        if let Some(source) = &location.local_path {
            if !source.is_dir() {
                return Err(CacheError::InvalidUrl {
                    url: canonical,
                    reason: "local path does not exist or is not a directory".to_string(),
                });
            }
        }

        // Another entry of an already cached repository takes no new slot.
        if self.list_branches(&canonical).await?.is_empty() {
            self.check_capacity().await?;
            self.check_disk_space().await?;
        }

        let now = Utc::now();
        let key = entry_key(&path);
        let fresh = CacheEntry::new_pending(path.clone(), canonical.clone(), strategy, branch.clone(), now);
        let claim = self
            .store
            .update(move |entries| match entries.get_mut(&key) {
                Some(e) if e.state().is_in_flight() => Claim::InFlight,
                Some(e) if e.state() == CloneState::Complete => Claim::Complete(e.current_branch.clone()),
                Some(e) => {
                    e.clone_status.reset_for_retry(now);
                    e.current_branch = fresh.current_branch;
                    e.last_access = now;
                    e.size_bytes = 0;
                    Claim::Claimed
                }
                None => {
                    entries.insert(key, fresh);
                    Claim::Claimed
                }
            })
            .await?;

        match claim {
            Claim::InFlight => {
                return Ok(CloneOutcome {
                    status: CloneRequestStatus::Cloning,
                    path,
                    branch,
                })
            }
            Claim::Complete(current) => {
                return Ok(CloneOutcome {
                    status: CloneRequestStatus::AlreadyCloned,
                    path,
                    branch: current,
                })
            }
            Claim::Claimed => {}
        }

        info!(path = %path.display(), ?branch, %strategy, "starting background clone");
        let this = Arc::clone(self);
        let job_path = path.clone();
        let job_branch = branch.clone();
        let job = tokio::spawn(async move {
            this.run_clone_job(job_path, canonical, location, job_branch).await;
        });
        {
            let mut jobs = lock(&self.clone_jobs);
            jobs.retain(|_, handle| !handle.is_finished());
            jobs.insert(path.clone(), job);
        }

        Ok(CloneOutcome {
            status: CloneRequestStatus::Pending,
            path,
            branch,
        })
    }

    /// Counts distinct repository URLs, not entries.  Advisory: concurrent
    /// requests may both pass before either records its entry.
    async fn check_capacity(&self) -> Result<(), CacheError> {
        let entries = self.store.read().await?;
        let cached = entries.values().map(|e| e.url.as_str()).collect::<HashSet<_>>().len();
        if cached >= self.cache.max_cached_repos {
            warn!(cached, max = self.cache.max_cached_repos, "repository cache is full");
            return Err(CacheError::CacheFull {
                cached,
                max: self.cache.max_cached_repos,
            });
        }
        Ok(())
    }

    async fn check_disk_space(&self) -> Result<(), CacheError> {
        match git::available_space(&self.root).await {
            Ok(available) if available < self.cache.min_free_bytes => {
                warn!(available, required = self.cache.min_free_bytes, "insufficient disk space");
                Err(CacheError::InsufficientDiskSpace {
                    available,
                    required: self.cache.min_free_bytes,
                })
            }
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(error = %e, "could not determine free disk space; continuing");
                Ok(())
            }
        }
    }

    #[instrument(skip_all, fields(path = %path.display()))]
    async fn run_clone_job(
        self: Arc<Self>,
        path: PathBuf,
        canonical: String,
        location: forge::RepoLocation,
        branch: Option<String>,
    ) {
        let Ok(_permit) = Arc::clone(&self.clone_permits).acquire_owned().await else {
            return;
        };

        let key = entry_key(&path);
        let started = self
            .store
            .update(move |entries| match entries.get_mut(&key) {
                Some(e) => e.clone_status.mark_cloning(Utc::now()),
                None => false,
            })
            .await;
        match started {
            Ok(true) => {}
            Ok(false) => {
                debug!("entry removed or no longer pending; abandoning clone");
                return;
            }
            Err(e) => {
                error!(error = %e, "failed to record clone start");
                return;
            }
        }

        let result = self.materialize(&path, &canonical, &location, branch.as_deref()).await;

        match result {
            Ok(snapshot) => {
                let current_branch = if snapshot {
                    branch.clone()
                } else {
                    match self.vcs.current_branch(&path).await {
                        Ok(Some(b)) => Some(b),
                        _ => branch.clone(),
                    }
                };
                let size = git::repo_size_bytes(&path).await.unwrap_or(0);
                let key = entry_key(&path);
                let recorded = self
                    .store
                    .update(move |entries| match entries.get_mut(&key) {
                        Some(e) => {
                            let now = Utc::now();
                            e.clone_status.mark_complete(now);
                            e.current_branch = current_branch;
                            e.size_bytes = size;
                            e.last_access = now;
                            true
                        }
                        None => false,
                    })
                    .await;
                match recorded {
                    Ok(true) => {
                        info!(size_bytes = size, "clone complete");
                        self.scheduler.schedule(&path).await;
                    }
                    Ok(false) => {
                        debug!("entry deleted during clone; removing directory");
                        if let Err(e) = git::remove_repo(&path).await {
                            warn!(error = %e, "failed to remove orphaned clone");
                        }
                    }
                    Err(e) => error!(error = %e, "failed to record clone completion"),
                }
            }
            Err(e) => {
                let message = redact(&format!("{e:#}"));
                error!(error = %message, "clone failed");
                // A failed record still owns a directory.
                if let Err(e) = tokio::fs::create_dir_all(&path).await {
                    warn!(error = %e, "failed to create placeholder directory for failed clone");
                }
                let key = entry_key(&path);
                let recorded = self
                    .store
                    .update(move |entries| match entries.get_mut(&key) {
                        Some(e) => {
                            e.clone_status.mark_failed(Utc::now(), message);
                            true
                        }
                        None => false,
                    })
                    .await;
                match recorded {
                    Ok(true) => {}
                    Ok(false) => {
                        let _ = git::remove_repo(&path).await;
                    }
                    Err(e) => error!(error = %e, "failed to record clone failure"),
                }
            }
        }
    }

    /// Populate `path`.  Returns `true` for a plain directory snapshot.
    async fn materialize(
        &self,
        path: &Path,
        canonical: &str,
        location: &forge::RepoLocation,
        branch: Option<&str>,
    ) -> Result<bool> {
        // Leftovers from an earlier failed attempt.
        git::remove_repo(path).await?;

        if location.provider == Provider::Local {
            if let Some(source) = location.local_path.as_deref() {
                if !git::is_git_worktree(source) {
                    git::copy_dir(source, path).await?;
                    return Ok(true);
                }
            }
        }

        let fetch_url = authenticated_url(canonical, &self.credentials);
        self.vcs.clone_repo(&fetch_url, canonical, path, branch).await?;
        Ok(false)
    }

    async fn switch_branch(&self, entry: &CacheEntry, target: &str) -> Result<CloneOutcome, CacheError> {
        let path = entry.cache_path.clone();
        if !git::is_git_worktree(&path) {
            return Err(CacheError::Provider(format!(
                "{} is not a git repository; cannot switch to branch '{target}'",
                path.display()
            )));
        }

        let Some(_busy) = PathClaim::acquire(&self.busy, &path) else {
            debug!(path = %path.display(), "worktree busy; branch switch not started");
            return Ok(CloneOutcome {
                status: CloneRequestStatus::Cloning,
                path,
                branch: entry.current_branch.clone(),
            });
        };

        let key = entry_key(&path);
        let claimed = self
            .store
            .update(move |entries| match entries.get_mut(&key) {
                Some(e) if e.state() == CloneState::Complete => {
                    e.clone_status.mark_cloning(Utc::now());
                    true
                }
                _ => false,
            })
            .await?;
        if !claimed {
            return Ok(CloneOutcome {
                status: CloneRequestStatus::Cloning,
                path,
                branch: entry.current_branch.clone(),
            });
        }

        info!(path = %path.display(), from = ?entry.current_branch, to = target, "switching branch in place");
        let fetch_url = authenticated_url(&entry.url, &self.credentials);
        let result = self.vcs.switch_branch(&path, &fetch_url, target).await;

        let key = entry_key(&path);
        let target_owned = target.to_string();
        let previous = entry.current_branch.clone();
        let failure = result.as_ref().err().map(|e| redact(&format!("{e:#}")));
        let failure_for_store = failure.clone();
        self.store
            .update(move |entries| {
                if let Some(e) = entries.get_mut(&key) {
                    let now = Utc::now();
                    e.clone_status.mark_complete(now);
                    e.last_access = now;
                    match failure_for_store {
                        None => e.current_branch = Some(target_owned),
                        Some(msg) => {
                            e.current_branch = previous;
                            e.clone_status.error = Some(msg);
                        }
                    }
                }
            })
            .await?;

        match failure {
            None => Ok(CloneOutcome {
                status: CloneRequestStatus::SwitchedBranch,
                path,
                branch: Some(target.to_string()),
            }),
            Some(msg) => {
                warn!(path = %path.display(), error = %msg, "branch switch failed");
                Err(CacheError::Provider(msg))
            }
        }
    }

    /// Wait until no clone job for `path` is running, then return its entry.
    pub async fn wait_for_clone(&self, path: &Path) -> Result<Option<CacheEntry>, CacheError> {
        loop {
            let running = lock(&self.clone_jobs)
                .get(path)
                .is_some_and(|job| !job.is_finished());
            if !running {
                break;
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
        Ok(self.store.get(path).await?)
    }

    /// Wait up to `grace` for running clone jobs, then abort the rest.
    /// Aborted entries stay in flight and are failed by the next
    /// [`recover`](Self::recover).
    pub async fn shutdown(&self, grace: Duration) {
        let jobs: Vec<(PathBuf, JoinHandle<()>)> = lock(&self.clone_jobs).drain().collect();
        if jobs.is_empty() {
            return;
        }
        info!(count = jobs.len(), "waiting for clone jobs");
        let deadline = tokio::time::Instant::now() + grace;
        for (path, mut job) in jobs {
            match tokio::time::timeout_at(deadline, &mut job).await {
                Ok(_) => {}
                Err(_) => {
                    warn!(path = %path.display(), "aborting clone job at shutdown");
                    job.abort();
                    let _ = job.await;
                }
            }
        }
    }

    /// Reconcile metadata with the filesystem after an unclean exit.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<RecoverySummary, CacheError> {
        let live: HashSet<String> = lock(&self.clone_jobs)
            .iter()
            .filter(|(_, job)| !job.is_finished())
            .map(|(path, _)| entry_key(path))
            .collect();

        let summary = self
            .store
            .update(move |entries| {
                let mut summary = RecoverySummary::default();
                entries.retain(|key, e| {
                    if live.contains(key) {
                        return true;
                    }
                    if !e.cache_path.is_dir() {
                        summary.dropped += 1;
                        return false;
                    }
                    if e.state().is_in_flight() {
                        e.clone_status.mark_failed(Utc::now(), "clone interrupted before completion");
                        summary.interrupted += 1;
                    }
                    true
                });
                summary
            })
            .await?;

        if summary != RecoverySummary::default() {
            info!(interrupted = summary.interrupted, dropped = summary.dropped, "metadata recovered");
        }
        Ok(summary)
    }

    // -----------------------------------------------------------------------
    // Listing and lookup
    // -----------------------------------------------------------------------

    pub async fn list_repositories(&self) -> Result<Vec<CacheEntry>, CacheError> {
        Ok(self.store.read().await?.into_values().collect())
    }

    /// Filtered listing with sizes recomputed for complete entries.
    pub async fn list_cached_repositories(&self, filter: &ListFilter) -> Result<CacheListing, CacheError> {
        let entries = self.store.read().await?;
        let total_cached = entries.len();

        let mut repositories = Vec::new();
        for mut entry in entries.into_values() {
            if let Some(needle) = &filter.url {
                if !entry.url.contains(needle.as_str()) {
                    continue;
                }
            }
            if let Some(state) = filter.status {
                if entry.state() != state {
                    continue;
                }
            }
            if entry.state() == CloneState::Complete {
                match git::repo_size_bytes(&entry.cache_path).await {
                    Ok(size) => entry.size_bytes = size,
                    Err(e) => debug!(path = %entry.cache_path.display(), error = %e, "size computation failed"),
                }
            }
            let size_mb = (entry.size_bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0;
            repositories.push(CachedRepository { entry, size_mb });
        }

        Ok(CacheListing {
            repositories,
            total_cached,
            max_cached_repos: self.cache.max_cached_repos,
            cache_dir: self.root.clone(),
        })
    }

    /// Every entry cached for `url`, across strategies and branches.
    pub async fn list_branches(&self, url: &str) -> Result<Vec<CacheEntry>, CacheError> {
        let canonical = canonical_url(url);
        Ok(self
            .store
            .read()
            .await?
            .into_values()
            .filter(|e| e.url == canonical)
            .collect())
    }

    /// Handle for a cached entry, created on first access.
    pub async fn get_repository(&self, path: &Path) -> Result<Arc<RepoHandle>, CacheError> {
        let path = self.normalize(path);
        if lock(&self.deleting).contains(&path) {
            return Err(CacheError::NotFound(path.display().to_string()));
        }
        let Some(entry) = self.store.get(&path).await? else {
            return Err(CacheError::NotFound(path.display().to_string()));
        };
        self.touch(&path).await?;

        let handle = Arc::clone(
            lock(&self.handles)
                .entry(path.clone())
                .or_insert_with(|| Arc::new(RepoHandle::new(path, entry.url))),
        );
        Ok(handle)
    }

    async fn touch(&self, path: &Path) -> Result<(), CacheError> {
        let key = entry_key(path);
        self.store
            .update(move |entries| {
                if let Some(e) = entries.get_mut(&key) {
                    e.touch(Utc::now());
                }
            })
            .await?;
        Ok(())
    }

    /// Canonical form of a caller-supplied path (symlinks in the root
    /// resolved) so it matches metadata keys.
    fn normalize(&self, path: &Path) -> PathBuf {
        std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
    }

    // -----------------------------------------------------------------------
    // Delete
    // -----------------------------------------------------------------------

    /// Delete by URL (every entry for it) or by cache directory path.
    #[instrument(skip(self, identifier), fields(identifier = %redact(identifier)))]
    pub async fn delete_repository(&self, identifier: &str) -> Result<DeleteReport, CacheError> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Err(CacheError::EmptyIdentifier);
        }

        if forge::is_url_identifier(identifier) {
            return self.delete_by_url(identifier).await;
        }
        // A local source directory is recorded under its path as the URL.
        if !self.list_branches(identifier).await?.is_empty() {
            return self.delete_by_url(identifier).await;
        }
        self.delete_by_path(identifier).await
    }

    async fn delete_by_url(&self, url: &str) -> Result<DeleteReport, CacheError> {
        let canonical = canonical_url(url);
        let matches = self.list_branches(&canonical).await?;
        if matches.is_empty() {
            return Err(CacheError::NotFound(canonical));
        }

        let mut deleted_paths = Vec::new();
        let mut failures = Vec::new();
        for entry in matches {
            match self.remove_entry(&entry.cache_path).await {
                EntryRemoval::Deleted => deleted_paths.push(entry.cache_path),
                EntryRemoval::Missing => {}
                EntryRemoval::Failed(msg) => {
                    failures.push(format!("{}: {msg}", entry.cache_path.display()));
                }
            }
        }

        if deleted_paths.is_empty() {
            if failures.is_empty() {
                return Err(CacheError::NotFound(canonical));
            }
            error!(url = %canonical, failures = failures.len(), "failed to delete any cache entry");
            return Err(CacheError::DeleteFailed {
                identifier: canonical,
                failures,
            });
        }

        let mut message = format!(
            "Successfully deleted {} cache entries for repository {canonical}",
            deleted_paths.len()
        );
        if !failures.is_empty() {
            warn!(url = %canonical, failures = ?failures, "some cache entries could not be deleted");
            message.push_str(&format!(" ({} entries failed to delete)", failures.len()));
        }
        info!(url = %canonical, deleted = deleted_paths.len(), "deleted cache entries");

        Ok(DeleteReport {
            deleted_paths,
            failed_count: failures.len(),
            message,
        })
    }

    async fn delete_by_path(&self, raw: &str) -> Result<DeleteReport, CacheError> {
        let path = validate_deletable_path(&self.root, Path::new(raw))?;
        match self.remove_entry(&path).await {
            EntryRemoval::Deleted => {
                info!(path = %path.display(), "deleted cache entry");
                Ok(DeleteReport {
                    message: format!("Successfully deleted cache entry {}", path.display()),
                    deleted_paths: vec![path],
                    failed_count: 0,
                })
            }
            EntryRemoval::Missing => Err(CacheError::NotFound(path.display().to_string())),
            EntryRemoval::Failed(msg) => Err(CacheError::DeleteFailed {
                identifier: path.display().to_string(),
                failures: vec![msg],
            }),
        }
    }

    /// Remove one entry's clone job, directory, record and handle.
    async fn remove_entry(&self, path: &Path) -> EntryRemoval {
        let Some(_claim) = PathClaim::acquire(&self.deleting, path) else {
            debug!(path = %path.display(), "delete already in progress elsewhere");
            return EntryRemoval::Missing;
        };

        let record = match self.store.get(path).await {
            Ok(r) => r,
            Err(e) => return EntryRemoval::Failed(format!("{e:#}")),
        };
        if record.is_none() && !path.exists() {
            return EntryRemoval::Missing;
        }

        let job = lock(&self.clone_jobs).remove(path);
        if let Some(job) = job {
            job.abort();
            let _ = job.await;
            debug!(path = %path.display(), "aborted in-flight clone");
        }
        self.scheduler.unschedule(path);

        if let Err(e) = git::remove_repo(path).await {
            warn!(path = %path.display(), error = %e, "failed to remove cache directory");
            return EntryRemoval::Failed(format!("{e:#}"));
        }
        if let Err(e) = self.store.remove(path).await {
            warn!(path = %path.display(), error = %e, "failed to remove metadata record");
            return EntryRemoval::Failed(format!("{e:#}"));
        }
        // Already gone is fine.
        lock(&self.handles).remove(path);

        EntryRemoval::Deleted
    }

    // -----------------------------------------------------------------------
    // Refresh
    // -----------------------------------------------------------------------

    /// Pull the latest changes into one cached entry.
    #[instrument(skip(self, path), fields(path = %path.display()))]
    pub async fn refresh_repository(&self, path: &Path) -> Result<RefreshReport, CacheError> {
        let path = self.normalize(path);
        let Some(entry) = self.store.get(&path).await? else {
            return Err(CacheError::NotFound(path.display().to_string()));
        };
        if entry.state().is_in_flight() {
            return Err(CacheError::CloneInProgress(path));
        }
        if entry.state() == CloneState::Failed {
            return Ok(RefreshReport::Error {
                error: format!(
                    "clone failed: {}",
                    entry.clone_status.error.as_deref().unwrap_or("unknown error")
                ),
            });
        }

        if !git::is_git_worktree(&path) {
            self.touch(&path).await?;
            return Ok(RefreshReport::NotARepository);
        }

        let Some(_busy) = PathClaim::acquire(&self.busy, &path) else {
            return Err(CacheError::WorktreeBusy(path));
        };
        let fetch_url = authenticated_url(&entry.url, &self.credentials);
        match self.vcs.pull(&path, &fetch_url, entry.current_branch.as_deref()).await {
            Ok(commit) => {
                let size = git::repo_size_bytes(&path).await.unwrap_or(entry.size_bytes);
                let key = entry_key(&path);
                self.store
                    .update(move |entries| {
                        if let Some(e) = entries.get_mut(&key) {
                            e.touch(Utc::now());
                            e.size_bytes = size;
                        }
                    })
                    .await?;
                info!(%commit, "repository refreshed");
                Ok(RefreshReport::Success { commit })
            }
            Err(e) => {
                let error = redact(&format!("{e:#}"));
                warn!(%error, "repository refresh failed");
                Ok(RefreshReport::Error { error })
            }
        }
    }

    // -----------------------------------------------------------------------
    // Auto-refresh
    // -----------------------------------------------------------------------

    /// Start the scheduler and put every complete entry on its due-table.
    pub async fn start_auto_refresh(&self) -> Result<(), CacheError> {
        if !self.scheduler.is_enabled() {
            info!("auto-refresh disabled by configuration");
            return Ok(());
        }
        let scheduled = self.scheduler.sync_tracked().await?;
        self.scheduler.start();
        info!(
            scheduled,
            startup_delay_secs = self.scheduler.settings().startup_delay.as_secs(),
            "auto-refresh schedule rebuilt from metadata"
        );
        Ok(())
    }

    pub async fn stop_auto_refresh(&self) {
        self.scheduler.stop().await;
    }

    pub fn get_auto_refresh_status(&self) -> AutoRefreshStatus {
        self.scheduler.status()
    }
}

#[async_trait]
impl RefreshTarget for RepositoryManager {
    async fn refresh(&self, path: &Path) -> Result<RefreshReport, CacheError> {
        self.refresh_repository(path).await
    }

    async fn last_activity(&self, path: &Path) -> Result<Option<DateTime<Utc>>> {
        if git::is_git_worktree(path) {
            self.vcs.last_commit_time(path).await
        } else {
            git::latest_mtime(path).await
        }
    }

    async fn tracked_paths(&self) -> Result<Vec<PathBuf>, CacheError> {
        Ok(self
            .store
            .read()
            .await?
            .into_values()
            .filter(|e| e.state() == CloneState::Complete)
            .map(|e| e.cache_path)
            .collect())
    }
}

/// Membership in one of the manager's per-path sets for the lifetime of the
/// value.
struct PathClaim<'a> {
    set: &'a Mutex<HashSet<PathBuf>>,
    path: PathBuf,
}

impl<'a> PathClaim<'a> {
    fn acquire(set: &'a Mutex<HashSet<PathBuf>>, path: &Path) -> Option<Self> {
        if lock(set).insert(path.to_path_buf()) {
            Some(Self {
                set,
                path: path.to_path_buf(),
            })
        } else {
            None
        }
    }
}

impl Drop for PathClaim<'_> {
    fn drop(&mut self) {
        lock(self.set).remove(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::git::fake::FakeVcs;

    const URL: &str = "https://github.com/acme/widgets";

    fn config_for(root: &Path, max: usize) -> Config {
        let mut config = Config::default();
        config.cache.root = root.to_path_buf();
        config.cache.max_cached_repos = max;
        config.cache.min_free_bytes = 0;
        config
    }

    fn manager_with(root: &Path, max: usize, vcs: FakeVcs) -> (Arc<RepositoryManager>, Arc<FakeVcs>) {
        let vcs = Arc::new(vcs);
        let dyn_vcs: Arc<dyn VersionControl> = Arc::clone(&vcs) as Arc<dyn VersionControl>;
        let manager = RepositoryManager::new(&config_for(root, max), dyn_vcs).unwrap();
        (manager, vcs)
    }

    async fn clone_and_wait(
        manager: &Arc<RepositoryManager>,
        url: &str,
        branch: Option<&str>,
        strategy: CacheStrategy,
    ) -> CloneOutcome {
        let outcome = manager.clone_repository(url, branch, strategy).await.unwrap();
        manager.wait_for_clone(&outcome.path).await.unwrap();
        outcome
    }

    #[tokio::test]
    async fn shared_clone_is_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, vcs) = manager_with(dir.path(), 10, FakeVcs::new());

        let first = clone_and_wait(&manager, URL, Some("main"), CacheStrategy::Shared).await;
        assert_eq!(first.status, CloneRequestStatus::Pending);

        let second = manager.clone_repository(URL, Some("main"), CacheStrategy::Shared).await.unwrap();
        assert_eq!(second.status, CloneRequestStatus::AlreadyCloned);
        assert_eq!(second.path, first.path);

        let unspecified = manager.clone_repository(URL, None, CacheStrategy::Shared).await.unwrap();
        assert_eq!(unspecified.status, CloneRequestStatus::AlreadyCloned);
        assert_eq!(unspecified.branch.as_deref(), Some("main"));

        assert_eq!(manager.list_repositories().await.unwrap().len(), 1);
        assert_eq!(vcs.clones.load(Ordering::SeqCst), 1);

        let entry = manager.wait_for_clone(&first.path).await.unwrap().unwrap();
        assert_eq!(entry.state(), CloneState::Complete);
        assert!(entry.cache_path.join(".git").is_dir());
    }

    #[tokio::test]
    async fn shared_clone_switches_branch_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, vcs) = manager_with(dir.path(), 10, FakeVcs::new());

        let first = clone_and_wait(&manager, URL, Some("main"), CacheStrategy::Shared).await;
        let switched = manager.clone_repository(URL, Some("develop"), CacheStrategy::Shared).await.unwrap();
        assert_eq!(switched.status, CloneRequestStatus::SwitchedBranch);
        assert_eq!(switched.path, first.path);
        assert_eq!(vcs.switches.load(Ordering::SeqCst), 1);

        let entries = manager.list_repositories().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].current_branch.as_deref(), Some("develop"));
        assert_eq!(entries[0].state(), CloneState::Complete);
    }

    #[tokio::test]
    async fn failed_branch_switch_keeps_previous_branch() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _vcs) = manager_with(dir.path(), 10, FakeVcs::new());

        clone_and_wait(&manager, URL, Some("main"), CacheStrategy::Shared).await;
        let err = manager
            .clone_repository(URL, Some("missing"), CacheStrategy::Shared)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "provider_error");

        let entry = &manager.list_repositories().await.unwrap()[0];
        assert_eq!(entry.current_branch.as_deref(), Some("main"));
        assert_eq!(entry.state(), CloneState::Complete);
        assert!(entry.clone_status.error.is_some());
    }

    #[tokio::test]
    async fn concurrent_requests_collapse_onto_one_job() {
        let dir = tempfile::tempdir().unwrap();
        let (fake, gate) = FakeVcs::gated();
        let (manager, vcs) = manager_with(dir.path(), 10, fake);

        let first = manager.clone_repository(URL, Some("main"), CacheStrategy::Shared).await.unwrap();
        let second = manager.clone_repository(URL, Some("main"), CacheStrategy::Shared).await.unwrap();
        assert_eq!(first.status, CloneRequestStatus::Pending);
        assert_eq!(second.status, CloneRequestStatus::Cloning);
        assert_eq!(second.path, first.path);

        gate.add_permits(10);
        manager.wait_for_clone(&first.path).await.unwrap();
        assert_eq!(vcs.clones.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn per_branch_entries_are_independent_and_deleted_by_url() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _vcs) = manager_with(dir.path(), 10, FakeVcs::new());

        let main = clone_and_wait(&manager, URL, Some("main"), CacheStrategy::PerBranch).await;
        let dev = clone_and_wait(&manager, URL, Some("dev"), CacheStrategy::PerBranch).await;
        assert_ne!(main.path, dev.path);
        assert_eq!(manager.list_branches(URL).await.unwrap().len(), 2);

        let report = manager.delete_repository(URL).await.unwrap();
        assert_eq!(report.deleted_paths.len(), 2);
        assert_eq!(report.failed_count, 0);
        assert_eq!(
            report.message,
            format!("Successfully deleted 2 cache entries for repository {URL}")
        );
        assert!(!main.path.exists());
        assert!(!dev.path.exists());
        assert!(manager.list_repositories().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_identifiers_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _vcs) = manager_with(dir.path(), 10, FakeVcs::new());
        clone_and_wait(&manager, URL, None, CacheStrategy::Shared).await;

        for identifier in ["", "   "] {
            let err = manager.delete_repository(identifier).await.unwrap_err();
            assert!(matches!(err, CacheError::EmptyIdentifier));
        }
        assert_eq!(manager.list_repositories().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn partial_delete_failure_reports_survivors() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _vcs) = manager_with(dir.path(), 10, FakeVcs::new());

        let mut paths = Vec::new();
        for branch in ["a", "b", "c"] {
            paths.push(clone_and_wait(&manager, URL, Some(branch), CacheStrategy::PerBranch).await.path);
        }
        // A regular file where a directory is expected cannot be removed
        // with remove_dir_all.
        std::fs::remove_dir_all(&paths[1]).unwrap();
        std::fs::write(&paths[1], "not a directory").unwrap();

        let report = manager.delete_repository(URL).await.unwrap();
        assert_eq!(report.deleted_paths.len(), 2);
        assert_eq!(report.failed_count, 1);
        assert!(report.message.contains("Successfully deleted 2 cache entries"));
        assert!(report.message.contains("(1 entries failed to delete)"));
        assert!(!report.deleted_paths.contains(&paths[1]));

        let remaining = manager.list_repositories().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].cache_path, paths[1]);
    }

    #[tokio::test]
    async fn total_delete_failure_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _vcs) = manager_with(dir.path(), 10, FakeVcs::new());
        let path = clone_and_wait(&manager, URL, None, CacheStrategy::Shared).await.path;
        std::fs::remove_dir_all(&path).unwrap();
        std::fs::write(&path, "blocker").unwrap();

        let err = manager.delete_repository(URL).await.unwrap_err();
        assert_eq!(err.kind(), "delete_failed");
        assert!(err.to_string().starts_with("Failed to delete all cache entries for repository"));
    }

    #[tokio::test]
    async fn unknown_url_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _vcs) = manager_with(dir.path(), 10, FakeVcs::new());
        let err = manager.delete_repository("https://github.com/nobody/nothing").await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn path_deletes_are_validated() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let (manager, _vcs) = manager_with(dir.path(), 10, FakeVcs::new());

        let err = manager
            .delete_repository(&outside.path().display().to_string())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_path");
        assert!(outside.path().exists());

        let stray = manager.cache_root().join("scratch");
        std::fs::create_dir_all(&stray).unwrap();
        let err = manager.delete_repository(&stray.display().to_string()).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_path");
        assert!(stray.exists());

        // Orphan directory under a namespace, no record and no .git marker.
        let orphan = manager.cache_root().join("github/acme/orphan-0000beef");
        std::fs::create_dir_all(&orphan).unwrap();
        let report = manager.delete_repository(&orphan.display().to_string()).await.unwrap();
        assert_eq!(report.deleted_paths, vec![orphan.clone()]);
        assert!(!orphan.exists());
    }

    #[tokio::test]
    async fn concurrent_delete_has_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _vcs) = manager_with(dir.path(), 10, FakeVcs::new());
        let path = clone_and_wait(&manager, URL, None, CacheStrategy::Shared).await.path;
        manager.get_repository(&path).await.unwrap();

        let id = path.display().to_string();
        let (a, b) = tokio::join!(manager.delete_repository(&id), manager.delete_repository(&id));
        let results = [a, b];
        let wins: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        let losses: Vec<_> = results.iter().filter_map(|r| r.as_ref().err()).collect();
        assert_eq!(wins.len(), 1);
        assert_eq!(wins[0].deleted_paths, vec![path.clone()]);
        assert_eq!(losses.len(), 1);
        assert_eq!(losses[0].kind(), "not_found");

        assert!(manager.get_repository(&path).await.is_err());
    }

    #[tokio::test]
    async fn cache_full_once_first_clone_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let (fake, gate) = FakeVcs::gated();
        let (manager, _vcs) = manager_with(dir.path(), 1, fake);

        let a = manager.clone_repository(URL, None, CacheStrategy::Shared).await.unwrap();
        assert_eq!(a.status, CloneRequestStatus::Pending);

        let err = manager
            .clone_repository("https://github.com/acme/gadgets", None, CacheStrategy::Shared)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::CacheFull { cached: 1, max: 1 }));
        assert_eq!(manager.list_repositories().await.unwrap().len(), 1);

        gate.add_permits(1);
        manager.wait_for_clone(&a.path).await.unwrap();
    }

    #[tokio::test]
    async fn low_disk_space_refuses_clone_without_touching_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_for(dir.path(), 10);
        config.cache.min_free_bytes = u64::MAX;
        let manager = RepositoryManager::new(&config, Arc::new(FakeVcs::new())).unwrap();

        let err = manager.clone_repository(URL, None, CacheStrategy::Shared).await.unwrap_err();
        assert_eq!(err.kind(), "insufficient_disk_space");
        assert!(manager.list_repositories().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_clone_is_recorded_and_retried() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeVcs::new();
        fake.fail_clones_of("widgets");
        let (manager, vcs) = manager_with(dir.path(), 10, fake);

        let outcome = clone_and_wait(&manager, URL, None, CacheStrategy::Shared).await;
        let entry = manager.wait_for_clone(&outcome.path).await.unwrap().unwrap();
        assert_eq!(entry.state(), CloneState::Failed);
        assert!(entry.clone_status.error.as_deref().unwrap().contains("not found"));
        assert!(outcome.path.is_dir());

        vcs.fail_clone.lock().unwrap().clear();
        let retry = clone_and_wait(&manager, URL, None, CacheStrategy::Shared).await;
        assert_eq!(retry.status, CloneRequestStatus::Pending);
        let entry = manager.wait_for_clone(&retry.path).await.unwrap().unwrap();
        assert_eq!(entry.state(), CloneState::Complete);
        assert!(entry.clone_status.error.is_none());
    }

    #[tokio::test]
    async fn credentials_never_reach_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _vcs) = manager_with(dir.path(), 10, FakeVcs::new());
        clone_and_wait(&manager, "https://ghp_secret@github.com/acme/widgets", None, CacheStrategy::Shared).await;

        let entries = manager.list_repositories().await.unwrap();
        assert_eq!(entries[0].url, URL);
        let raw = std::fs::read_to_string(manager.cache_root().join("metadata.json")).unwrap();
        assert!(!raw.contains("ghp_secret"));
    }

    #[tokio::test]
    async fn delete_during_clone_aborts_job() {
        let dir = tempfile::tempdir().unwrap();
        let (fake, _gate) = FakeVcs::gated();
        let (manager, vcs) = manager_with(dir.path(), 10, fake);

        let outcome = manager.clone_repository(URL, None, CacheStrategy::Shared).await.unwrap();
        // Let the job reach the gate.
        tokio::time::sleep(Duration::from_millis(50)).await;
        std::fs::create_dir_all(&outcome.path).unwrap();

        let report = manager.delete_repository(URL).await.unwrap();
        assert_eq!(report.deleted_paths, vec![outcome.path.clone()]);
        assert!(manager.list_repositories().await.unwrap().is_empty());
        assert!(!outcome.path.exists());
        assert_eq!(vcs.clones.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn refresh_reports() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, vcs) = manager_with(dir.path(), 10, FakeVcs::new());
        let path = clone_and_wait(&manager, URL, None, CacheStrategy::Shared).await.path;

        match manager.refresh_repository(&path).await.unwrap() {
            RefreshReport::Success { commit } => assert_eq!(commit.len(), 40),
            other => panic!("unexpected report: {other:?}"),
        }

        vcs.fail_pull.store(true, Ordering::SeqCst);
        assert!(matches!(
            manager.refresh_repository(&path).await.unwrap(),
            RefreshReport::Error { .. }
        ));

        let err = manager
            .refresh_repository(&manager.cache_root().join("github/acme/none-00000000"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn refresh_during_clone_is_a_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let (fake, gate) = FakeVcs::gated();
        let (manager, _vcs) = manager_with(dir.path(), 10, fake);
        let outcome = manager.clone_repository(URL, None, CacheStrategy::Shared).await.unwrap();

        let err = manager.refresh_repository(&outcome.path).await.unwrap_err();
        assert!(matches!(err, CacheError::CloneInProgress(_)));

        gate.add_permits(1);
        manager.wait_for_clone(&outcome.path).await.unwrap();
    }

    #[tokio::test]
    async fn local_directories_are_snapshotted() {
        let dir = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("notes.txt"), "hello").unwrap();
        let (manager, vcs) = manager_with(dir.path(), 10, FakeVcs::new());

        let source_str = source.path().display().to_string();
        let outcome = clone_and_wait(&manager, &source_str, None, CacheStrategy::Shared).await;
        assert!(outcome.path.starts_with(manager.cache_root().join("local")));
        assert_eq!(std::fs::read_to_string(outcome.path.join("notes.txt")).unwrap(), "hello");
        assert_eq!(vcs.clones.load(Ordering::SeqCst), 0);

        assert_eq!(
            manager.refresh_repository(&outcome.path).await.unwrap(),
            RefreshReport::NotARepository
        );
        assert!(manager.last_activity(&outcome.path).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn missing_local_source_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _vcs) = manager_with(dir.path(), 10, FakeVcs::new());
        let err = manager
            .clone_repository("/definitely/not/a/source/dir", None, CacheStrategy::Shared)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_url");
    }

    #[tokio::test]
    async fn handles_are_shared_and_dropped_on_delete() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _vcs) = manager_with(dir.path(), 10, FakeVcs::new());
        let path = clone_and_wait(&manager, URL, None, CacheStrategy::Shared).await.path;

        let a = manager.get_repository(&path).await.unwrap();
        let b = manager.get_repository(&path).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.url(), URL);

        manager.delete_repository(&path.display().to_string()).await.unwrap();
        assert!(lock(&manager.handles).is_empty());
        assert_eq!(manager.get_repository(&path).await.unwrap_err().kind(), "not_found");
    }

    #[tokio::test]
    async fn recover_fails_interrupted_and_drops_vanished() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _vcs) = manager_with(dir.path(), 10, FakeVcs::new());
        let root = manager.cache_root().to_path_buf();

        let interrupted = root.join("github/acme/half-11111111");
        std::fs::create_dir_all(&interrupted).unwrap();
        let vanished = root.join("github/acme/gone-22222222");
        let now = Utc::now();
        let mut entries = super::super::metadata::Entries::new();
        let mut half = CacheEntry::new_pending(interrupted.clone(), URL.into(), CacheStrategy::Shared, None, now);
        half.clone_status.mark_cloning(now);
        entries.insert(entry_key(&interrupted), half);
        entries.insert(
            entry_key(&vanished),
            CacheEntry::new_pending(vanished.clone(), URL.into(), CacheStrategy::Shared, None, now),
        );
        manager.store.write(entries).await.unwrap();

        let summary = manager.recover().await.unwrap();
        assert_eq!(summary, RecoverySummary { interrupted: 1, dropped: 1 });

        let remaining = manager.list_repositories().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].state(), CloneState::Failed);
    }

    #[tokio::test]
    async fn listing_filters_and_annotates() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeVcs::new();
        fake.fail_clones_of("broken");
        let (manager, _vcs) = manager_with(dir.path(), 10, fake);
        clone_and_wait(&manager, URL, None, CacheStrategy::Shared).await;
        clone_and_wait(&manager, "https://github.com/acme/broken", None, CacheStrategy::Shared).await;

        let all = manager.list_cached_repositories(&ListFilter::default()).await.unwrap();
        assert_eq!(all.total_cached, 2);
        assert_eq!(all.max_cached_repos, 10);
        assert_eq!(all.cache_dir, manager.cache_root());

        let failed = manager
            .list_cached_repositories(&ListFilter { url: None, status: Some(CloneState::Failed) })
            .await
            .unwrap();
        assert_eq!(failed.repositories.len(), 1);
        assert!(failed.repositories[0].entry.url.ends_with("broken"));
        assert_eq!(failed.total_cached, 2);

        let widgets = manager
            .list_cached_repositories(&ListFilter { url: Some("widgets".into()), status: None })
            .await
            .unwrap();
        assert_eq!(widgets.repositories.len(), 1);
        assert!(widgets.repositories[0].entry.size_bytes > 0);
    }

    #[tokio::test]
    async fn start_auto_refresh_schedules_complete_entries() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _vcs) = manager_with(dir.path(), 10, FakeVcs::new());
        let path = clone_and_wait(&manager, URL, None, CacheStrategy::Shared).await.path;

        manager.start_auto_refresh().await.unwrap();
        let status = manager.get_auto_refresh_status();
        assert!(status.enabled);
        assert!(status.running);
        assert_eq!(status.scheduled_count, 1);
        assert!(manager.scheduler.next_refresh_at(&path).is_some());

        manager.stop_auto_refresh().await;
        assert!(!manager.get_auto_refresh_status().running);
    }

    #[tokio::test]
    async fn new_branch_of_cached_repository_bypasses_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _vcs) = manager_with(dir.path(), 2, FakeVcs::new());
        let gadgets = "https://github.com/acme/gadgets";

        clone_and_wait(&manager, URL, Some("main"), CacheStrategy::PerBranch).await;
        clone_and_wait(&manager, gadgets, Some("main"), CacheStrategy::PerBranch).await;

        let dev = clone_and_wait(&manager, URL, Some("dev"), CacheStrategy::PerBranch).await;
        assert_eq!(dev.status, CloneRequestStatus::Pending);
        assert_eq!(manager.list_repositories().await.unwrap().len(), 3);

        let err = manager
            .clone_repository("https://github.com/acme/sprockets", None, CacheStrategy::Shared)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::CacheFull { cached: 2, max: 2 }));
    }

    #[tokio::test]
    async fn scheduler_picks_up_clones_from_another_process() {
        let dir = tempfile::tempdir().unwrap();
        let (serve, _serve_vcs) = manager_with(dir.path(), 10, FakeVcs::new());
        let (cli, _cli_vcs) = manager_with(dir.path(), 10, FakeVcs::new());

        serve.start_auto_refresh().await.unwrap();
        assert_eq!(serve.get_auto_refresh_status().scheduled_count, 0);

        let path = clone_and_wait(&cli, URL, None, CacheStrategy::Shared).await.path;
        serve.scheduler.sync_tracked().await.unwrap();
        assert_eq!(serve.get_auto_refresh_status().scheduled_count, 1);
        assert!(serve.scheduler.next_refresh_at(&path).is_some());

        serve.stop_auto_refresh().await;
    }

    #[tokio::test]
    async fn local_source_is_deleted_by_its_path() {
        let dir = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("notes.txt"), "hello").unwrap();
        let (manager, _vcs) = manager_with(dir.path(), 10, FakeVcs::new());

        let source_str = source.path().display().to_string();
        let outcome = clone_and_wait(&manager, &source_str, None, CacheStrategy::Shared).await;

        let via_file_url = manager
            .clone_repository(&format!("file://{source_str}"), None, CacheStrategy::Shared)
            .await
            .unwrap();
        assert_eq!(via_file_url.status, CloneRequestStatus::AlreadyCloned);
        assert_eq!(via_file_url.path, outcome.path);

        let report = manager.delete_repository(&source_str).await.unwrap();
        assert_eq!(report.deleted_paths, vec![outcome.path.clone()]);
        assert!(!outcome.path.exists());
        assert!(source.path().join("notes.txt").exists());
        assert!(manager.list_repositories().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reschedule_follows_last_commit_time() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, vcs) = manager_with(dir.path(), 10, FakeVcs::new());
        let path = clone_and_wait(&manager, URL, None, CacheStrategy::Shared).await.path;
        let settings = manager.scheduler.settings().clone();

        let recent = Utc::now() - chrono::Duration::hours(1);
        vcs.set_commit_time(&path, recent);
        assert_eq!(manager.last_activity(&path).await.unwrap(), Some(recent));

        let before = tokio::time::Instant::now();
        manager.scheduler.schedule(&path).await;
        let due = manager.scheduler.next_refresh_at(&path).unwrap();
        assert!(due >= before + settings.active_interval);
        assert!(due < before + settings.inactive_interval);

        vcs.set_commit_time(&path, Utc::now() - chrono::Duration::days(30));
        let before = tokio::time::Instant::now();
        manager.scheduler.schedule(&path).await;
        let due = manager.scheduler.next_refresh_at(&path).unwrap();
        assert!(due >= before + settings.inactive_interval);
    }

    #[tokio::test]
    async fn busy_worktree_blocks_refresh_and_switch() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, vcs) = manager_with(dir.path(), 10, FakeVcs::new());
        let path = clone_and_wait(&manager, URL, Some("main"), CacheStrategy::Shared).await.path;

        {
            let _held = PathClaim::acquire(&manager.busy, &path).unwrap();
            let err = manager.refresh_repository(&path).await.unwrap_err();
            assert!(matches!(err, CacheError::WorktreeBusy(_)));

            let switch = manager.clone_repository(URL, Some("develop"), CacheStrategy::Shared).await.unwrap();
            assert_eq!(switch.status, CloneRequestStatus::Cloning);
            assert_eq!(vcs.pulls.load(Ordering::SeqCst), 0);
            assert_eq!(vcs.switches.load(Ordering::SeqCst), 0);
        }

        let entry = manager.wait_for_clone(&path).await.unwrap().unwrap();
        assert_eq!(entry.state(), CloneState::Complete);
        assert_eq!(entry.current_branch.as_deref(), Some("main"));
        assert!(matches!(
            manager.refresh_repository(&path).await.unwrap(),
            RefreshReport::Success { .. }
        ));
    }

    #[tokio::test]
    async fn handles_evaluate_ignore_rules() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _vcs) = manager_with(dir.path(), 10, FakeVcs::new());
        let path = clone_and_wait(&manager, URL, None, CacheStrategy::Shared).await.path;
        std::fs::write(path.join(".gitignore"), "*.log\n").unwrap();

        let handle = manager.get_repository(&path).await.unwrap();
        assert_eq!(handle.path(), path.as_path());
        assert!(handle.is_ignored(Path::new("build/out.log")));
        assert!(!handle.is_ignored(Path::new("README.md")));
    }
}
