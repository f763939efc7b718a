//! In-memory [`VersionControl`] used by manager and scheduler tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;

use super::VersionControl;

#[derive(Debug, Default)]
pub struct FakeVcs {
    pub clones: AtomicUsize,
    pub pulls: AtomicUsize,
    pub switches: AtomicUsize,
    /// Clones of URLs containing any of these substrings fail.
    pub fail_clone: Mutex<Vec<String>>,
    pub fail_pull: AtomicBool,
    /// When set, each clone waits for one permit before finishing.
    pub gate: Option<Arc<Semaphore>>,
    pub commit_times: Mutex<HashMap<PathBuf, DateTime<Utc>>>,
    branches: Mutex<HashMap<PathBuf, String>>,
}

impl FakeVcs {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fake whose clones block until the returned semaphore gets permits.
    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let fake = Self {
            gate: Some(Arc::clone(&gate)),
            ..Self::default()
        };
        (fake, gate)
    }

    pub fn fail_clones_of(&self, needle: &str) {
        self.fail_clone.lock().unwrap().push(needle.to_string());
    }

    pub fn set_commit_time(&self, repo: &Path, at: DateTime<Utc>) {
        self.commit_times.lock().unwrap().insert(repo.to_path_buf(), at);
    }
}

#[async_trait]
impl VersionControl for FakeVcs {
    async fn clone_repo(
        &self,
        fetch_url: &str,
        _canonical_url: &str,
        dest: &Path,
        branch: Option<&str>,
    ) -> Result<()> {
        if let Some(gate) = &self.gate {
            gate.acquire().await?.forget();
        }
        self.clones.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .fail_clone
            .lock()
            .unwrap()
            .iter()
            .any(|needle| fetch_url.contains(needle.as_str()));
        if failing {
            bail!("fatal: repository '{fetch_url}' not found");
        }
        std::fs::create_dir_all(dest.join(".git"))?;
        std::fs::write(dest.join("README.md"), "fake checkout\n")?;
        self.branches
            .lock()
            .unwrap()
            .insert(dest.to_path_buf(), branch.unwrap_or("main").to_string());
        Ok(())
    }

    async fn switch_branch(&self, repo: &Path, _fetch_url: &str, branch: &str) -> Result<()> {
        self.switches.fetch_add(1, Ordering::SeqCst);
        if branch == "missing" {
            bail!("fatal: couldn't find remote ref {branch}");
        }
        self.branches
            .lock()
            .unwrap()
            .insert(repo.to_path_buf(), branch.to_string());
        Ok(())
    }

    async fn pull(&self, _repo: &Path, _fetch_url: &str, _branch: Option<&str>) -> Result<String> {
        let n = self.pulls.fetch_add(1, Ordering::SeqCst);
        if self.fail_pull.load(Ordering::SeqCst) {
            bail!("fatal: unable to access remote");
        }
        Ok(format!("{:040x}", n + 1))
    }

    async fn current_branch(&self, repo: &Path) -> Result<Option<String>> {
        Ok(self.branches.lock().unwrap().get(repo).cloned())
    }

    async fn last_commit_time(&self, repo: &Path) -> Result<Option<DateTime<Utc>>> {
        Ok(self.commit_times.lock().unwrap().get(repo).copied())
    }
}
