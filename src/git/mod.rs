//! Version-control collaborator.
//!
//! The cache manager talks to git only through [`VersionControl`], which the
//! production [`GitCli`] implements by shelling out to the `git` binary
//! (see [`commands`]).  Working-tree filesystem helpers live in
//! [`worktree`].

pub mod commands;
#[cfg(test)]
pub mod fake;
pub mod worktree;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use worktree::{available_space, copy_dir, is_git_worktree, latest_mtime, remove_repo, repo_size_bytes};

/// Operations the cache needs from a version-control system.
///
/// `fetch_url` may embed credentials and must not be persisted;
/// `canonical_url` is the credential-free form.
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Create a working tree of `fetch_url` at `dest`, checking out `branch`
    /// (or the remote default).
    async fn clone_repo(
        &self,
        fetch_url: &str,
        canonical_url: &str,
        dest: &Path,
        branch: Option<&str>,
    ) -> Result<()>;

    /// Check out `branch` in an existing working tree, fetching it first.
    async fn switch_branch(&self, repo: &Path, fetch_url: &str, branch: &str) -> Result<()>;

    /// Bring the checked-out branch up to date and return the new HEAD
    /// commit.
    async fn pull(&self, repo: &Path, fetch_url: &str, branch: Option<&str>) -> Result<String>;

    async fn current_branch(&self, repo: &Path) -> Result<Option<String>>;

    /// Commit time of HEAD; `None` for an empty history.
    async fn last_commit_time(&self, repo: &Path) -> Result<Option<DateTime<Utc>>>;
}

/// [`VersionControl`] backed by the system `git` binary.
#[derive(Debug, Clone)]
pub struct GitCli {
    timeout: Duration,
}

impl GitCli {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl VersionControl for GitCli {
    async fn clone_repo(
        &self,
        fetch_url: &str,
        canonical_url: &str,
        dest: &Path,
        branch: Option<&str>,
    ) -> Result<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create parent directory: {}", parent.display()))?;
        }
        commands::git_clone(fetch_url, dest, branch, self.timeout).await?;
        if fetch_url != canonical_url {
            // Keep the token out of .git/config.
            commands::git_set_remote_url(dest, "origin", canonical_url, self.timeout).await?;
        }
        Ok(())
    }

    async fn switch_branch(&self, repo: &Path, fetch_url: &str, branch: &str) -> Result<()> {
        commands::git_fetch_branch(repo, fetch_url, branch, self.timeout).await?;
        commands::git_checkout_tracking(repo, branch, self.timeout).await
    }

    async fn pull(&self, repo: &Path, fetch_url: &str, branch: Option<&str>) -> Result<String> {
        let branch = match branch {
            Some(b) => b.to_string(),
            None => commands::git_current_branch(repo, self.timeout)
                .await?
                .context("cannot refresh a detached HEAD without a branch")?,
        };
        commands::git_pull(repo, fetch_url, &branch, self.timeout).await?;
        commands::git_head_commit(repo, self.timeout).await
    }

    async fn current_branch(&self, repo: &Path) -> Result<Option<String>> {
        commands::git_current_branch(repo, self.timeout).await
    }

    async fn last_commit_time(&self, repo: &Path) -> Result<Option<DateTime<Utc>>> {
        commands::git_last_commit_time(repo, self.timeout).await
    }
}
