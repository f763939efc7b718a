//! Filesystem helpers for cached working trees.
//!
//! Directory walks are synchronous and run inside `spawn_blocking` so they
//! never stall the runtime.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

// ---------------------------------------------------------------------------
// Remove
// ---------------------------------------------------------------------------

/// Recursively remove the tree at `path`.  A missing path is a no-op.
#[instrument(fields(path = %path.display()))]
pub async fn remove_repo(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {
            debug!("repo directory removed");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("path does not exist; nothing to remove");
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("failed to remove repo directory: {}", path.display())),
    }
}

// ---------------------------------------------------------------------------
// Size
// ---------------------------------------------------------------------------

/// Total size in bytes of the regular files under `path`.
#[instrument(fields(path = %path.display()))]
pub async fn repo_size_bytes(path: &Path) -> Result<u64> {
    let path = path.to_path_buf();
    let size = tokio::task::spawn_blocking(move || dir_size_sync(&path))
        .await
        .context("blocking task panicked")?
        .context("failed to compute repo size")?;

    debug!(size_bytes = size, "computed repo size");
    Ok(size)
}

/// Synchronous recursive directory size computation.  Symlinks are not
/// followed.
pub fn dir_size_sync(dir: &Path) -> Result<u64> {
    let mut total: u64 = 0;

    if !dir.exists() {
        return Ok(0);
    }

    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let entries = match std::fs::read_dir(&current) {
            Ok(e) => e,
            Err(err) => {
                warn!(
                    path = %current.display(),
                    error = %err,
                    "failed to read directory during size computation"
                );
                continue;
            }
        };

        for entry in entries.flatten() {
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if file_type.is_file() {
                total += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }
    }

    Ok(total)
}

// ---------------------------------------------------------------------------
// Inspection
// ---------------------------------------------------------------------------

/// A non-bare git checkout has a `.git` directory (or a `.git` file for
/// linked worktrees).
pub fn is_git_worktree(path: &Path) -> bool {
    path.join(".git").exists()
}

/// Most recent modification time of any regular file under `dir`, skipping
/// `.git`.  `None` when the tree holds no files.
pub async fn latest_mtime(dir: &Path) -> Result<Option<DateTime<Utc>>> {
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || latest_mtime_sync(&dir))
        .await
        .context("blocking task panicked")
}

fn latest_mtime_sync(dir: &Path) -> Option<DateTime<Utc>> {
    let mut newest: Option<SystemTime> = None;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                if entry.file_name() != ".git" {
                    stack.push(entry.path());
                }
            } else if file_type.is_file() {
                if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
                    newest = Some(newest.map_or(modified, |n| n.max(modified)));
                }
            }
        }
    }
    newest.map(DateTime::<Utc>::from)
}

// ---------------------------------------------------------------------------
// Copy
// ---------------------------------------------------------------------------

/// Recursively copy `src` into `dest` (created if missing).  Symlinks are
/// skipped.
#[instrument(fields(src = %src.display(), dest = %dest.display()))]
pub async fn copy_dir(src: &Path, dest: &Path) -> Result<u64> {
    let src = src.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || copy_dir_sync(&src, &dest))
        .await
        .context("blocking task panicked")?
}

fn copy_dir_sync(src: &Path, dest: &Path) -> Result<u64> {
    let mut copied = 0u64;
    let mut stack: Vec<(PathBuf, PathBuf)> = vec![(src.to_path_buf(), dest.to_path_buf())];
    while let Some((from, to)) = stack.pop() {
        std::fs::create_dir_all(&to)
            .with_context(|| format!("failed to create directory: {}", to.display()))?;
        let entries = std::fs::read_dir(&from)
            .with_context(|| format!("failed to read directory: {}", from.display()))?;
        for entry in entries {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let target = to.join(entry.file_name());
            if file_type.is_dir() {
                stack.push((entry.path(), target));
            } else if file_type.is_file() {
                copied += std::fs::copy(entry.path(), &target).with_context(|| {
                    format!("failed to copy {}", entry.path().display())
                })?;
            }
        }
    }
    Ok(copied)
}

// ---------------------------------------------------------------------------
// Free space
// ---------------------------------------------------------------------------

/// Bytes available to unprivileged users on the volume holding `path`.  The
/// nearest existing ancestor is queried when `path` does not exist yet.
pub async fn available_space(path: &Path) -> Result<u64> {
    let mut existing = path.to_path_buf();
    while !existing.exists() {
        if !existing.pop() {
            break;
        }
    }
    tokio::task::spawn_blocking(move || {
        fs2::available_space(&existing)
            .with_context(|| format!("failed to query free space for {}", existing.display()))
    })
    .await
    .context("blocking task panicked")?
}
