//! Persisted cache metadata.
//!
//! One JSON object keyed by cache path, stored under the cache root.  Every
//! read-modify-write cycle runs under an in-process async mutex plus an
//! advisory `fs2` lock on a sibling lock file, so a `serve` process and CLI
//! invocations against the same root never interleave writes.  Writes go to
//! a temp file in the same directory and are renamed into place.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::entry::CacheEntry;

/// Cache path (as a string) -> entry.
pub type Entries = BTreeMap<String, CacheEntry>;

/// Key under which the entry for `path` is stored.
pub fn entry_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[derive(Debug)]
pub struct MetadataStore {
    path: PathBuf,
    lock_path: PathBuf,
    guard: Mutex<()>,
}

impl MetadataStore {
    pub fn new(path: PathBuf) -> Self {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "metadata.json".to_string());
        let lock_path = path.with_file_name(format!(".{file_name}.lock"));
        Self {
            path,
            lock_path,
            guard: Mutex::new(()),
        }
    }

    /// Snapshot of every entry.  A missing or unreadable file is an empty
    /// cache.
    pub async fn read(&self) -> Result<Entries> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || load_entries(&path))
            .await
            .context("metadata read task panicked")?
    }

    pub async fn get(&self, cache_path: &Path) -> Result<Option<CacheEntry>> {
        let mut entries = self.read().await?;
        Ok(entries.remove(&entry_key(cache_path)))
    }

    /// Replace the whole mapping.
    #[cfg(test)]
    pub async fn write(&self, entries: Entries) -> Result<()> {
        self.update(move |current| *current = entries).await
    }

    /// Run `f` against the current mapping under the lock and persist the
    /// result if `f` changed anything.
    pub async fn update<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Entries) -> R + Send + 'static,
        R: Send + 'static,
    {
        let _guard = self.guard.lock().await;
        let path = self.path.clone();
        let lock_path = self.lock_path.clone();

        tokio::task::spawn_blocking(move || {
            with_file_lock(&lock_path, || {
                let mut entries = load_entries(&path)?;
                let before = entries.clone();
                let out = f(&mut entries);
                if entries != before {
                    persist_entries(&path, &entries)?;
                    debug!(path = %path.display(), entries = entries.len(), "metadata persisted");
                }
                Ok(out)
            })
        })
        .await
        .context("metadata update task panicked")?
    }

    /// Remove the record for `cache_path`.  Absent records are not an error;
    /// the removed entry (if any) is returned.
    pub async fn remove(&self, cache_path: &Path) -> Result<Option<CacheEntry>> {
        let key = entry_key(cache_path);
        self.update(move |entries| entries.remove(&key)).await
    }
}

// ---------------------------------------------------------------------------
// Blocking helpers
// ---------------------------------------------------------------------------

fn with_file_lock<R>(lock_path: &Path, f: impl FnOnce() -> Result<R>) -> Result<R> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create metadata directory: {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path)
        .with_context(|| format!("failed to open metadata lock: {}", lock_path.display()))?;
    file.lock_exclusive()
        .with_context(|| format!("failed to lock metadata: {}", lock_path.display()))?;

    let result = f();

    if let Err(e) = FileExt::unlock(&file) {
        warn!(path = %lock_path.display(), error = %e, "failed to release metadata lock");
    }
    result
}

fn load_entries(path: &Path) -> Result<Entries> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Entries::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read metadata file: {}", path.display()))
        }
    };
    if contents.trim().is_empty() {
        return Ok(Entries::new());
    }
    match serde_json::from_str(&contents) {
        Ok(entries) => Ok(entries),
        Err(e) => {
            warn!(
                path = %path.display(),
                error = %e,
                "metadata file is corrupt; treating the cache as empty"
            );
            Ok(Entries::new())
        }
    }
}

fn persist_entries(path: &Path, entries: &Entries) -> Result<()> {
    let dir = path
        .parent()
        .context("metadata path has no parent directory")?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create metadata directory: {}", dir.display()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    serde_json::to_writer_pretty(&mut tmp, entries).context("failed to serialize metadata")?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all().context("failed to sync metadata temp file")?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("failed to replace metadata file: {}", path.display()))?;
    Ok(())
}
