//! Live handle over a cached working tree.
//!
//! Handles are created lazily by the manager and answer read-side questions
//! about the checkout, currently ignore-pattern evaluation against the
//! repository's top-level `.gitignore`.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use tracing::{debug, warn};

const ALWAYS_IGNORED: &[&str] = &[".git", ".git/**"];

#[derive(Debug)]
pub struct RepoHandle {
    cache_path: PathBuf,
    url: String,
    rules: Mutex<Option<IgnoreRules>>,
}

#[derive(Debug)]
struct IgnoreRules {
    /// mtime of `.gitignore` when the rules were built; `None` if absent.
    source_mtime: Option<SystemTime>,
    /// Patterns matching a path or anything below it.
    any: GlobSet,
    /// Trailing-slash patterns: match the path itself only when it is a
    /// directory.
    dirs: GlobSet,
}

impl RepoHandle {
    pub fn new(cache_path: PathBuf, url: String) -> Self {
        Self {
            cache_path,
            url,
            rules: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.cache_path
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether `path` (relative to the checkout, or absolute inside it) is
    /// excluded by the repository's ignore rules.  Paths outside the
    /// checkout are never ignored.
    pub fn is_ignored(&self, path: &Path) -> bool {
        let relative = if path.is_absolute() {
            match path.strip_prefix(&self.cache_path) {
                Ok(rel) => rel,
                Err(_) => return false,
            }
        } else {
            path
        };
        let candidate = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if candidate.is_empty() {
            return false;
        }

        let gitignore = self.cache_path.join(".gitignore");
        let mtime = std::fs::metadata(&gitignore)
            .and_then(|m| m.modified())
            .ok();

        let mut guard = match self.rules.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let stale = match guard.as_ref() {
            Some(rules) => rules.source_mtime != mtime,
            None => true,
        };
        if stale {
            debug!(path = %self.cache_path.display(), "loading ignore rules");
            *guard = Some(IgnoreRules::load(&gitignore, mtime));
        }
        let Some(rules) = guard.as_ref() else {
            return false;
        };

        if rules.any.is_match(&candidate) {
            return true;
        }
        rules.dirs.is_match(&candidate) && self.cache_path.join(relative).is_dir()
    }
}

impl IgnoreRules {
    fn load(gitignore: &Path, mtime: Option<SystemTime>) -> Self {
        let contents = if mtime.is_some() {
            match std::fs::read_to_string(gitignore) {
                Ok(c) => c,
                Err(e) => {
                    warn!(path = %gitignore.display(), error = %e, "failed to read .gitignore");
                    String::new()
                }
            }
        } else {
            String::new()
        };

        let mut any = GlobSetBuilder::new();
        let mut dirs = GlobSetBuilder::new();
        for pattern in ALWAYS_IGNORED {
            add_glob(&mut any, pattern);
        }

        for line in contents.lines() {
            let line = line.trim_end();
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }
            if line.starts_with('!') {
                debug!(pattern = line, "negated ignore patterns are not supported; skipping");
                continue;
            }

            let dir_only = line.ends_with('/');
            let body = line.trim_end_matches('/');
            let anchored = body.contains('/');
            let body = body.trim_start_matches('/');
            if body.is_empty() {
                continue;
            }
            let base = if anchored {
                body.to_string()
            } else {
                format!("**/{body}")
            };

            add_glob(&mut any, &format!("{base}/**"));
            if dir_only {
                add_glob(&mut dirs, &base);
            } else {
                add_glob(&mut any, &base);
            }
        }

        Self {
            source_mtime: mtime,
            any: build_set(any),
            dirs: build_set(dirs),
        }
    }
}

fn add_glob(builder: &mut GlobSetBuilder, pattern: &str) {
    match GlobBuilder::new(pattern).literal_separator(true).build() {
        Ok(glob) => {
            builder.add(glob);
        }
        Err(e) => debug!(pattern, error = %e, "skipping invalid ignore pattern"),
    }
}

fn build_set(builder: GlobSetBuilder) -> GlobSet {
    builder.build().unwrap_or_else(|e| {
        warn!(error = %e, "failed to compile ignore patterns");
        GlobSet::empty()
    })
}
