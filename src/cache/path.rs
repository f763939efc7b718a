//! Deterministic mapping from (URL, branch, strategy) to a cache directory.
//!
//! Layout under the cache root:
//!
//! ```text
//! github/<owner>/<repo>-<hash>
//! github/<owner>/<repo>-<branch>-<hash>        (per-branch)
//! azure/<org>/<project>/<repo>-<hash>
//! git/<host>/<path...>/<repo>-<hash>
//! local/<dirname>-<hash>
//! ```
//!
//! The hash is the first 8 hex digits of the SHA-256 of the canonical URL
//! (suffixed with `#<branch>` for per-branch entries), which keeps two
//! repositories whose sanitized names collide in distinct directories.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::cache::entry::CacheStrategy;
use crate::cache::validation::validate_branch_name;
use crate::error::CacheError;
use crate::forge::{self, sanitize_segment};

/// Branch segment used for per-branch entries requested without a branch.
pub const DEFAULT_BRANCH_SEGMENT: &str = "default";

const HASH_LEN: usize = 8;

/// Resolve the cache directory for `url`.  Pure: no filesystem access.
pub fn resolve_cache_path(
    root: &Path,
    url: &str,
    branch: Option<&str>,
    strategy: CacheStrategy,
) -> Result<PathBuf, CacheError> {
    if let Some(branch) = branch {
        validate_branch_name(branch)?;
    }

    let location = forge::parse_repo_url(url)?;
    let repo = location.repo_name().to_string();

    let leaf = match strategy {
        CacheStrategy::Shared => format!("{repo}-{}", short_hash(url)),
        CacheStrategy::PerBranch => {
            let branch = branch.unwrap_or(DEFAULT_BRANCH_SEGMENT);
            format!(
                "{repo}-{}-{}",
                sanitize_segment(branch),
                short_hash(&format!("{url}#{branch}"))
            )
        }
    };

    let mut path = root.join(location.provider.namespace());
    if let Some((_, parents)) = location.segments.split_last() {
        for segment in parents {
            path.push(segment);
        }
    }
    path.push(leaf);
    Ok(path)
}

fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(HASH_LEN);
    hex
}
