//! Input checks applied before anything touches the filesystem.

use std::path::{Component, Path, PathBuf};

use crate::error::CacheError;
use crate::forge::CACHE_NAMESPACES;

/// Reject branch names that could escape their path segment.
pub fn validate_branch_name(branch: &str) -> Result<(), CacheError> {
    let trimmed = branch.trim();
    if trimmed.is_empty()
        || trimmed.contains("..")
        || trimmed.contains('/')
        || trimmed.contains('\\')
        || trimmed.contains('\0')
    {
        return Err(CacheError::InvalidBranch(branch.to_string()));
    }
    Ok(())
}

/// Check that `candidate` may be deleted as a cache entry directory.
///
/// The path must sit strictly inside `root` (after resolving `..` and, when
/// the path exists, symlinks) and must look like a repository cache: either
/// it contains a `.git` directory or one of its components between the root
/// and the leaf is a provider namespace.  Returns the normalized path.
pub fn validate_deletable_path(root: &Path, candidate: &Path) -> Result<PathBuf, CacheError> {
    let root = resolve(root);
    let path = resolve(candidate);

    let relative = match path.strip_prefix(&root) {
        Ok(rel) if !rel.as_os_str().is_empty() => rel.to_path_buf(),
        _ => {
            return Err(CacheError::InvalidPath(
                "not within repository cache directory".to_string(),
            ))
        }
    };

    let has_marker = path.join(".git").is_dir();
    let component_count = relative.components().count();
    let under_namespace = relative
        .components()
        .take(component_count.saturating_sub(1))
        .any(|c| matches!(c, Component::Normal(name) if CACHE_NAMESPACES.iter().any(|ns| name == *ns)));

    if !has_marker && !under_namespace {
        return Err(CacheError::InvalidPath(
            "directory does not appear to be a repository cache".to_string(),
        ));
    }

    Ok(path)
}

/// Absolute, `..`-free form of `path`, with symlinks resolved when it exists.
fn resolve(path: &Path) -> PathBuf {
    if let Ok(canonical) = std::fs::canonicalize(path) {
        return canonical;
    }
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let normalized = normalize_lexically(&absolute);

    // The leaf may be gone while an ancestor (typically the root) is a
    // symlink; canonicalize the longest existing prefix.
    let mut existing = normalized.as_path();
    let mut tail = Vec::new();
    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                existing = parent;
            }
            _ => return normalized,
        }
    }
    let mut out = std::fs::canonicalize(existing).unwrap_or_else(|_| existing.to_path_buf());
    for name in tail.into_iter().rev() {
        out.push(name);
    }
    out
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_names() {
        assert!(validate_branch_name("main").is_ok());
        assert!(validate_branch_name("release-1.2").is_ok());
        assert!(validate_branch_name("../../etc").is_err());
        assert!(validate_branch_name("feature/login").is_err());
        assert!(validate_branch_name("win\\path").is_err());
        assert!(validate_branch_name("  ").is_err());
    }

    #[test]
    fn rejects_paths_outside_root_even_if_they_exist() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(outside.path().join("github/o/r/.git")).unwrap();

        let err = validate_deletable_path(root.path(), &outside.path().join("github/o/r")).unwrap_err();
        assert_eq!(err.to_string(), "Invalid cache path: not within repository cache directory");

        let err = validate_deletable_path(root.path(), Path::new("/definitely/not/here")).unwrap_err();
        assert_eq!(err.kind(), "invalid_path");
    }

    #[test]
    fn rejects_traversal_out_of_root() {
        let root = tempfile::tempdir().unwrap();
        let sneaky = root.path().join("github/../../etc");
        assert!(validate_deletable_path(root.path(), &sneaky).is_err());
    }

    #[test]
    fn rejects_root_itself() {
        let root = tempfile::tempdir().unwrap();
        assert!(validate_deletable_path(root.path(), root.path()).is_err());
    }

    #[test]
    fn rejects_unmarked_directories() {
        let root = tempfile::tempdir().unwrap();
        let plain = root.path().join("scratch/thing");
        std::fs::create_dir_all(&plain).unwrap();
        let err = validate_deletable_path(root.path(), &plain).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid cache path: directory does not appear to be a repository cache"
        );

        // A namespace name as the leaf alone is not enough.
        let ns_leaf = root.path().join("github");
        std::fs::create_dir_all(&ns_leaf).unwrap();
        assert!(validate_deletable_path(root.path(), &ns_leaf).is_err());
    }

    #[test]
    fn accepts_namespace_ancestor_without_git_marker() {
        let root = tempfile::tempdir().unwrap();
        let entry = root.path().join("github/o/r-0123abcd");
        std::fs::create_dir_all(&entry).unwrap();
        let resolved = validate_deletable_path(root.path(), &entry).unwrap();
        assert!(resolved.ends_with("github/o/r-0123abcd"));
    }

    #[test]
    fn accepts_git_marker_without_namespace() {
        let root = tempfile::tempdir().unwrap();
        let entry = root.path().join("misc/checkout");
        std::fs::create_dir_all(entry.join(".git")).unwrap();
        assert!(validate_deletable_path(root.path(), &entry).is_ok());
    }
}
