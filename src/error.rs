//! Typed failures reported by the repository manager and the refresh
//! scheduler.
//!
//! Internal helpers work with [`anyhow::Result`]; anything they raise that is
//! not mapped to a specific variant surfaces as [`CacheError::Unexpected`].

use std::path::PathBuf;

/// Failure of a cache operation, classified so callers can map it to a
/// response (bad request, not found, conflict, insufficient storage, ...).
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Repository identifier cannot be empty")]
    EmptyIdentifier,

    #[error("No cached entries found for repository: {0}")]
    NotFound(String),

    #[error("Invalid cache path: {0}")]
    InvalidPath(String),

    #[error("Invalid branch name '{0}': cannot contain path separators or parent directory references")]
    InvalidBranch(String),

    #[error("Invalid repository URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Repository cache is full ({cached}/{max} repositories cached)")]
    CacheFull { cached: usize, max: usize },

    #[error(
        "Insufficient disk space: {:.2} GB available, minimum {:.2} GB required",
        gib(.available),
        gib(.required)
    )]
    InsufficientDiskSpace { available: u64, required: u64 },

    #[error("Clone operation already in progress for {}", .0.display())]
    CloneInProgress(PathBuf),

    #[error("Another pull or branch switch is running in {}", .0.display())]
    WorktreeBusy(PathBuf),

    #[error("version control operation failed: {0}")]
    Provider(String),

    #[error("Failed to delete all cache entries for repository {identifier}: {}", .failures.join("; "))]
    DeleteFailed {
        identifier: String,
        failures: Vec<String>,
    },

    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl CacheError {
    /// Stable snake_case label for the error class.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EmptyIdentifier => "empty_identifier",
            Self::NotFound(_) => "not_found",
            Self::InvalidPath(_) => "invalid_path",
            Self::InvalidBranch(_) => "invalid_branch",
            Self::InvalidUrl { .. } => "invalid_url",
            Self::CacheFull { .. } => "cache_full",
            Self::InsufficientDiskSpace { .. } => "insufficient_disk_space",
            Self::CloneInProgress(_) => "clone_in_progress",
            Self::WorktreeBusy(_) => "worktree_busy",
            Self::Provider(_) => "provider_error",
            Self::DeleteFailed { .. } => "delete_failed",
            Self::Unexpected(_) => "unexpected_error",
        }
    }

    /// Caller mistakes that must not be retried as-is.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::EmptyIdentifier
                | Self::InvalidPath(_)
                | Self::InvalidBranch(_)
                | Self::InvalidUrl { .. }
        )
    }
}

fn gib(bytes: &u64) -> f64 {
    *bytes as f64 / (1024.0 * 1024.0 * 1024.0)
}
