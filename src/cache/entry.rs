//! Cache entry records and their clone-status state machine.
//!
//! A [`CacheEntry`] is one physical clone on disk.  Its [`CloneStatus`] only
//! moves forward (`pending -> cloning -> complete | failed`) with a single
//! exception: a `failed` entry may be reset to `pending` when the clone is
//! retried.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Cache strategy
// ---------------------------------------------------------------------------

/// How a URL maps onto cache entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheStrategy {
    /// One entry per URL; the branch is switched in place.
    #[default]
    Shared,
    /// One entry per (URL, branch).
    PerBranch,
}

impl CacheStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::PerBranch => "per-branch",
        }
    }
}

impl fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "shared" => Ok(Self::Shared),
            "per-branch" | "per_branch" => Ok(Self::PerBranch),
            other => Err(format!(
                "unknown cache strategy '{other}' (expected 'shared' or 'per-branch')"
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Clone status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloneState {
    #[default]
    Pending,
    Cloning,
    Complete,
    Failed,
}

impl CloneState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Cloning => "cloning",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    /// A job is (or should be) working on this entry.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Pending | Self::Cloning)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: CloneState) -> bool {
        use CloneState::*;
        matches!(
            (self, next),
            (Pending, Cloning)
                | (Pending, Failed)
                | (Cloning, Complete)
                | (Cloning, Failed)
                | (Failed, Pending)
                // in-place branch switch re-enters `cloning`
                | (Complete, Cloning)
        )
    }
}

impl fmt::Display for CloneState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CloneState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "cloning" => Ok(Self::Cloning),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown clone state '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneStatus {
    pub state: CloneState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CloneStatus {
    pub fn pending(now: DateTime<Utc>) -> Self {
        Self {
            state: CloneState::Pending,
            started_at: Some(now),
            completed_at: None,
            error: None,
        }
    }

    /// Apply a transition, returning `false` (and leaving `self` untouched)
    /// when it is not allowed from the current state.
    fn advance(&mut self, next: CloneState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        true
    }

    pub fn mark_cloning(&mut self, now: DateTime<Utc>) -> bool {
        if !self.advance(CloneState::Cloning) {
            return false;
        }
        self.started_at = Some(now);
        self.completed_at = None;
        self.error = None;
        true
    }

    pub fn mark_complete(&mut self, now: DateTime<Utc>) -> bool {
        if !self.advance(CloneState::Complete) {
            return false;
        }
        self.completed_at = Some(now);
        self.error = None;
        true
    }

    pub fn mark_failed(&mut self, now: DateTime<Utc>, error: impl Into<String>) -> bool {
        if !self.advance(CloneState::Failed) {
            return false;
        }
        self.completed_at = Some(now);
        self.error = Some(error.into());
        true
    }

    /// `failed -> pending` for a retry.
    pub fn reset_for_retry(&mut self, now: DateTime<Utc>) -> bool {
        if !self.advance(CloneState::Pending) {
            return false;
        }
        self.started_at = Some(now);
        self.completed_at = None;
        self.error = None;
        true
    }
}

// ---------------------------------------------------------------------------
// Repository map status
// ---------------------------------------------------------------------------

/// Status of the content-summary job attached to an entry.  Maintained by an
/// external collaborator; the cache only stores it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoMapStatus {
    #[serde(default = "default_map_state")]
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn default_map_state() -> String {
    "pending".to_string()
}

// ---------------------------------------------------------------------------
// Cache entry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub cache_path: PathBuf,
    /// Canonical URL with credentials stripped.
    pub url: String,
    pub cache_strategy: CacheStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_branch: Option<String>,
    pub clone_status: CloneStatus,
    #[serde(default)]
    pub repo_map_status: RepoMapStatus,
    pub last_access: DateTime<Utc>,
    #[serde(default)]
    pub size_bytes: u64,
}

impl CacheEntry {
    pub fn new_pending(
        cache_path: PathBuf,
        url: String,
        cache_strategy: CacheStrategy,
        branch: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            cache_path,
            url,
            cache_strategy,
            current_branch: branch,
            clone_status: CloneStatus::pending(now),
            repo_map_status: RepoMapStatus {
                state: default_map_state(),
                ..Default::default()
            },
            last_access: now,
            size_bytes: 0,
        }
    }

    pub fn state(&self) -> CloneState {
        self.clone_status.state
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_access = now;
    }
}
