//! Background re-synchronisation of cached repositories.
//!
//! [`AutoRefreshScheduler`] keeps a per-repository due-table, classifies
//! repositories as active or inactive via [`activity::classify`], and runs
//! due refreshes through a bounded worker pool that calls back into a
//! [`RefreshTarget`] (the repository manager).

pub mod activity;
pub mod scheduler;

use serde::Serialize;

pub use scheduler::{AutoRefreshScheduler, AutoRefreshStatus, RefreshTarget, SchedulerSettings};

/// Outcome of refreshing one cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RefreshReport {
    Success { commit: String },
    /// The entry is a plain directory snapshot with nothing to pull.
    NotARepository,
    Error { error: String },
}
