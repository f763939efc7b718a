//! Active/inactive classification driving the refresh cadence.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Activity {
    Active,
    Inactive,
}

/// A repository is active when its last activity is strictly less than
/// `window` before `now`.  Activity exactly `window` ago is inactive; no
/// known activity is inactive; timestamps in the future count as active.
pub fn classify(last: Option<DateTime<Utc>>, now: DateTime<Utc>, window: Duration) -> Activity {
    let Some(last) = last else {
        return Activity::Inactive;
    };
    let Ok(window) = chrono::Duration::from_std(window) else {
        // A window too large to represent covers all of history.
        return Activity::Active;
    };
    if now.signed_duration_since(last) < window {
        Activity::Active
    } else {
        Activity::Inactive
    }
}
