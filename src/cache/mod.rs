//! Local repository cache.
//!
//! [`RepositoryManager`] owns the on-disk clones under the cache root, the
//! persisted [`metadata`] describing them, and the background clone jobs that
//! populate them.

pub mod entry;
pub mod handle;
pub mod manager;
pub mod metadata;
pub mod path;
pub mod validation;

pub use entry::{CacheStrategy, CloneState};
pub use manager::{ListFilter, RepositoryManager};
