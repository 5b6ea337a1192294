//! Database module: view models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: view models returned by repositories.
//! - `repo`: SQL-only functions that map rows into domain entities.
//!
//! External modules should import from `site_attendance::db`; the repository
//! API and commonly used view models are re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{OutboxEntry, PendingSnapshot, RecordQuery};

/// Key-value keys that replace browser storage.
pub mod keys {
    pub const USER: &str = "user";
    pub const CURRENT_PROJECT_ID: &str = "currentProjectId";
    pub const PENDING_CHANGES: &str = "offlinePendingChanges";
    pub const LAST_SYNC_TIME: &str = "lastSyncTime";
}
