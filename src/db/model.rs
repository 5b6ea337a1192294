//! Database view models used by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use crate::model::{AttendanceRecord, ChangeKind};
use chrono::{DateTime, Utc};

/// One row of the pending change journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEntry {
    pub id: i64,
    pub record_id: String,
    pub kind: ChangeKind,
    pub attempt: i32,
    pub due_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Everything a flush needs: the journal high-water mark it covers and the
/// records to push.
#[derive(Debug, Clone)]
pub struct PendingSnapshot {
    pub up_to_change_id: i64,
    pub change_count: u64,
    pub records: Vec<AttendanceRecord>,
}

/// Filter for record listings.
#[derive(Debug, Clone, Default)]
pub struct RecordQuery<'a> {
    pub project_id: &'a str,
    pub date: Option<chrono::NaiveDate>,
    pub employee_id: Option<&'a str>,
    pub open_only: bool,
}
