use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Whether a record still waits for its check-out.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RecordStatus {
    Open,
    Closed,
}

/// Whether the latest local state of a record has reached the remote.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SyncStatus {
    PendingSync,
    Synced,
}

impl SyncStatus {
    pub fn from_flag(synced: bool) -> Self {
        if synced {
            SyncStatus::Synced
        } else {
            SyncStatus::PendingSync
        }
    }
}

/// Kind of local mutation recorded in the pending change journal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChangeKind {
    CheckIn,
    CheckOut,
    ResolveException,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::CheckIn => "check_in",
            ChangeKind::CheckOut => "check_out",
            ChangeKind::ResolveException => "resolve_exception",
        }
    }

    pub fn parse_kind(s: &str) -> Option<Self> {
        match s {
            "check_in" => Some(ChangeKind::CheckIn),
            "check_out" => Some(ChangeKind::CheckOut),
            "resolve_exception" => Some(ChangeKind::ResolveException),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub id: String,
    pub employee_id: String,
    pub employee_name: String,
    pub project_id: String,
    pub location: String,
    pub date: NaiveDate,
    pub check_in_time: DateTime<Utc>,
    pub check_out_time: Option<DateTime<Utc>>,
    pub sync_status: SyncStatus,
}

impl AttendanceRecord {
    pub fn status(&self) -> RecordStatus {
        if self.check_out_time.is_some() {
            RecordStatus::Closed
        } else {
            RecordStatus::Open
        }
    }

    pub fn is_open(&self) -> bool {
        self.status() == RecordStatus::Open
    }

    pub fn is_synced(&self) -> bool {
        self.sync_status == SyncStatus::Synced
    }
}

/// A check-in that never got its check-out. Never stored; see
/// [`crate::exceptions::derive_exceptions`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceException {
    /// Same value as the id of the underlying record.
    pub id: String,
    pub employee_id: String,
    pub employee_name: String,
    pub check_in_time: DateTime<Utc>,
    pub project_id: String,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceStats {
    pub total_check_ins: usize,
    pub total_check_outs: usize,
    pub total_synced: usize,
    pub total_not_synced: usize,
}

impl AttendanceStats {
    pub fn from_records(records: &[AttendanceRecord]) -> Self {
        let total_synced = records.iter().filter(|r| r.is_synced()).count();
        Self {
            total_check_ins: records.len(),
            total_check_outs: records.iter().filter(|r| !r.is_open()).count(),
            total_synced,
            total_not_synced: records.len() - total_synced,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub pending_changes: u64,
    pub last_sync: Option<DateTime<Utc>>,
    pub is_online: bool,
    pub is_syncing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Supervisor {
    pub id: String,
    pub name: String,
    pub email: String,
    pub project_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    pub location: String,
    pub employee_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Employee {
    pub id: String,
    pub name: String,
    pub position: String,
    pub face_enrolled: bool,
}
