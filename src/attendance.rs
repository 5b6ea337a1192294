//! Attendance store scoped to the active project.
use crate::db::{self, Pool, RecordQuery};
use crate::exceptions::derive_exceptions;
use crate::model::{
    AttendanceException, AttendanceRecord, AttendanceStats, ChangeKind, Project, SyncStatus,
};
use crate::sync::SyncCoordinator;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use tracing::{info, instrument};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AttendanceError {
    #[error("employee {employee_id} already has an open record on {date}")]
    AlreadyCheckedIn {
        employee_id: String,
        date: NaiveDate,
    },
    #[error("check-out {check_out} is before check-in {check_in}")]
    CheckOutBeforeCheckIn {
        check_in: DateTime<Utc>,
        check_out: DateTime<Utc>,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Filters for the history view.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub date: Option<NaiveDate>,
    /// Case-insensitive match on employee name or id.
    pub search: Option<String>,
    pub sync_status: Option<SyncStatus>,
}

impl HistoryFilter {
    fn matches(&self, record: &AttendanceRecord) -> bool {
        if let Some(status) = self.sync_status {
            if record.sync_status != status {
                return false;
            }
        }
        match self.search.as_deref().map(str::trim) {
            Some(needle) if !needle.is_empty() => {
                let needle = needle.to_lowercase();
                record.employee_name.to_lowercase().contains(&needle)
                    || record.employee_id.to_lowercase().contains(&needle)
            }
            _ => true,
        }
    }
}

pub struct AttendanceStore {
    pool: Pool,
    sync: SyncCoordinator,
    project: Option<Project>,
    reject_duplicate_check_in: bool,
}

impl AttendanceStore {
    pub fn new(sync: SyncCoordinator, project: Option<Project>) -> Self {
        Self {
            pool: sync.pool().clone(),
            sync,
            project,
            reject_duplicate_check_in: false,
        }
    }

    pub fn reject_duplicate_check_in(mut self, reject: bool) -> Self {
        self.reject_duplicate_check_in = reject;
        self
    }

    pub fn project(&self) -> Option<&Project> {
        self.project.as_ref()
    }

    pub fn sync(&self) -> &SyncCoordinator {
        &self.sync
    }

    /// Opens a record for the employee. `None` when no project is active.
    pub async fn add_check_in(
        &self,
        employee_id: &str,
        employee_name: &str,
        location: &str,
    ) -> Result<Option<AttendanceRecord>, AttendanceError> {
        self.add_check_in_at(employee_id, employee_name, location, Utc::now())
            .await
    }

    #[instrument(skip(self, employee_name, location))]
    pub async fn add_check_in_at(
        &self,
        employee_id: &str,
        employee_name: &str,
        location: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<AttendanceRecord>, AttendanceError> {
        let Some(project) = &self.project else {
            return Ok(None);
        };
        let date = at.date_naive();
        let mut tx = self.pool.begin().await?;

        if self.reject_duplicate_check_in
            && db::find_open_record(&mut tx, &project.id, employee_id, date)
                .await?
                .is_some()
        {
            return Err(AttendanceError::AlreadyCheckedIn {
                employee_id: employee_id.to_string(),
                date,
            });
        }

        let record = AttendanceRecord {
            id: Uuid::new_v4().to_string(),
            employee_id: employee_id.to_string(),
            employee_name: employee_name.to_string(),
            project_id: project.id.clone(),
            location: location.to_string(),
            date,
            check_in_time: at,
            check_out_time: None,
            sync_status: SyncStatus::PendingSync,
        };
        db::insert_record(&mut tx, &record).await?;
        SyncCoordinator::add_pending_change_tx(&mut tx, ChangeKind::CheckIn, &record.id, at)
            .await?;
        tx.commit().await?;

        info!(record_id = %record.id, project_id = %project.id, "checked in");
        Ok(Some(record))
    }

    /// Closes the employee's open record for today. `None` when there is
    /// nothing to close, including a repeated check-out.
    pub async fn add_check_out(
        &self,
        employee_id: &str,
    ) -> Result<Option<AttendanceRecord>, AttendanceError> {
        self.add_check_out_at(employee_id, Utc::now()).await
    }

    #[instrument(skip(self))]
    pub async fn add_check_out_at(
        &self,
        employee_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<AttendanceRecord>, AttendanceError> {
        let Some(project) = &self.project else {
            return Ok(None);
        };
        let mut tx = self.pool.begin().await?;
        let Some(open) =
            db::find_open_record(&mut tx, &project.id, employee_id, at.date_naive()).await?
        else {
            return Ok(None);
        };
        if at < open.check_in_time {
            return Err(AttendanceError::CheckOutBeforeCheckIn {
                check_in: open.check_in_time,
                check_out: at,
            });
        }
        let closed = db::close_record(&mut tx, &open.id, at).await?;
        SyncCoordinator::add_pending_change_tx(&mut tx, ChangeKind::CheckOut, &closed.id, at)
            .await?;
        tx.commit().await?;

        info!(record_id = %closed.id, "checked out");
        Ok(Some(closed))
    }

    /// Closes the record behind an exception with a manually supplied time.
    /// `None` when the exception does not exist in this project.
    #[instrument(skip(self))]
    pub async fn resolve_exception(
        &self,
        exception_id: &str,
        check_out_time: DateTime<Utc>,
    ) -> Result<Option<AttendanceRecord>, AttendanceError> {
        let Some(project) = &self.project else {
            return Ok(None);
        };
        let mut tx = self.pool.begin().await?;
        let record = db::fetch_record(&mut *tx, exception_id).await?;
        let Some(record) = record.filter(|r| r.project_id == project.id && r.is_open()) else {
            return Ok(None);
        };
        if check_out_time < record.check_in_time {
            return Err(AttendanceError::CheckOutBeforeCheckIn {
                check_in: record.check_in_time,
                check_out: check_out_time,
            });
        }
        let closed = db::close_record(&mut tx, &record.id, check_out_time).await?;
        SyncCoordinator::add_pending_change_tx(
            &mut tx,
            ChangeKind::ResolveException,
            &closed.id,
            Utc::now(),
        )
        .await?;
        tx.commit().await?;

        info!(record_id = %closed.id, "exception resolved");
        Ok(Some(closed))
    }

    /// Flushes through the shared coordinator. True only when a flush
    /// happened and succeeded.
    pub async fn sync_records(&self) -> Result<bool, AttendanceError> {
        Ok(self.sync.sync_changes().await?.succeeded())
    }

    async fn query(
        &self,
        date: Option<NaiveDate>,
        employee_id: Option<&str>,
        open_only: bool,
    ) -> Result<Vec<AttendanceRecord>, AttendanceError> {
        let Some(project) = &self.project else {
            return Ok(Vec::new());
        };
        let records = db::list_records(
            &self.pool,
            &RecordQuery {
                project_id: &project.id,
                date,
                employee_id,
                open_only,
            },
        )
        .await?;
        Ok(records)
    }

    pub async fn today_records(&self) -> Result<Vec<AttendanceRecord>, AttendanceError> {
        self.records_on(Utc::now().date_naive()).await
    }

    pub async fn records_on(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, AttendanceError> {
        self.query(Some(date), None, false).await
    }

    pub async fn all_records(&self) -> Result<Vec<AttendanceRecord>, AttendanceError> {
        self.query(None, None, false).await
    }

    pub async fn exceptions(&self) -> Result<Vec<AttendanceException>, AttendanceError> {
        let open = self.query(None, None, true).await?;
        Ok(derive_exceptions(&open))
    }

    pub async fn stats(&self) -> Result<AttendanceStats, AttendanceError> {
        self.stats_on(Utc::now().date_naive()).await
    }

    pub async fn stats_on(&self, date: NaiveDate) -> Result<AttendanceStats, AttendanceError> {
        Ok(AttendanceStats::from_records(&self.records_on(date).await?))
    }

    pub async fn history(
        &self,
        filter: &HistoryFilter,
    ) -> Result<Vec<AttendanceRecord>, AttendanceError> {
        let records = self.query(filter.date, None, false).await?;
        Ok(records.into_iter().filter(|r| filter.matches(r)).collect())
    }

    pub async fn employee_history(
        &self,
        employee_id: &str,
    ) -> Result<Vec<AttendanceRecord>, AttendanceError> {
        self.query(None, Some(employee_id), false).await
    }
}
