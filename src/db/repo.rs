use super::keys;
use super::model::{OutboxEntry, PendingSnapshot, RecordQuery};
use crate::model::{AttendanceRecord, ChangeKind, Employee, Project, Supervisor, SyncStatus};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Executor, Row, Sqlite, SqliteConnection, SqlitePool};
use tracing::instrument;

pub type Pool = SqlitePool;

const RECORD_COLUMNS: &str = "id, employee_id, employee_name, project_id, location, work_date, \
                              check_in_time, check_out_time, is_synced";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// Single-connection in-memory pool. Every connection to `sqlite::memory:`
/// opens its own database, so the pool must never grow past one.
pub async fn init_memory_pool() -> Result<Pool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/`, ensure the parent
/// directory exists and ask SQLite to create the file. Leaves in-memory URLs
/// untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    // Pass through non-sqlite schemes
    if !url.starts_with("sqlite:") {
        return url.to_string();
    }

    // In-memory URLs like sqlite::memory: or sqlite::memory:?cache=shared
    if url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    // Rebuild URL, prefer sqlite:// form
    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    match query_part {
        Some(q) if q.contains("mode=") => {
            rebuilt.push('?');
            rebuilt.push_str(q);
        }
        Some(q) => {
            rebuilt.push('?');
            rebuilt.push_str(q);
            rebuilt.push_str("&mode=rwc");
        }
        None => rebuilt.push_str("?mode=rwc"),
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// key-value store

pub async fn kv_get<'e, E>(exec: E, key: &str) -> Result<Option<String>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let value = sqlx::query_scalar::<_, String>("SELECT value FROM kv WHERE key = ?")
        .bind(key)
        .fetch_optional(exec)
        .await?;
    Ok(value)
}

pub async fn kv_set<'e, E>(exec: E, key: &str, value: &str) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO kv (key, value) VALUES (?, ?) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value)
    .execute(exec)
    .await
    .with_context(|| format!("failed to persist key {}", key))?;
    Ok(())
}

pub async fn kv_delete<'e, E>(exec: E, key: &str) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("DELETE FROM kv WHERE key = ?")
        .bind(key)
        .execute(exec)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn last_sync_time(pool: &Pool) -> Result<Option<DateTime<Utc>>> {
    let Some(raw) = kv_get(pool, keys::LAST_SYNC_TIME).await? else {
        return Ok(None);
    };
    let parsed = DateTime::parse_from_rfc3339(&raw)
        .with_context(|| format!("stored lastSyncTime is not RFC 3339: {}", raw))?;
    Ok(Some(parsed.with_timezone(&Utc)))
}

/// Counter persisted under `offlinePendingChanges`. Missing or garbled values
/// read as zero.
#[instrument(skip_all)]
pub async fn stored_pending_counter(pool: &Pool) -> Result<u64> {
    let raw = kv_get(pool, keys::PENDING_CHANGES).await?;
    Ok(raw.and_then(|s| s.trim().parse().ok()).unwrap_or(0))
}

async fn mirror_pending_count(conn: &mut SqliteConnection) -> Result<u64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox")
        .fetch_one(&mut *conn)
        .await?;
    kv_set(&mut *conn, keys::PENDING_CHANGES, &count.to_string()).await?;
    Ok(count as u64)
}

// ---------------------------------------------------------------------------
// attendance records

fn record_from_row(row: &SqliteRow) -> Result<AttendanceRecord> {
    Ok(AttendanceRecord {
        id: row.try_get("id")?,
        employee_id: row.try_get("employee_id")?,
        employee_name: row.try_get("employee_name")?,
        project_id: row.try_get("project_id")?,
        location: row.try_get("location")?,
        date: row.try_get("work_date")?,
        check_in_time: row.try_get("check_in_time")?,
        check_out_time: row.try_get("check_out_time")?,
        sync_status: SyncStatus::from_flag(row.try_get("is_synced")?),
    })
}

#[instrument(skip_all)]
pub async fn insert_record(conn: &mut SqliteConnection, record: &AttendanceRecord) -> Result<()> {
    sqlx::query(
        "INSERT INTO attendance_records (id, employee_id, employee_name, project_id, location, \
         work_date, check_in_time, check_out_time, is_synced) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&record.id)
    .bind(&record.employee_id)
    .bind(&record.employee_name)
    .bind(&record.project_id)
    .bind(&record.location)
    .bind(record.date)
    .bind(record.check_in_time)
    .bind(record.check_out_time)
    .bind(record.is_synced())
    .execute(&mut *conn)
    .await
    .context("failed to insert attendance record")?;
    Ok(())
}

pub async fn fetch_record<'e, E>(exec: E, id: &str) -> Result<Option<AttendanceRecord>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("SELECT {} FROM attendance_records WHERE id = ?", RECORD_COLUMNS);
    let row = sqlx::query(&sql).bind(id).fetch_optional(exec).await?;
    row.as_ref().map(record_from_row).transpose()
}

/// Earliest open record of the employee for the given project and day.
#[instrument(skip_all)]
pub async fn find_open_record(
    conn: &mut SqliteConnection,
    project_id: &str,
    employee_id: &str,
    date: chrono::NaiveDate,
) -> Result<Option<AttendanceRecord>> {
    let sql = format!(
        "SELECT {} FROM attendance_records \
         WHERE project_id = ? AND employee_id = ? AND work_date = ? AND check_out_time IS NULL \
         ORDER BY check_in_time ASC, rowid ASC LIMIT 1",
        RECORD_COLUMNS
    );
    let row = sqlx::query(&sql)
        .bind(project_id)
        .bind(employee_id)
        .bind(date)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(record_from_row).transpose()
}

/// Sets the check-out time and flags the record as unsynced. Only touches
/// records that are still open.
#[instrument(skip_all)]
pub async fn close_record(
    conn: &mut SqliteConnection,
    id: &str,
    check_out_time: DateTime<Utc>,
) -> Result<AttendanceRecord> {
    let res = sqlx::query(
        "UPDATE attendance_records SET check_out_time = ?, is_synced = 0 \
         WHERE id = ? AND check_out_time IS NULL",
    )
    .bind(check_out_time)
    .bind(id)
    .execute(&mut *conn)
    .await?;
    if res.rows_affected() == 0 {
        return Err(anyhow!("record {} is not open", id));
    }
    fetch_record(&mut *conn, id)
        .await?
        .ok_or_else(|| anyhow!("record {} vanished after update", id))
}

#[instrument(skip_all)]
pub async fn list_records(pool: &Pool, query: &RecordQuery<'_>) -> Result<Vec<AttendanceRecord>> {
    let sql = format!(
        "SELECT {} FROM attendance_records \
         WHERE project_id = ? \
           AND (? IS NULL OR work_date = ?) \
           AND (? IS NULL OR employee_id = ?) \
           AND (? = 0 OR check_out_time IS NULL) \
         ORDER BY check_in_time ASC, rowid ASC",
        RECORD_COLUMNS
    );
    let rows = sqlx::query(&sql)
        .bind(query.project_id)
        .bind(query.date)
        .bind(query.date)
        .bind(query.employee_id)
        .bind(query.employee_id)
        .bind(query.open_only)
        .fetch_all(pool)
        .await?;
    rows.iter().map(record_from_row).collect()
}

// ---------------------------------------------------------------------------
// pending change journal

/// Appends one change for `record_id` and mirrors the journal length to the
/// `offlinePendingChanges` key. Runs inside the caller's transaction.
#[instrument(skip_all)]
pub async fn enqueue_change_tx(
    conn: &mut SqliteConnection,
    kind: ChangeKind,
    record_id: &str,
    now: DateTime<Utc>,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO outbox (record_id, kind, attempt, due_at, created_at) \
         VALUES (?, ?, 0, ?, ?) RETURNING id",
    )
    .bind(record_id)
    .bind(kind.as_str())
    .bind(now)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;
    let id: i64 = rec.get("id");
    mirror_pending_count(conn).await?;
    Ok(id)
}

#[instrument(skip_all)]
pub async fn count_pending_changes(pool: &Pool) -> Result<u64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox")
        .fetch_one(pool)
        .await?;
    Ok(count as u64)
}

#[instrument(skip_all)]
pub async fn list_outbox(pool: &Pool) -> Result<Vec<OutboxEntry>> {
    let rows = sqlx::query(
        "SELECT id, record_id, kind, attempt, due_at, last_error FROM outbox ORDER BY id ASC",
    )
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| {
            let kind: String = row.try_get("kind")?;
            Ok(OutboxEntry {
                id: row.try_get("id")?,
                record_id: row.try_get("record_id")?,
                kind: ChangeKind::parse_kind(&kind)
                    .ok_or_else(|| anyhow!("unknown change kind {}", kind))?,
                attempt: row.try_get("attempt")?,
                due_at: row.try_get("due_at")?,
                last_error: row.try_get("last_error")?,
            })
        })
        .collect()
}

/// Earliest `due_at` across the journal, if anything is pending.
#[instrument(skip_all)]
pub async fn next_due_at(pool: &Pool) -> Result<Option<DateTime<Utc>>> {
    let due = sqlx::query_scalar::<_, DateTime<Utc>>(
        "SELECT due_at FROM outbox ORDER BY due_at ASC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;
    Ok(due)
}

/// Collects the unsynced records and the journal high-water mark that a flush
/// of those records will cover.
#[instrument(skip_all)]
pub async fn pending_snapshot(pool: &Pool) -> Result<PendingSnapshot> {
    let mut tx = pool.begin().await?;
    let (max_id, count): (Option<i64>, i64) =
        sqlx::query_as("SELECT MAX(id), COUNT(*) FROM outbox")
            .fetch_one(&mut *tx)
            .await?;
    let up_to = max_id.unwrap_or(0);
    let sql = format!(
        "SELECT {} FROM attendance_records \
         WHERE is_synced = 0 OR id IN (SELECT record_id FROM outbox WHERE id <= ?) \
         ORDER BY check_in_time ASC, rowid ASC",
        RECORD_COLUMNS
    );
    let rows = sqlx::query(&sql).bind(up_to).fetch_all(&mut *tx).await?;
    let records = rows
        .iter()
        .map(record_from_row)
        .collect::<Result<Vec<_>>>()?;
    tx.commit().await?;
    Ok(PendingSnapshot {
        up_to_change_id: up_to,
        change_count: count as u64,
        records,
    })
}

/// Drops the flushed changes and marks the pushed records synced, except
/// those that picked up newer changes while the push was in flight. Returns
/// the number of records marked synced.
#[instrument(skip_all)]
pub async fn complete_sync(
    pool: &Pool,
    snapshot: &PendingSnapshot,
    at: DateTime<Utc>,
) -> Result<u64> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM outbox WHERE id <= ?")
        .bind(snapshot.up_to_change_id)
        .execute(&mut *tx)
        .await?;
    let mut marked = 0;
    for record in &snapshot.records {
        let res = sqlx::query(
            "UPDATE attendance_records SET is_synced = 1 \
             WHERE id = ? AND NOT EXISTS (SELECT 1 FROM outbox o WHERE o.record_id = attendance_records.id)",
        )
        .bind(&record.id)
        .execute(&mut *tx)
        .await?;
        marked += res.rows_affected();
    }
    kv_set(&mut *tx, keys::LAST_SYNC_TIME, &at.to_rfc3339()).await?;
    mirror_pending_count(&mut tx).await?;
    tx.commit().await?;
    Ok(marked)
}

/// Exponential backoff: 5s * 2^attempt, capped at `max_cap_secs` (no cap when
/// the cap is not positive).
pub fn backoff_delay_secs(attempt: i32, max_cap_secs: i64) -> i64 {
    let secs = 5_i64 * (1_i64 << attempt.clamp(0, 10));
    if max_cap_secs <= 0 {
        secs
    } else {
        secs.min(max_cap_secs)
    }
}

/// Pushes every change up to `up_to_change_id` into the future after a failed
/// flush. Permanent failures wait the full cap. Returns the new due time.
#[instrument(skip_all)]
pub async fn backoff_changes(
    pool: &Pool,
    up_to_change_id: i64,
    max_cap_secs: i64,
    error: &str,
    permanent: bool,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    let mut tx = pool.begin().await?;
    let attempt: Option<i32> =
        sqlx::query_scalar("SELECT MAX(attempt) FROM outbox WHERE id <= ?")
            .bind(up_to_change_id)
            .fetch_one(&mut *tx)
            .await?;
    let attempt = attempt.unwrap_or(0);
    let secs = if permanent {
        backoff_delay_secs(10, max_cap_secs)
    } else {
        backoff_delay_secs(attempt, max_cap_secs)
    };
    let due_at = now + Duration::seconds(secs);
    sqlx::query("UPDATE outbox SET attempt = attempt + 1, due_at = ?, last_error = ? WHERE id <= ?")
        .bind(due_at)
        .bind(error)
        .bind(up_to_change_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(due_at)
}

// ---------------------------------------------------------------------------
// roster

pub async fn upsert_supervisor(conn: &mut SqliteConnection, s: &Supervisor) -> Result<()> {
    sqlx::query(
        "INSERT INTO supervisors (id, name, email) VALUES (?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET name = excluded.name, email = excluded.email",
    )
    .bind(&s.id)
    .bind(&s.name)
    .bind(&s.email)
    .execute(&mut *conn)
    .await?;
    sqlx::query("DELETE FROM supervisor_projects WHERE supervisor_id = ?")
        .bind(&s.id)
        .execute(&mut *conn)
        .await?;
    for project_id in &s.project_ids {
        sqlx::query(
            "INSERT OR IGNORE INTO supervisor_projects (supervisor_id, project_id) VALUES (?, ?)",
        )
        .bind(&s.id)
        .bind(project_id)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

pub async fn upsert_project(
    conn: &mut SqliteConnection,
    id: &str,
    name: &str,
    location: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO projects (id, name, location) VALUES (?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET name = excluded.name, location = excluded.location",
    )
    .bind(id)
    .bind(name)
    .bind(location)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Drops the project's memberships so an import can restate them.
pub async fn clear_project_employees(conn: &mut SqliteConnection, project_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM project_employees WHERE project_id = ?")
        .bind(project_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Enrollment only moves forward on re-import; `enroll_face` results survive.
pub async fn upsert_project_employee(
    conn: &mut SqliteConnection,
    project_id: &str,
    e: &Employee,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO employees (id, name, position, face_enrolled) VALUES (?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET name = excluded.name, position = excluded.position, \
         face_enrolled = MAX(face_enrolled, excluded.face_enrolled)",
    )
    .bind(&e.id)
    .bind(&e.name)
    .bind(&e.position)
    .bind(e.face_enrolled)
    .execute(&mut *conn)
    .await?;
    sqlx::query("INSERT OR IGNORE INTO project_employees (project_id, employee_id) VALUES (?, ?)")
        .bind(project_id)
        .bind(&e.id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn find_supervisor_by_email(pool: &Pool, email: &str) -> Result<Option<Supervisor>> {
    let row = sqlx::query("SELECT id, name, email FROM supervisors WHERE lower(email) = lower(?)")
        .bind(email.trim())
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let id: String = row.try_get("id")?;
    let project_ids: Vec<String> = sqlx::query_scalar(
        "SELECT project_id FROM supervisor_projects WHERE supervisor_id = ? ORDER BY project_id",
    )
    .bind(&id)
    .fetch_all(pool)
    .await?;
    Ok(Some(Supervisor {
        id,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        project_ids,
    }))
}

fn project_from_row(row: &SqliteRow) -> Result<Project> {
    Ok(Project {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        location: row.try_get("location")?,
        employee_count: row.try_get("employee_count")?,
    })
}

#[instrument(skip_all)]
pub async fn projects_by_ids(pool: &Pool, ids: &[String]) -> Result<Vec<Project>> {
    let mut projects = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(p) = fetch_project(pool, id).await? {
            projects.push(p);
        }
    }
    Ok(projects)
}

#[instrument(skip_all)]
pub async fn fetch_project(pool: &Pool, id: &str) -> Result<Option<Project>> {
    let row = sqlx::query(
        "SELECT p.id, p.name, p.location, \
                (SELECT COUNT(*) FROM project_employees pe WHERE pe.project_id = p.id) AS employee_count \
         FROM projects p WHERE p.id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(project_from_row).transpose()
}

fn employee_from_row(row: &SqliteRow) -> Result<Employee> {
    Ok(Employee {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        position: row.try_get("position")?,
        face_enrolled: row.try_get("face_enrolled")?,
    })
}

#[instrument(skip_all)]
pub async fn project_employees(pool: &Pool, project_id: &str) -> Result<Vec<Employee>> {
    let rows = sqlx::query(
        "SELECT e.id, e.name, e.position, e.face_enrolled FROM employees e \
         JOIN project_employees pe ON pe.employee_id = e.id \
         WHERE pe.project_id = ? ORDER BY e.id",
    )
    .bind(project_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(employee_from_row).collect()
}

#[instrument(skip_all)]
pub async fn set_face_enrolled(pool: &Pool, employee_id: &str, enrolled: bool) -> Result<bool> {
    let res = sqlx::query("UPDATE employees SET face_enrolled = ? WHERE id = ?")
        .bind(enrolled)
        .bind(employee_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    async fn setup_pool() -> Pool {
        let pool = init_memory_pool().await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    fn record(id: &str, at: DateTime<Utc>) -> AttendanceRecord {
        AttendanceRecord {
            id: id.into(),
            employee_id: "E001".into(),
            employee_name: "Ahmad".into(),
            project_id: "P001".into(),
            location: "North gate".into(),
            date: at.date_naive(),
            check_in_time: at,
            check_out_time: None,
            sync_status: SyncStatus::PendingSync,
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff_delay_secs(0, 300), 5);
        assert_eq!(backoff_delay_secs(1, 300), 10);
        assert_eq!(backoff_delay_secs(3, 300), 40);
        assert_eq!(backoff_delay_secs(7, 300), 300);
        assert_eq!(backoff_delay_secs(50, 0), 5 * 1024);
    }

    #[test]
    fn sqlite_urls_get_create_mode() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(prepare_sqlite_url("postgres://x"), "postgres://x");
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("nested/db.sqlite");
        let url = format!("sqlite://{}", path.display());
        assert_eq!(prepare_sqlite_url(&url), format!("{}?mode=rwc", url));
        assert!(path.parent().unwrap().exists());
        let with_mode = format!("{}?mode=ro", url);
        assert_eq!(prepare_sqlite_url(&with_mode), with_mode);
    }

    #[tokio::test]
    async fn kv_round_trip_and_overwrite() {
        let pool = setup_pool().await;
        assert!(kv_get(&pool, "k").await.unwrap().is_none());
        kv_set(&pool, "k", "1").await.unwrap();
        kv_set(&pool, "k", "2").await.unwrap();
        assert_eq!(kv_get(&pool, "k").await.unwrap().as_deref(), Some("2"));
        kv_delete(&pool, "k").await.unwrap();
        assert!(kv_get(&pool, "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn journal_mirrors_counter_and_completes() {
        let pool = setup_pool().await;
        let at = Utc.with_ymd_and_hms(2026, 5, 4, 7, 15, 0).unwrap();

        let mut tx = pool.begin().await.unwrap();
        insert_record(&mut tx, &record("r1", at)).await.unwrap();
        enqueue_change_tx(&mut tx, ChangeKind::CheckIn, "r1", at).await.unwrap();
        close_record(&mut tx, "r1", at + Duration::hours(8)).await.unwrap();
        enqueue_change_tx(&mut tx, ChangeKind::CheckOut, "r1", at).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(count_pending_changes(&pool).await.unwrap(), 2);
        assert_eq!(stored_pending_counter(&pool).await.unwrap(), 2);

        let snapshot = pending_snapshot(&pool).await.unwrap();
        assert_eq!(snapshot.change_count, 2);
        assert_eq!(snapshot.records.len(), 1);

        let marked = complete_sync(&pool, &snapshot, at).await.unwrap();
        assert_eq!(marked, 1);
        assert_eq!(stored_pending_counter(&pool).await.unwrap(), 0);
        assert_eq!(last_sync_time(&pool).await.unwrap(), Some(at));
        assert!(fetch_record(&pool, "r1").await.unwrap().unwrap().is_synced());
    }

    #[tokio::test]
    async fn closing_a_closed_record_fails() {
        let pool = setup_pool().await;
        let at = Utc.with_ymd_and_hms(2026, 5, 4, 7, 15, 0).unwrap();
        let mut tx = pool.begin().await.unwrap();
        insert_record(&mut tx, &record("r1", at)).await.unwrap();
        close_record(&mut tx, "r1", at).await.unwrap();
        assert!(close_record(&mut tx, "r1", at).await.is_err());
    }

    #[tokio::test]
    async fn backoff_moves_due_time_and_counts_attempts() {
        let pool = setup_pool().await;
        let at = Utc.with_ymd_and_hms(2026, 5, 4, 7, 15, 0).unwrap();
        let mut tx = pool.begin().await.unwrap();
        insert_record(&mut tx, &record("r1", at)).await.unwrap();
        let id = enqueue_change_tx(&mut tx, ChangeKind::CheckIn, "r1", at).await.unwrap();
        tx.commit().await.unwrap();

        let due = backoff_changes(&pool, id, 300, "503", false, at).await.unwrap();
        assert_eq!(due, at + Duration::seconds(5));
        let due = backoff_changes(&pool, id, 300, "503", false, at).await.unwrap();
        assert_eq!(due, at + Duration::seconds(10));
        assert_eq!(next_due_at(&pool).await.unwrap(), Some(due));

        let entries = list_outbox(&pool).await.unwrap();
        assert_eq!(entries[0].attempt, 2);
        assert_eq!(entries[0].last_error.as_deref(), Some("503"));

        let due = backoff_changes(&pool, id, 300, "bad payload", true, at).await.unwrap();
        assert_eq!(due, at + Duration::seconds(300));
    }
}
