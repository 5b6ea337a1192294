use chrono::{Duration, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use site_attendance::attendance::AttendanceStore;
use site_attendance::db;
use site_attendance::model::{AttendanceRecord, ChangeKind, Project, SyncStatus};
use site_attendance::remote::{RemoteError, RemoteSink, SyncReceipt};
use site_attendance::sync::{SkipReason, SyncCoordinator, SyncOutcome};
use tokio::sync::{Mutex, Notify};

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = db::init_memory_pool().await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    pool
}

#[derive(Clone, Default)]
struct RecordingRemote {
    responses: Arc<Mutex<VecDeque<Result<SyncReceipt, RemoteError>>>>,
    pushes: Arc<Mutex<Vec<Vec<String>>>>,
    reachable: Arc<Mutex<bool>>,
    entered: Option<Arc<Notify>>,
    release: Option<Arc<Notify>>,
}

impl RecordingRemote {
    fn with_responses(responses: Vec<Result<SyncReceipt, RemoteError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        }
    }

    fn gated() -> (Self, Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let remote = Self {
            entered: Some(entered.clone()),
            release: Some(release.clone()),
            ..Default::default()
        };
        (remote, entered, release)
    }

    async fn pushes(&self) -> Vec<Vec<String>> {
        self.pushes.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl RemoteSink for RecordingRemote {
    async fn push(&self, records: &[AttendanceRecord]) -> Result<SyncReceipt, RemoteError> {
        self.pushes
            .lock()
            .await
            .push(records.iter().map(|r| r.id.clone()).collect());
        if let (Some(entered), Some(release)) = (&self.entered, &self.release) {
            entered.notify_one();
            release.notified().await;
        }
        let mut guard = self.responses.lock().await;
        guard.pop_front().unwrap_or(Ok(SyncReceipt {
            accepted: records.len(),
        }))
    }

    async fn probe(&self) -> bool {
        *self.reachable.lock().await
    }
}

fn project() -> Project {
    Project {
        id: "P001".into(),
        name: "Al Madinah Towers".into(),
        location: "Riyadh".into(),
        employee_count: 3,
    }
}

fn setup(pool: &sqlx::SqlitePool, remote: RecordingRemote) -> (SyncCoordinator, AttendanceStore) {
    let sync = SyncCoordinator::new(pool.clone(), Arc::new(remote), 300);
    let store = AttendanceStore::new(sync.clone(), Some(project()));
    (sync, store)
}

#[tokio::test]
async fn pending_changes_count_every_addition() {
    let pool = setup_pool().await;
    let (sync, _) = setup(&pool, RecordingRemote::default());

    let at = Utc::now();
    let mut conn = pool.acquire().await.unwrap();
    db::insert_record(
        &mut conn,
        &AttendanceRecord {
            id: "r1".into(),
            employee_id: "E001".into(),
            employee_name: "Ahmad".into(),
            project_id: "P001".into(),
            location: "gate".into(),
            date: at.date_naive(),
            check_in_time: at,
            check_out_time: None,
            sync_status: SyncStatus::PendingSync,
        },
    )
    .await
    .unwrap();
    drop(conn);

    for _ in 0..5 {
        sync.add_pending_change(ChangeKind::CheckIn, "r1").await.unwrap();
    }
    assert_eq!(sync.pending_changes().await.unwrap(), 5);
    assert_eq!(db::stored_pending_counter(&pool).await.unwrap(), 5);
}

#[tokio::test]
async fn offline_sync_is_skipped_and_keeps_pending() {
    let pool = setup_pool().await;
    let remote = RecordingRemote::default();
    let (sync, store) = setup(&pool, remote.clone());

    store.add_check_in("E001", "Ahmad", "gate").await.unwrap();
    sync.set_online(false);

    let outcome = sync.sync_changes().await.unwrap();
    assert_eq!(outcome, SyncOutcome::Skipped(SkipReason::Offline));
    assert!(!outcome.succeeded());
    assert_eq!(sync.pending_changes().await.unwrap(), 1);
    assert!(remote.pushes().await.is_empty());
    assert!(!store.sync_records().await.unwrap());

    let state = sync.state().await.unwrap();
    assert!(!state.is_online);
    assert!(!state.is_syncing);
    assert_eq!(state.pending_changes, 1);
    assert!(state.last_sync.is_none());
}

#[tokio::test]
async fn nothing_pending_is_skipped() {
    let pool = setup_pool().await;
    let remote = RecordingRemote::default();
    let (sync, _) = setup(&pool, remote.clone());

    assert_eq!(
        sync.sync_changes().await.unwrap(),
        SyncOutcome::Skipped(SkipReason::NothingPending)
    );
    assert!(remote.pushes().await.is_empty());
}

#[tokio::test]
async fn successful_sync_resets_counter_and_stamps_time() {
    let pool = setup_pool().await;
    let remote = RecordingRemote::default();
    let (sync, store) = setup(&pool, remote.clone());

    let a = store.add_check_in("E001", "Ahmad", "gate").await.unwrap().unwrap();
    let b = store.add_check_in("E002", "Mohammed", "gate").await.unwrap().unwrap();
    store.add_check_out("E001").await.unwrap();

    let before = Utc::now();
    match sync.sync_changes().await.unwrap() {
        SyncOutcome::Synced { changes, records, at } => {
            assert_eq!(changes, 3);
            assert_eq!(records, 2);
            assert!(at >= before);
        }
        other => panic!("unexpected outcome {:?}", other),
    }

    let pushes = remote.pushes().await;
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0], vec![a.id.clone(), b.id.clone()]);

    assert_eq!(sync.pending_changes().await.unwrap(), 0);
    assert_eq!(db::stored_pending_counter(&pool).await.unwrap(), 0);
    assert!(sync.last_sync().await.unwrap().unwrap() >= before);
    assert!(store.all_records().await.unwrap().iter().all(|r| r.is_synced()));
}

#[tokio::test]
async fn transient_failure_backs_off_then_recovers() {
    let pool = setup_pool().await;
    let remote = RecordingRemote::with_responses(vec![Err(RemoteError::Transient(
        "503 Service Unavailable".into(),
    ))]);
    let (sync, store) = setup(&pool, remote.clone());

    store.add_check_in("E001", "Ahmad", "gate").await.unwrap();

    let now = Utc::now();
    let retry_at = match sync.sync_changes().await.unwrap() {
        SyncOutcome::Deferred { retry_at, error } => {
            assert!(error.contains("503"));
            retry_at
        }
        other => panic!("unexpected outcome {:?}", other),
    };
    assert!(retry_at >= now + Duration::seconds(5));
    assert_eq!(sync.pending_changes().await.unwrap(), 1);
    assert!(sync.last_sync().await.unwrap().is_none());
    assert!(store.all_records().await.unwrap().iter().all(|r| !r.is_synced()));

    let entries = db::list_outbox(&pool).await.unwrap();
    assert_eq!(entries[0].attempt, 1);

    // The worker waits for the backoff; a manual sync does not.
    assert_eq!(
        sync.sync_if_due(Utc::now()).await.unwrap(),
        SyncOutcome::Skipped(SkipReason::NotDue(retry_at))
    );
    assert!(sync.sync_if_due(retry_at).await.unwrap().succeeded());
    assert_eq!(sync.pending_changes().await.unwrap(), 0);
    assert_eq!(remote.pushes().await.len(), 2);
}

#[tokio::test]
async fn permanent_failure_waits_the_full_cap() {
    let pool = setup_pool().await;
    let remote = RecordingRemote::with_responses(vec![Err(RemoteError::Permanent(
        "400 Bad Request: unknown project".into(),
    ))]);
    let (sync, store) = setup(&pool, remote);

    store.add_check_in("E001", "Ahmad", "gate").await.unwrap();

    let now = Utc::now();
    match sync.sync_changes().await.unwrap() {
        SyncOutcome::Rejected { retry_at, reason } => {
            assert!(reason.contains("unknown project"));
            assert!(retry_at >= now + Duration::seconds(300));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(sync.pending_changes().await.unwrap(), 1);
    let entries = db::list_outbox(&pool).await.unwrap();
    assert_eq!(entries[0].last_error.as_deref(), Some("400 Bad Request: unknown project"));
}

#[tokio::test]
async fn short_receipt_keeps_changes_pending() {
    let pool = setup_pool().await;
    let remote = RecordingRemote::with_responses(vec![Ok(SyncReceipt { accepted: 1 })]);
    let (sync, store) = setup(&pool, remote.clone());

    store.add_check_in("E001", "Ahmad", "gate").await.unwrap();
    store.add_check_in("E002", "Mohammed", "gate").await.unwrap();

    match sync.sync_changes().await.unwrap() {
        SyncOutcome::Deferred { error, .. } => assert!(error.contains("1 of 2")),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(sync.pending_changes().await.unwrap(), 2);
    assert!(sync.last_sync().await.unwrap().is_none());
    assert!(store.all_records().await.unwrap().iter().all(|r| !r.is_synced()));

    // The next push is accepted in full.
    assert!(sync.sync_changes().await.unwrap().succeeded());
    assert_eq!(sync.pending_changes().await.unwrap(), 0);
}

#[tokio::test]
async fn one_flush_at_a_time_and_late_changes_stay_pending() {
    let pool = setup_pool().await;
    let (remote, entered, release) = RecordingRemote::gated();
    let (sync, store) = setup(&pool, remote.clone());

    store.add_check_in("E001", "Ahmad", "gate").await.unwrap();

    let worker = {
        let sync = sync.clone();
        tokio::spawn(async move { sync.sync_changes().await })
    };
    entered.notified().await;

    assert!(sync.is_syncing());
    assert_eq!(
        sync.sync_changes().await.unwrap(),
        SyncOutcome::Skipped(SkipReason::InFlight)
    );

    // A check-out lands while the check-in is being pushed.
    store.add_check_out("E001").await.unwrap().unwrap();

    release.notify_one();
    let outcome = worker.await.unwrap().unwrap();
    assert!(outcome.succeeded());
    assert!(!sync.is_syncing());

    assert_eq!(sync.pending_changes().await.unwrap(), 1);
    let records = store.all_records().await.unwrap();
    assert_eq!(records[0].sync_status, SyncStatus::PendingSync);
    assert!(records[0].check_out_time.is_some());
    assert_eq!(remote.pushes().await.len(), 1);
}

#[tokio::test]
async fn probe_drives_online_flag() {
    let pool = setup_pool().await;
    let remote = RecordingRemote::default();
    let (sync, _) = setup(&pool, remote.clone());

    assert!(sync.is_online());
    assert!(!sync.refresh_connectivity().await);
    assert!(!sync.is_online());

    *remote.reachable.lock().await = true;
    assert!(sync.refresh_connectivity().await);
    assert!(sync.is_online());
}
