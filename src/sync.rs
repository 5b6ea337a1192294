//! Offline sync tracking and the single coordinator that flushes pending
//! changes to the remote.
use crate::config::Config;
use crate::db::{self, Pool};
use crate::model::{ChangeKind, SyncState};
use crate::remote::{RemoteError, RemoteSink};
use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Offline,
    NothingPending,
    InFlight,
    /// Every pending change is still backing off.
    NotDue(DateTime<Utc>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Synced {
        changes: u64,
        records: u64,
        at: DateTime<Utc>,
    },
    Deferred {
        retry_at: DateTime<Utc>,
        error: String,
    },
    Rejected {
        retry_at: DateTime<Utc>,
        reason: String,
    },
    Skipped(SkipReason),
}

impl SyncOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, SyncOutcome::Synced { .. })
    }
}

struct Inner {
    pool: Pool,
    remote: Arc<dyn RemoteSink>,
    max_backoff_secs: i64,
    online: AtomicBool,
    syncing: AtomicBool,
    in_flight: Mutex<()>,
}

/// Shared by every caller that wants to flush, so at most one flush runs at a
/// time per process.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

struct SyncingFlag<'a>(&'a AtomicBool);

impl<'a> SyncingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for SyncingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SyncCoordinator {
    pub fn new(pool: Pool, remote: Arc<dyn RemoteSink>, max_backoff_secs: i64) -> Self {
        Self {
            inner: Arc::new(Inner {
                pool,
                remote,
                max_backoff_secs,
                online: AtomicBool::new(true),
                syncing: AtomicBool::new(false),
                in_flight: Mutex::new(()),
            }),
        }
    }

    pub fn from_config(pool: Pool, remote: Arc<dyn RemoteSink>, cfg: &Config) -> Self {
        Self::new(pool, remote, cfg.app.max_backoff_seconds as i64)
    }

    pub fn pool(&self) -> &Pool {
        &self.inner.pool
    }

    pub fn set_online(&self, online: bool) {
        let was = self.inner.online.swap(online, Ordering::SeqCst);
        if was != online {
            info!(online, "connectivity changed");
        }
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.syncing.load(Ordering::SeqCst)
    }

    /// Probe the remote and mirror the answer into the online flag.
    pub async fn refresh_connectivity(&self) -> bool {
        let online = self.inner.remote.probe().await;
        self.set_online(online);
        online
    }

    /// Records one local mutation inside the caller's transaction.
    pub async fn add_pending_change_tx(
        conn: &mut SqliteConnection,
        kind: ChangeKind,
        record_id: &str,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        db::enqueue_change_tx(conn, kind, record_id, now).await
    }

    /// Records one local mutation in its own transaction.
    #[instrument(skip(self))]
    pub async fn add_pending_change(&self, kind: ChangeKind, record_id: &str) -> Result<i64> {
        let mut tx = self.inner.pool.begin().await?;
        let id = Self::add_pending_change_tx(&mut tx, kind, record_id, Utc::now()).await?;
        tx.commit().await?;
        Ok(id)
    }

    pub async fn pending_changes(&self) -> Result<u64> {
        db::count_pending_changes(&self.inner.pool).await
    }

    pub async fn last_sync(&self) -> Result<Option<DateTime<Utc>>> {
        db::last_sync_time(&self.inner.pool).await
    }

    pub async fn state(&self) -> Result<SyncState> {
        Ok(SyncState {
            pending_changes: self.pending_changes().await?,
            last_sync: self.last_sync().await?,
            is_online: self.is_online(),
            is_syncing: self.is_syncing(),
        })
    }

    /// Flush now, ignoring any backoff left by earlier failures.
    pub async fn sync_changes(&self) -> Result<SyncOutcome> {
        self.sync_inner(None).await
    }

    /// Flush only if the earliest pending change is due at `now`.
    pub async fn sync_if_due(&self, now: DateTime<Utc>) -> Result<SyncOutcome> {
        self.sync_inner(Some(now)).await
    }

    #[instrument(skip_all)]
    async fn sync_inner(&self, due_check: Option<DateTime<Utc>>) -> Result<SyncOutcome> {
        let pool = &self.inner.pool;
        if !self.is_online() {
            return Ok(SyncOutcome::Skipped(SkipReason::Offline));
        }
        if db::count_pending_changes(pool).await? == 0 {
            return Ok(SyncOutcome::Skipped(SkipReason::NothingPending));
        }
        if let Some(now) = due_check {
            if let Some(due) = db::next_due_at(pool).await? {
                if due > now {
                    return Ok(SyncOutcome::Skipped(SkipReason::NotDue(due)));
                }
            }
        }
        let Ok(_guard) = self.inner.in_flight.try_lock() else {
            return Ok(SyncOutcome::Skipped(SkipReason::InFlight));
        };
        let _flag = SyncingFlag::raise(&self.inner.syncing);
        self.flush().await
    }

    async fn flush(&self) -> Result<SyncOutcome> {
        let pool = &self.inner.pool;
        let snapshot = db::pending_snapshot(pool).await?;
        if snapshot.change_count == 0 {
            return Ok(SyncOutcome::Skipped(SkipReason::NothingPending));
        }

        let pushed = snapshot.records.len();
        let result = self
            .inner
            .remote
            .push(&snapshot.records)
            .await
            .and_then(|receipt| {
                if receipt.accepted < pushed {
                    Err(RemoteError::Transient(format!(
                        "remote accepted {} of {} records",
                        receipt.accepted, pushed
                    )))
                } else {
                    Ok(receipt)
                }
            });

        match result {
            Ok(receipt) => {
                let at = Utc::now();
                let records = db::complete_sync(pool, &snapshot, at).await?;
                info!(
                    changes = snapshot.change_count,
                    records,
                    accepted = receipt.accepted,
                    "pending changes synced"
                );
                Ok(SyncOutcome::Synced {
                    changes: snapshot.change_count,
                    records,
                    at,
                })
            }
            Err(RemoteError::Transient(msg)) => {
                let retry_at = db::backoff_changes(
                    pool,
                    snapshot.up_to_change_id,
                    self.inner.max_backoff_secs,
                    &msg,
                    false,
                    Utc::now(),
                )
                .await?;
                warn!(error = %msg, changes = snapshot.change_count, %retry_at, "sync failed; backoff");
                Ok(SyncOutcome::Deferred {
                    retry_at,
                    error: msg,
                })
            }
            Err(RemoteError::Permanent(msg)) => {
                let retry_at = db::backoff_changes(
                    pool,
                    snapshot.up_to_change_id,
                    self.inner.max_backoff_secs,
                    &msg,
                    true,
                    Utc::now(),
                )
                .await?;
                error!(reason = %msg, changes = snapshot.change_count, %retry_at, "remote rejected pending changes");
                Ok(SyncOutcome::Rejected {
                    retry_at,
                    reason: msg,
                })
            }
        }
    }
}
