use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

use site_attendance::config;
use site_attendance::db;
use site_attendance::remote;
use site_attendance::sync::{SkipReason, SyncCoordinator, SyncOutcome};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Flush pending attendance changes whenever the remote is reachable"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Exit once nothing is pending instead of waiting for new changes
    #[arg(long)]
    drain: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let sync = SyncCoordinator::from_config(pool, remote::from_config(&cfg)?, &cfg);
    let poll_sleep = Duration::from_millis(cfg.app.poll_interval_ms);

    info!(
        pending = sync.pending_changes().await?,
        "starting sync worker"
    );

    loop {
        sync.refresh_connectivity().await;
        match sync.sync_if_due(Utc::now()).await {
            Ok(SyncOutcome::Synced { .. }) => continue,
            Ok(SyncOutcome::Skipped(SkipReason::NothingPending)) if args.drain => {
                info!("all pending changes synced");
                break;
            }
            Ok(SyncOutcome::Rejected { reason, retry_at }) => {
                warn!(%reason, %retry_at, "changes rejected; waiting for backoff");
            }
            Ok(_) => {}
            Err(err) => {
                error!(?err, "sync worker error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
        tokio::time::sleep(poll_sleep).await;
    }

    Ok(())
}
