use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::info;

use site_attendance::attendance::{AttendanceStore, HistoryFilter};
use site_attendance::config::{self, Config};
use site_attendance::db;
use site_attendance::location;
use site_attendance::model::{AttendanceRecord, SyncStatus};
use site_attendance::remote;
use site_attendance::roster::{self, EmployeeFilter, Enrollment};
use site_attendance::session::Session;
use site_attendance::sync::{SkipReason, SyncCoordinator, SyncOutcome};

#[derive(Debug, Parser)]
#[command(author, version, about = "Construction-site attendance with offline sync")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Treat the network as unavailable for this invocation
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SyncFilter {
    Synced,
    Pending,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load supervisors, projects and employees from a YAML roster
    ImportRoster { path: PathBuf },
    /// Sign in as a supervisor
    Login { email: String },
    Logout,
    /// Show the signed-in supervisor and active project
    Whoami,
    /// List the projects assigned to the signed-in supervisor
    Projects,
    /// Make a project the active one
    UseProject { project_id: String },
    /// List employees of the active project
    Employees {
        #[arg(long)]
        search: Option<String>,
        #[arg(long, conflicts_with = "not_enrolled")]
        enrolled: bool,
        #[arg(long)]
        not_enrolled: bool,
    },
    /// Mark an employee's face as enrolled
    Enroll { employee_id: String },
    /// Record a check-in for an enrolled employee
    CheckIn {
        employee_id: String,
        #[arg(long, requires = "lon", allow_negative_numbers = true)]
        lat: Option<f64>,
        #[arg(long, requires = "lat", allow_negative_numbers = true)]
        lon: Option<f64>,
        /// Free-text location, used when no coordinates are given
        #[arg(long)]
        location: Option<String>,
    },
    /// Record a check-out for today's open record
    CheckOut { employee_id: String },
    /// List check-ins without a check-out
    Exceptions,
    /// Close an exception with a manual check-out time (RFC 3339)
    Resolve {
        exception_id: String,
        #[arg(long)]
        at: DateTime<Utc>,
    },
    /// Attendance history of the active project
    History {
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        search: Option<String>,
        #[arg(long, value_enum)]
        status: Option<SyncFilter>,
        /// Only this employee's records
        #[arg(long)]
        employee: Option<String>,
    },
    /// Today's stats and sync state
    Status,
    /// Flush pending changes to the remote now
    Sync,
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

    let sync = SyncCoordinator::from_config(pool.clone(), remote::from_config(&cfg)?, &cfg);
    sync.set_online(!args.offline);
    let session = Session::new(pool.clone());

    match args.command {
        Command::ImportRoster { path } => {
            let r = roster::load(&path)?;
            roster::import(&pool, &r).await?;
            println!(
                "Imported {} project(s) and {} supervisor(s)",
                r.projects.len(),
                r.supervisors.len()
            );
        }
        Command::Login { email } => {
            let user = session.login(&email).await?;
            println!("Signed in as {} <{}>", user.name, user.email);
            if let Some(p) = session.current_project().await? {
                println!("Active project: {} ({})", p.name, p.id);
            }
        }
        Command::Logout => {
            session.logout().await?;
            println!("Signed out");
        }
        Command::Whoami => match session.current_user().await? {
            Some(user) => {
                println!("{} <{}>", user.name, user.email);
                match session.current_project().await? {
                    Some(p) => println!("Active project: {} ({})", p.name, p.id),
                    None => println!("No project assigned"),
                }
            }
            None => println!("Not signed in"),
        },
        Command::Projects => {
            let current = session.current_project().await?.map(|p| p.id);
            for p in session.projects().await? {
                let marker = if current.as_deref() == Some(p.id.as_str()) { "*" } else { " " };
                println!(
                    "{} {}  {}  {}  ({} employees)",
                    marker, p.id, p.name, p.location, p.employee_count
                );
            }
        }
        Command::UseProject { project_id } => {
            let p = session.select_project(&project_id).await?;
            println!("Active project: {} ({})", p.name, p.id);
        }
        Command::Employees {
            search,
            enrolled,
            not_enrolled,
        } => {
            let project = require_project(&session).await?;
            let filter = EmployeeFilter {
                search,
                enrollment: match (enrolled, not_enrolled) {
                    (true, _) => Some(Enrollment::Enrolled),
                    (_, true) => Some(Enrollment::NotEnrolled),
                    _ => None,
                },
            };
            for e in roster::employees(&pool, &project.id, &filter).await? {
                let face = if e.face_enrolled { "enrolled" } else { "not enrolled" };
                println!("{}  {}  {}  [{}]", e.id, e.name, e.position, face);
            }
        }
        Command::Enroll { employee_id } => {
            if roster::enroll_face(&pool, &employee_id).await? {
                println!("Face enrolled for {}", employee_id);
            } else {
                return Err(anyhow!("unknown employee {}", employee_id));
            }
        }
        Command::CheckIn {
            employee_id,
            lat,
            lon,
            location: text,
        } => {
            let store = open_store(&session, &sync, &cfg).await?;
            let project = store
                .project()
                .ok_or_else(|| anyhow!("no active project"))?
                .clone();
            let employee = db::project_employees(&pool, &project.id)
                .await?
                .into_iter()
                .find(|e| e.id == employee_id)
                .ok_or_else(|| anyhow!("{} is not on project {}", employee_id, project.id))?;
            if !employee.face_enrolled {
                return Err(anyhow!(
                    "{} has no enrolled face; run `enroll {}` first",
                    employee.name,
                    employee.id
                ));
            }
            let place = location::resolve_location(
                lat.zip(lon),
                text.as_deref(),
                Some(project.location.as_str()),
            )?;
            if let Some(record) = store.add_check_in(&employee.id, &employee.name, &place).await? {
                println!("Checked in {} at {}", record.employee_name, record.check_in_time);
            }
        }
        Command::CheckOut { employee_id } => {
            let store = open_store(&session, &sync, &cfg).await?;
            match store.add_check_out(&employee_id).await? {
                Some(record) => println!(
                    "Checked out {} at {}",
                    record.employee_name,
                    record.check_out_time.unwrap_or_else(Utc::now)
                ),
                None => println!("No open check-in today for {}", employee_id),
            }
        }
        Command::Exceptions => {
            let store = open_store(&session, &sync, &cfg).await?;
            let exceptions = store.exceptions().await?;
            if exceptions.is_empty() {
                println!("No exceptions");
            }
            for e in exceptions {
                println!(
                    "{}  {} ({})  {}  checked in {}",
                    e.id, e.employee_name, e.employee_id, e.date, e.check_in_time
                );
            }
        }
        Command::Resolve { exception_id, at } => {
            let store = open_store(&session, &sync, &cfg).await?;
            match store.resolve_exception(&exception_id, at).await? {
                Some(record) => println!("Resolved {} for {}", record.id, record.employee_name),
                None => println!("No exception {}", exception_id),
            }
        }
        Command::History {
            date,
            search,
            status,
            employee,
        } => {
            let store = open_store(&session, &sync, &cfg).await?;
            let records = match employee {
                Some(id) => store.employee_history(&id).await?,
                None => {
                    let filter = HistoryFilter {
                        date,
                        search,
                        sync_status: status.map(|s| match s {
                            SyncFilter::Synced => SyncStatus::Synced,
                            SyncFilter::Pending => SyncStatus::PendingSync,
                        }),
                    };
                    store.history(&filter).await?
                }
            };
            if records.is_empty() {
                println!("No records found for selected filters");
            }
            for r in &records {
                print_record(r);
            }
        }
        Command::Status => {
            let store = open_store(&session, &sync, &cfg).await?;
            let stats = store.stats().await?;
            let state = sync.state().await?;
            println!(
                "Today: {} check-ins, {} check-outs, {} synced, {} not synced",
                stats.total_check_ins,
                stats.total_check_outs,
                stats.total_synced,
                stats.total_not_synced
            );
            println!(
                "Pending changes: {}  Last sync: {}  Online: {}",
                state.pending_changes,
                state
                    .last_sync
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".into()),
                state.is_online
            );
        }
        Command::Sync => {
            let outcome = sync.sync_changes().await?;
            report_outcome(&outcome);
        }
    }

    Ok(())
}

async fn require_project(session: &Session) -> Result<site_attendance::model::Project> {
    session
        .current_project()
        .await?
        .ok_or_else(|| anyhow!("no active project; sign in and run `use-project`"))
}

async fn open_store(session: &Session, sync: &SyncCoordinator, cfg: &Config) -> Result<AttendanceStore> {
    let project = require_project(session).await?;
    Ok(AttendanceStore::new(sync.clone(), Some(project))
        .reject_duplicate_check_in(cfg.attendance.reject_duplicate_check_in))
}

fn print_record(r: &AttendanceRecord) {
    let out = r
        .check_out_time
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "N/A".into());
    let synced = if r.is_synced() { "synced" } else { "pending" };
    println!(
        "{}  {}  {} ({})  in {}  out {}  {}  [{}]",
        r.id,
        r.date,
        r.employee_name,
        r.employee_id,
        r.check_in_time.to_rfc3339(),
        out,
        r.location,
        synced
    );
}

fn report_outcome(outcome: &SyncOutcome) {
    match outcome {
        SyncOutcome::Synced { changes, records, at } => {
            info!(changes, records, "sync finished");
            println!("Synced {} change(s) covering {} record(s) at {}", changes, records, at);
        }
        SyncOutcome::Deferred { retry_at, error } => {
            println!("Sync failed ({}); will retry after {}", error, retry_at);
        }
        SyncOutcome::Rejected { reason, .. } => {
            println!("Remote rejected the changes: {}", reason);
        }
        SyncOutcome::Skipped(SkipReason::Offline) => println!("Offline; nothing sent"),
        SyncOutcome::Skipped(SkipReason::NothingPending) => println!("Nothing to sync"),
        SyncOutcome::Skipped(SkipReason::InFlight) => println!("A sync is already running"),
        SyncOutcome::Skipped(SkipReason::NotDue(due)) => println!("Next attempt due at {}", due),
    }
}
