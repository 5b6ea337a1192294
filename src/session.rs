//! Signed-in supervisor and active project selection, persisted in the
//! key-value store under `user` and `currentProjectId`.
use crate::db::{self, keys, Pool};
use crate::model::{Project, Supervisor};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::{info, instrument};

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid email regex"));

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("'{0}' is not a valid email address")]
    InvalidEmail(String),
    #[error("no supervisor registered for {0}")]
    UnknownSupervisor(String),
    #[error("not signed in")]
    NotSignedIn,
    #[error("project {0} is not assigned to the signed-in supervisor")]
    ProjectNotAssigned(String),
    #[error("stored session is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub fn is_valid_email(email: &str) -> bool {
    EMAIL_RE.is_match(email.trim())
}

#[derive(Clone)]
pub struct Session {
    pool: Pool,
}

impl Session {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    #[instrument(skip(self))]
    pub async fn login(&self, email: &str) -> Result<Supervisor, SessionError> {
        if !is_valid_email(email) {
            return Err(SessionError::InvalidEmail(email.to_string()));
        }
        let supervisor = db::find_supervisor_by_email(&self.pool, email)
            .await?
            .ok_or_else(|| SessionError::UnknownSupervisor(email.trim().to_string()))?;
        let blob = serde_json::to_string(&supervisor)?;
        db::kv_set(&self.pool, keys::USER, &blob).await?;
        info!(supervisor_id = %supervisor.id, "signed in");
        Ok(supervisor)
    }

    /// Clears the signed-in user. The project selection is kept so the next
    /// login lands on the same site.
    pub async fn logout(&self) -> Result<(), SessionError> {
        db::kv_delete(&self.pool, keys::USER).await?;
        Ok(())
    }

    pub async fn current_user(&self) -> Result<Option<Supervisor>, SessionError> {
        match db::kv_get(&self.pool, keys::USER).await? {
            Some(blob) => Ok(Some(serde_json::from_str(&blob)?)),
            None => Ok(None),
        }
    }

    async fn require_user(&self) -> Result<Supervisor, SessionError> {
        self.current_user().await?.ok_or(SessionError::NotSignedIn)
    }

    /// Assignments are read from the roster on every call, so a re-import
    /// takes effect for a supervisor who is already signed in.
    pub async fn projects(&self) -> Result<Vec<Project>, SessionError> {
        let user = self.require_user().await?;
        let ids = db::find_supervisor_by_email(&self.pool, &user.email)
            .await?
            .map(|s| s.project_ids)
            .unwrap_or_default();
        Ok(db::projects_by_ids(&self.pool, &ids).await?)
    }

    pub async fn select_project(&self, project_id: &str) -> Result<Project, SessionError> {
        let project = self
            .projects()
            .await?
            .into_iter()
            .find(|p| p.id == project_id)
            .ok_or_else(|| SessionError::ProjectNotAssigned(project_id.to_string()))?;
        db::kv_set(&self.pool, keys::CURRENT_PROJECT_ID, &project.id).await?;
        Ok(project)
    }

    /// Saved project when it is still assigned to the user, else the first
    /// assigned project. `None` when signed out or nothing is assigned.
    pub async fn current_project(&self) -> Result<Option<Project>, SessionError> {
        if self.current_user().await?.is_none() {
            return Ok(None);
        }
        let projects = self.projects().await?;
        let saved = db::kv_get(&self.pool, keys::CURRENT_PROJECT_ID).await?;
        let chosen = saved
            .and_then(|id| projects.iter().find(|p| p.id == id).cloned())
            .or_else(|| projects.into_iter().next());
        Ok(chosen)
    }
}
