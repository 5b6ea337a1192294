//! Supervisor, project and employee roster.
use crate::db::{self, Pool};
use crate::model::{Employee, Supervisor};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::{info, instrument};

#[derive(Debug, Error)]
pub enum RosterError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid roster: {0}")]
    Invalid(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Roster {
    pub supervisors: Vec<Supervisor>,
    pub projects: Vec<RosterProject>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RosterProject {
    pub id: String,
    pub name: String,
    pub location: String,
    #[serde(default)]
    pub employees: Vec<Employee>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enrollment {
    Enrolled,
    NotEnrolled,
}

#[derive(Debug, Clone, Default)]
pub struct EmployeeFilter {
    /// Case-insensitive match on name, id or position.
    pub search: Option<String>,
    pub enrollment: Option<Enrollment>,
}

impl EmployeeFilter {
    pub fn matches(&self, e: &Employee) -> bool {
        let enrollment_ok = match self.enrollment {
            Some(Enrollment::Enrolled) => e.face_enrolled,
            Some(Enrollment::NotEnrolled) => !e.face_enrolled,
            None => true,
        };
        let search_ok = match self.search.as_deref().map(str::trim) {
            Some(s) if !s.is_empty() => {
                let s = s.to_lowercase();
                e.name.to_lowercase().contains(&s)
                    || e.id.to_lowercase().contains(&s)
                    || e.position.to_lowercase().contains(&s)
            }
            _ => true,
        };
        enrollment_ok && search_ok
    }
}

pub fn load(path: &Path) -> Result<Roster, RosterError> {
    let content = fs::read_to_string(path)?;
    let roster: Roster = serde_yaml::from_str(&content)?;
    validate(&roster)?;
    Ok(roster)
}

fn validate(roster: &Roster) -> Result<(), RosterError> {
    for p in &roster.projects {
        if p.id.trim().is_empty() {
            return Err(RosterError::Invalid("project id must be non-empty".into()));
        }
        for e in &p.employees {
            if e.id.trim().is_empty() || e.name.trim().is_empty() {
                return Err(RosterError::Invalid(format!(
                    "employee in project {} needs an id and a name",
                    p.id
                )));
            }
        }
    }
    for s in &roster.supervisors {
        for pid in &s.project_ids {
            if !roster.projects.iter().any(|p| &p.id == pid) {
                return Err(RosterError::Invalid(format!(
                    "supervisor {} references unknown project {}",
                    s.id, pid
                )));
            }
        }
    }
    Ok(())
}

/// Upserts the whole roster in one transaction. Assignments and memberships
/// are replaced by what the file lists; face enrollment is never revoked.
#[instrument(skip_all)]
pub async fn import(pool: &Pool, roster: &Roster) -> Result<(), RosterError> {
    validate(roster)?;
    let mut tx = pool.begin().await?;
    for p in &roster.projects {
        db::upsert_project(&mut tx, &p.id, &p.name, &p.location).await?;
        db::clear_project_employees(&mut tx, &p.id).await?;
        for e in &p.employees {
            db::upsert_project_employee(&mut tx, &p.id, e).await?;
        }
    }
    for s in &roster.supervisors {
        db::upsert_supervisor(&mut tx, s).await?;
    }
    tx.commit().await?;
    info!(
        projects = roster.projects.len(),
        supervisors = roster.supervisors.len(),
        "roster imported"
    );
    Ok(())
}

pub async fn employees(
    pool: &Pool,
    project_id: &str,
    filter: &EmployeeFilter,
) -> Result<Vec<Employee>, RosterError> {
    let all = db::project_employees(pool, project_id).await?;
    Ok(all.into_iter().filter(|e| filter.matches(e)).collect())
}

/// Marks the employee's face as enrolled. False when the employee is unknown.
pub async fn enroll_face(pool: &Pool, employee_id: &str) -> Result<bool, RosterError> {
    Ok(db::set_face_enrolled(pool, employee_id, true).await?)
}

/// Example roster document.
pub fn example() -> &'static str {
    r#"supervisors:
  - id: S001
    name: Hamza Al-Farooq
    email: hamza@tanseeq-investment.com
    projectIds: [P001, P002]

projects:
  - id: P001
    name: Al Madinah Towers
    location: Riyadh, Saudi Arabia
    employees:
      - { id: E001, name: Ahmad Al-Farsi, position: Site Engineer, faceEnrolled: true }
      - { id: E002, name: Mohammed Al-Qasim, position: Construction Worker, faceEnrolled: true }
      - { id: E003, name: Fatima Zahra, position: Safety Officer, faceEnrolled: false }
  - id: P002
    name: Palm Gardens Resort
    location: Dubai, UAE
    employees:
      - { id: E013, name: Nasser Al-Khaldi, position: Painter, faceEnrolled: true }
"#
}

#[cfg(test)]
mod tests {
    use super::*;

    fn employee(name: &str, position: &str, enrolled: bool) -> Employee {
        Employee {
            id: "E100".into(),
            name: name.into(),
            position: position.into(),
            face_enrolled: enrolled,
        }
    }

    #[test]
    fn example_roster_is_valid() {
        let roster: Roster = serde_yaml::from_str(example()).unwrap();
        validate(&roster).unwrap();
        assert_eq!(roster.projects[0].employees.len(), 3);
        assert_eq!(roster.supervisors[0].project_ids, vec!["P001", "P002"]);
    }

    #[test]
    fn unknown_project_reference_is_rejected() {
        let mut roster: Roster = serde_yaml::from_str(example()).unwrap();
        roster.supervisors[0].project_ids.push("P404".into());
        match validate(&roster) {
            Err(RosterError::Invalid(msg)) => assert!(msg.contains("P404")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn employee_filter() {
        let welder = employee("Tariq Aziz", "Welder", false);
        assert!(EmployeeFilter::default().matches(&welder));
        let f = EmployeeFilter {
            search: Some("weld".into()),
            enrollment: Some(Enrollment::NotEnrolled),
        };
        assert!(f.matches(&welder));
        let f = EmployeeFilter {
            search: None,
            enrollment: Some(Enrollment::Enrolled),
        };
        assert!(!f.matches(&welder));
    }
}
