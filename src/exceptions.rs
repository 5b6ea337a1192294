use crate::model::{AttendanceException, AttendanceRecord};

/// Every open record is an exception. Recompute on each read so exceptions
/// can never drift from the records they describe.
pub fn derive_exceptions(records: &[AttendanceRecord]) -> Vec<AttendanceException> {
    records
        .iter()
        .filter(|r| r.is_open())
        .map(|r| AttendanceException {
            id: r.id.clone(),
            employee_id: r.employee_id.clone(),
            employee_name: r.employee_name.clone(),
            check_in_time: r.check_in_time,
            project_id: r.project_id.clone(),
            date: r.date,
        })
        .collect()
}
