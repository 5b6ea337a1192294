use crate::model::AttendanceRecord;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Debug)]
pub struct SyncRequest<'a> {
    pub records: &'a [AttendanceRecord],
}

#[derive(Deserialize, Debug, Default)]
pub struct SyncResponse {
    #[serde(default)]
    pub accepted: Option<usize>,
}
