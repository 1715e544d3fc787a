//! Row model for the `jobs` table.

use conductor_core::job::{ArtifactRef, Job, JobError, JobErrorKind, JobStatus, StatusId};
use conductor_core::types::Timestamp;
use sqlx::FromRow;

use crate::error::StoreError;

/// A row from the `jobs` table.
#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub id: String,
    pub owner_id: String,
    pub status_id: StatusId,
    pub request_payload: Vec<u8>,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub cancel_requested: bool,
    pub retry_count: i32,
    pub attempts: i32,
    pub result: Option<serde_json::Value>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub worker_owner: Option<String>,
    pub heartbeat_at: Option<Timestamp>,
    pub backend_task_id: Option<String>,
    pub progress: f32,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = JobStatus::from_id(row.status_id).ok_or_else(|| {
            StoreError::Corrupt(format!("job {} has unknown status_id {}", row.id, row.status_id))
        })?;

        let result = row
            .result
            .map(serde_json::from_value::<Vec<ArtifactRef>>)
            .transpose()
            .map_err(|e| StoreError::Corrupt(format!("job {} result: {e}", row.id)))?;

        let error = match row.error_kind {
            Some(kind) => {
                let kind: JobErrorKind = kind.parse()?;
                Some(JobError::new(kind, row.error_message.unwrap_or_default()))
            }
            None => None,
        };

        Ok(Job {
            id: row.id,
            owner_id: row.owner_id,
            status,
            request_payload: row.request_payload,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            cancel_requested: row.cancel_requested,
            retry_count: non_negative(row.retry_count),
            attempts: non_negative(row.attempts),
            result,
            error,
            worker_owner: row.worker_owner,
            heartbeat_at: row.heartbeat_at,
            backend_task_id: row.backend_task_id,
            progress: row.progress,
        })
    }
}

fn non_negative(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}
