//! Row model for the `job_queue` table.

use sqlx::FromRow;
use uuid::Uuid;

use crate::store::Delivery;

#[derive(Debug, Clone, FromRow)]
pub struct QueueRow {
    pub job_id: String,
    pub receipt: Uuid,
    pub delivery_count: i32,
}

impl From<QueueRow> for Delivery {
    fn from(row: QueueRow) -> Self {
        Self {
            job_id: row.job_id,
            receipt: row.receipt.to_string(),
            delivery_count: u32::try_from(row.delivery_count).unwrap_or(0),
        }
    }
}
