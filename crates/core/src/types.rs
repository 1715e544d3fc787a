/// Opaque, globally unique job identifier (UUID v7 rendered as a string).
pub type JobId = String;

/// Tenant / caller identity as resolved by the identity provider.
pub type OwnerId = String;

/// Identifier of a single worker unit (unique per process and slot).
pub type WorkerId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Generate a fresh job id.
///
/// UUID v7 keeps ids roughly ordered by creation time, which makes
/// store scans and log correlation easier.
pub fn new_job_id() -> JobId {
    uuid::Uuid::now_v7().to_string()
}
