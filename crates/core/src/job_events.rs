//! Progress message constants published on job channels.
//!
//! Used by the worker executor and the submission service when emitting
//! progress events, and by subscribers that match on them.

/// Job was claimed by a worker and is starting.
pub const MSG_JOB_CLAIMED: &str = "claimed by worker";

/// Job was handed to the backend.
pub const MSG_JOB_SUBMITTED: &str = "submitted to backend";

/// Backend reported progress on a poll tick.
pub const MSG_JOB_PROGRESS: &str = "running";

/// Transient backend failure, retrying.
pub const MSG_JOB_RETRYING: &str = "retrying after transient backend error";

/// Outputs are being uploaded to the artifact store.
pub const MSG_JOB_UPLOADING: &str = "uploading artifacts";

/// Job completed successfully.
pub const MSG_JOB_SUCCEEDED: &str = "completed";

/// Job was cancelled (by user request).
pub const MSG_JOB_CANCELED: &str = "canceled";

/// Job was returned to the queue by crash recovery.
pub const MSG_JOB_REQUEUED: &str = "requeued after worker loss";
