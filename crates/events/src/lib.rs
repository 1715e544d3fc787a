//! Job progress fan-out.
//!
//! - [`ProgressHub`]: per-job publish/subscribe backed by
//!   `tokio::sync::broadcast`.
//! - [`ProgressEvent`]: one status/progress observation for a job.
//! - [`ProgressStream`]: a finite stream of events that ends at the job's
//!   terminal event.

pub mod hub;

pub use hub::{ProgressEvent, ProgressHub, ProgressStream, DEFAULT_CAPACITY, DEFAULT_LINGER};
