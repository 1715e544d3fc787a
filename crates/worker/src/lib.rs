//! Worker side of the orchestration layer.
//!
//! - [`pool`]: N worker units pulling from the work queue.
//! - [`executor`]: one claimed job, from backend submit to terminal state.
//! - [`recovery`]: the crash recovery sweep.
//! - [`maintenance`]: idempotency-key purge.
//! - [`server`]: `/health` and `/metrics`.
//! - [`config`]: environment configuration for the `conductor-worker` binary.

pub mod config;
pub mod executor;
pub mod maintenance;
pub mod pool;
pub mod recovery;
pub mod server;

pub use config::{ConfigError, WorkerConfig};
pub use executor::{Disposition, ExecutorConfig, JobExecutor, WorkerDeps};
pub use pool::{PoolConfig, WorkerPool};
pub use recovery::{RecoveryConfig, RecoverySweep, SweepReport};
