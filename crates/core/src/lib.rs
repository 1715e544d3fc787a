//! Domain model for the compute-job orchestration layer.
//!
//! Everything in this crate is pure: the [`job::Job`] entity and its state
//! machine, the token-bucket arithmetic behind rate limiting, recovery
//! policy decisions, submission validation and a [`clock::Clock`]
//! abstraction. Storage, queues and the worker runtime live in the
//! downstream crates and delegate their transition rules here.

pub mod clock;
pub mod error;
pub mod idempotency;
pub mod job;
pub mod job_events;
pub mod metric_names;
pub mod rate_limit;
pub mod recovery;
pub mod types;
pub mod validation;
