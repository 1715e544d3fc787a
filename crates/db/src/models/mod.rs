//! Row types for the PostgreSQL tables and their mapping into domain types.

pub mod job;
pub mod queue;
pub mod rate_limit;
