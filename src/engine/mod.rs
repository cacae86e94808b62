//! Execution engine for workflows.
//!
//! Plans a workflow into node instances, then runs them with input-hash
//! caching and records every run in storage.

mod cache;
mod executor;
mod hashing;
mod plan;

pub use cache::{CacheStats, NodeResultRecord, ResultCache, RESULT_FILE};
pub use executor::{ExecutionReport, Executor};
pub use hashing::{canonical, fingerprint_file, hash_inputs, interface_identity, InputHash};
pub use plan::{ExecutionPlan, PlannedInstance};
