//! Core domain types and traits for the Conveyor job queue.
//!
//! This crate contains:
//! - Job identifiers, statuses, and dispatch categories
//! - The executor trait and execution outcomes
//! - The job type registry (category + priority per job type)
//! - The status decision engine (initial Pending/Blocked policy)
//!
//! It deliberately knows nothing about persistence or scheduling; those live
//! in `conveyor-db` and `conveyor-scheduler`.

pub mod decider;
pub mod error;
pub mod executor;
pub mod job;
pub mod registry;

pub use decider::{AlwaysPending, JobStatusDecider, RuleSetDecider};
pub use error::{Error, Result};
pub use executor::{ExecutionOutcome, JobExecutor};
pub use job::{JobCategory, JobId, JobStatus, NewJob, NewJobStatus, SagaId};
pub use registry::{JobTypeInfo, JobTypeRegistry};
