//! Executor trait and execution outcomes.
//!
//! Executors are the product-side seam: the core hands them a serialized
//! definition and a correlation id, and only cares about the outcome.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::JobCategory;

/// Outcome reported by an executor that ran to completion.
///
/// An executor that returns `Err` instead goes through the retry/backoff
/// policy; these variants are deliberate signals, not failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The work is done. The job is archived and its live row deleted.
    Success,
    /// A required external dependency is unavailable. The job is parked as
    /// Blocked until the periodic unlock sweep re-admits its type.
    Blocked,
    /// External work is still in flight; run again after the given delay.
    NeedsRetry(chrono::Duration),
}

/// Trait for Normal and Long-Running job executors.
///
/// Implementations must be idempotent: delivery is at-least-once, and a crash
/// mid-execution means the job runs again after recovery.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Unique job type this executor handles.
    fn job_type(&self) -> &'static str;

    /// Dispatch category. Must be `Normal` or `LongRunning`; database-coupled
    /// executors implement the trait in `conveyor-db` instead.
    fn category(&self) -> JobCategory;

    /// Dispatch priority within the category. Lower executes first.
    fn priority(&self) -> i32 {
        100
    }

    /// Execute the job.
    ///
    /// `definition` is the JSON payload recorded at enqueue time. Returning
    /// `Err` counts as a transient failure and consumes one retry.
    async fn execute(
        &self,
        definition: &str,
        correlation_id: Uuid,
        cancel: CancellationToken,
    ) -> anyhow::Result<ExecutionOutcome>;
}
