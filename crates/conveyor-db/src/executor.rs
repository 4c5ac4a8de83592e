//! Database-coupled executor trait.
//!
//! DB-only executors run inside the same write transaction as the outcome
//! update, so their row changes and the "mark success" write commit together.
//! Anything that must not happen before the commit (notifications, cache
//! invalidation) goes into the deferred hook.

use async_trait::async_trait;
use conveyor_core::ExecutionOutcome;
use futures::future::BoxFuture;
use sqlx::SqliteConnection;
use uuid::Uuid;

/// Result of a database-coupled execution.
pub struct DbExecution {
    pub outcome: ExecutionOutcome,
    /// Runs strictly after the surrounding transaction is durably committed,
    /// never before. Skipped when the transaction rolls back.
    pub deferred: Option<BoxFuture<'static, ()>>,
}

impl DbExecution {
    pub fn new(outcome: ExecutionOutcome) -> Self {
        Self {
            outcome,
            deferred: None,
        }
    }

    pub fn with_deferred(mut self, deferred: BoxFuture<'static, ()>) -> Self {
        self.deferred = Some(deferred);
        self
    }
}

impl From<ExecutionOutcome> for DbExecution {
    fn from(outcome: ExecutionOutcome) -> Self {
        Self::new(outcome)
    }
}

/// Trait for DB-only job executors.
///
/// Served by a single worker: the transactional coupling assumes outcome
/// writes for this category are never concurrent.
#[async_trait]
pub trait DbJobExecutor: Send + Sync {
    /// Unique job type this executor handles.
    fn job_type(&self) -> &'static str;

    /// Dispatch priority within the db-only category. Lower executes first.
    fn priority(&self) -> i32 {
        100
    }

    /// Execute the job against the open transaction.
    ///
    /// Returning `Err` rolls the transaction back and counts as a transient
    /// failure; the job goes through the normal retry policy.
    async fn execute(
        &self,
        definition: &str,
        correlation_id: Uuid,
        conn: &mut SqliteConnection,
    ) -> anyhow::Result<DbExecution>;
}
