//! Persistent job store for the Conveyor job queue.
//!
//! Backed by SQLite through sqlx. The job table is the single source of
//! truth: the in-memory dispatch channels are rebuildable from it, and the
//! startup recovery sweep makes a crash mid-execution equivalent to a retry.

pub mod error;
pub mod executor;
pub mod record;
pub mod store;

pub use error::{DbError, DbResult};
pub use executor::{DbExecution, DbJobExecutor};
pub use record::{CompletedJobRecord, JobRecord, SagaRecord};
pub use store::{BulkJob, CapacitySnapshot, JobStore, RetryPolicy};

use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

/// Create a new database connection pool.
///
/// SQLite serializes writes, so a small pool is enough; the producer and the
/// consumer pools all share it.
pub async fn create_pool(database_url: &str) -> DbResult<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &SqlitePool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
