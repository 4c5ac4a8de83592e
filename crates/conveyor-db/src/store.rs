//! The persistent job store.
//!
//! Every mutation of a job row goes through here: enqueue (with debounce
//! coalescing), the atomic capacity-bounded claim, outcome handling, the
//! saga sweep, and the two unlock sweeps. The claim and the saga sweep are
//! single atomic steps so concurrent readers can never observe a half-applied
//! transition.

use std::sync::Arc;

use chrono::{Duration, Utc};
use conveyor_core::{
    ExecutionOutcome, JobId, JobStatus, JobStatusDecider, JobTypeRegistry, NewJob, NewJobStatus,
    SagaId,
};
use sqlx::sqlite::Sqlite;
use sqlx::{QueryBuilder, SqliteConnection, SqlitePool, Transaction};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{CompletedJobRecord, DbError, DbResult, JobRecord, SagaRecord};

/// Fixed retry escalation schedule applied to uncaught executor failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Delay before attempt n+1 after the n-th failure.
    pub delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delays: vec![
                Duration::minutes(3),
                Duration::minutes(5),
                Duration::minutes(15),
            ],
        }
    }
}

impl RetryPolicy {
    /// Delay for the retry following the given failure count.
    ///
    /// A missing entry for an in-range attempt is an internal-consistency
    /// error, not a job failure.
    pub fn delay_for(&self, failed_retries: u32) -> DbResult<Duration> {
        self.delays.get(failed_retries as usize).copied().ok_or_else(|| {
            DbError::Integrity(format!(
                "no retry delay configured for attempt {failed_retries}"
            ))
        })
    }
}

/// Per-tick read of free dispatch slots per category. Derived from live
/// channel occupancy; never persisted.
#[derive(Debug, Clone, Copy, Default)]
pub struct CapacitySnapshot {
    pub normal: usize,
    pub long_running: usize,
    pub db_only: usize,
}

impl CapacitySnapshot {
    pub fn is_empty(&self) -> bool {
        self.normal == 0 && self.long_running == 0 && self.db_only == 0
    }
}

/// One entry of a bulk enqueue. Bulk inserts never debounce.
#[derive(Debug, Clone)]
pub struct BulkJob {
    pub job_type: String,
    pub definition: String,
    pub correlation_id: Uuid,
    pub saga_id: Option<SagaId>,
}

impl BulkJob {
    pub fn new(job_type: impl Into<String>, definition: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            definition: definition.into(),
            correlation_id: Uuid::new_v4(),
            saga_id: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_saga_id(mut self, saga_id: SagaId) -> Self {
        self.saga_id = Some(saga_id);
        self
    }
}

/// Atomic, capacity-bounded claim: rank pending eligible jobs by priority
/// within each category, cut each category at its free-slot count, cap the
/// batch globally by id order, and flip the winners to processing in the same
/// statement.
const CLAIM_SQL: &str = r#"
    UPDATE jobs SET
        status = 'processing',
        processing_started_at = ?1,
        debounce_id = NULL
    WHERE id IN (
        SELECT id FROM (
            SELECT id, category,
                   ROW_NUMBER() OVER (
                       PARTITION BY category
                       ORDER BY priority ASC, id ASC
                   ) AS category_rank
            FROM jobs
            WHERE status = 'pending' AND execute_after_date <= ?1
        )
        WHERE (category = 'normal' AND category_rank <= ?2)
           OR (category = 'long_running' AND category_rank <= ?3)
           OR (category = 'db_only' AND category_rank <= ?4)
        ORDER BY id ASC
        LIMIT ?5
    )
    RETURNING *
"#;

const INSERT_JOB_SQL: &str = r#"
    INSERT INTO jobs (correlation_id, job_type, category, priority, definition, status,
                      failed_retries_count, enqueued_at, execute_after_date, debounce_id, saga_id)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8, ?9, ?10)
    ON CONFLICT DO NOTHING
    RETURNING id
"#;

/// The job store. Cheap to clone; all clones share the pool.
#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
    registry: Arc<JobTypeRegistry>,
    decider: Arc<dyn JobStatusDecider>,
    retry_policy: RetryPolicy,
}

impl JobStore {
    pub fn new(
        pool: SqlitePool,
        registry: Arc<JobTypeRegistry>,
        decider: Arc<dyn JobStatusDecider>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            pool,
            registry,
            decider,
            retry_policy,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn registry(&self) -> &JobTypeRegistry {
        &self.registry
    }

    /// Initial status a job of this type would get right now.
    pub fn new_job_status(&self, job_type: &str) -> NewJobStatus {
        self.decider.status_for(job_type)
    }

    /// Open a write transaction. Used by the db-only consumer to couple an
    /// executor's own writes with the outcome update.
    pub async fn begin(&self) -> DbResult<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    /// Insert a new job, or coalesce into an existing pending row when the
    /// debounce key collides (the existing row's `execute_after_date` is
    /// extended to the max of the two).
    ///
    /// Returns `None` when nothing was written.
    pub async fn enqueue(&self, job: NewJob) -> DbResult<Option<JobId>> {
        let info = *self.registry.require(&job.job_type)?;
        let status = self.decider.status_for(&job.job_type).as_job_status();

        let mut tx = self.pool.begin().await?;

        if let Some(key) = &job.debounce_id {
            let coalesced: Option<(i64,)> = sqlx::query_as(
                r#"
                UPDATE jobs SET execute_after_date = MAX(execute_after_date, ?1)
                WHERE debounce_id = ?2 AND status = 'pending'
                RETURNING id
                "#,
            )
            .bind(job.execute_after)
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some((id,)) = coalesced {
                tx.commit().await?;
                debug!(
                    job = %format!("{}#{}", job.job_type, id),
                    debounce_id = %key,
                    "Coalesced enqueue into existing pending job"
                );
                return Ok(Some(JobId::new(id)));
            }
        }

        let inserted: Option<(i64,)> = sqlx::query_as(INSERT_JOB_SQL)
            .bind(job.correlation_id.to_string())
            .bind(&job.job_type)
            .bind(info.category.as_str())
            .bind(info.priority)
            .bind(&job.definition)
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(job.execute_after)
            .bind(&job.debounce_id)
            .bind(job.saga_id.map(|s| s.as_i64()))
            .fetch_optional(&mut *tx)
            .await?;
        tx.commit().await?;

        match inserted {
            Some((id,)) => {
                debug!(
                    job = %format!("{}#{}", job.job_type, id),
                    status = %status,
                    "Enqueued job"
                );
                Ok(Some(JobId::new(id)))
            }
            None => {
                debug!(job_type = %job.job_type, "Enqueue wrote nothing");
                Ok(None)
            }
        }
    }

    /// Like [`enqueue`](Self::enqueue), but an empty result is an error.
    pub async fn enqueue_or_error(&self, job: NewJob) -> DbResult<JobId> {
        let job_type = job.job_type.clone();
        self.enqueue(job).await?.ok_or_else(|| {
            DbError::Integrity(format!("enqueue of '{job_type}' wrote no row"))
        })
    }

    /// Insert a batch of jobs as one atomic set-based insert. No debouncing.
    ///
    /// The whole call fails (and rolls back) unless exactly one row per input
    /// was written.
    pub async fn enqueue_bulk(
        &self,
        jobs: Vec<BulkJob>,
        execute_after: chrono::DateTime<Utc>,
    ) -> DbResult<Vec<JobId>> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        // Resolve metadata up front so a bad type aborts before any write.
        let mut rows = Vec::with_capacity(jobs.len());
        for job in &jobs {
            let info = *self.registry.require(&job.job_type)?;
            let status = self.decider.status_for(&job.job_type).as_job_status();
            rows.push((job, info, status));
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT INTO jobs (correlation_id, job_type, category, priority, definition, status, \
             failed_retries_count, enqueued_at, execute_after_date, saga_id) ",
        );
        qb.push_values(rows.iter(), |mut b, (job, info, status)| {
            b.push_bind(job.correlation_id.to_string())
                .push_bind(&job.job_type)
                .push_bind(info.category.as_str())
                .push_bind(info.priority)
                .push_bind(&job.definition)
                .push_bind(status.as_str())
                .push_bind(0i64)
                .push_bind(now)
                .push_bind(execute_after)
                .push_bind(job.saga_id.map(|s| s.as_i64()));
        });
        qb.push(" RETURNING id");

        let ids: Vec<(i64,)> = qb.build_query_as().fetch_all(&mut *tx).await?;
        if ids.len() != jobs.len() {
            // Dropping the transaction rolls the insert back.
            return Err(DbError::Integrity(format!(
                "bulk enqueue wrote {} rows, expected {}",
                ids.len(),
                jobs.len()
            )));
        }
        tx.commit().await?;

        debug!(count = ids.len(), "Bulk enqueued jobs");
        Ok(ids.into_iter().map(|(id,)| JobId::new(id)).collect())
    }

    /// Open a completion barrier: once every job referencing the returned id
    /// has left the live table, the next producer tick converts the saga into
    /// its on-completion job.
    pub async fn insert_saga(
        &self,
        correlation_id: Uuid,
        on_completed_job_type: &str,
        on_completed_definition: &str,
    ) -> DbResult<SagaId> {
        self.registry.require(on_completed_job_type)?;

        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO sagas (on_completed_job_type, on_completed_definition, correlation_id)
            VALUES (?1, ?2, ?3)
            RETURNING id
            "#,
        )
        .bind(on_completed_job_type)
        .bind(on_completed_definition)
        .bind(correlation_id.to_string())
        .fetch_one(&self.pool)
        .await?;

        debug!(saga_id = id, job_type = %on_completed_job_type, "Opened saga");
        Ok(SagaId::new(id))
    }

    /// Claim up to `batch_size` eligible jobs within the given per-category
    /// capacity, flipping them to processing in the same statement.
    ///
    /// Returned jobs are ordered by (priority, id) so dispatch follows claim
    /// order.
    pub async fn claim_batch(
        &self,
        caps: CapacitySnapshot,
        batch_size: usize,
    ) -> DbResult<Vec<JobRecord>> {
        if caps.is_empty() || batch_size == 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let mut jobs: Vec<JobRecord> = sqlx::query_as(CLAIM_SQL)
            .bind(now)
            .bind(caps.normal as i64)
            .bind(caps.long_running as i64)
            .bind(caps.db_only as i64)
            .bind(batch_size as i64)
            .fetch_all(&self.pool)
            .await?;
        jobs.sort_by_key(|j| (j.priority, j.id));

        if !jobs.is_empty() {
            debug!(count = jobs.len(), "Claimed job batch");
        }
        Ok(jobs)
    }

    /// Convert every saga with zero remaining member jobs into its
    /// on-completion job. Per saga, delete and insert happen in one
    /// transaction, so there is no window where a saga is ready but not yet
    /// converted.
    ///
    /// A ready saga whose on-completion type is no longer registered (its
    /// executor was removed in a later deployment) is logged and left in
    /// place for operators; it must not stall the sweep or the producer.
    pub async fn sweep_completed_sagas(&self) -> DbResult<Vec<JobId>> {
        let mut tx = self.pool.begin().await?;

        let sagas: Vec<SagaRecord> = sqlx::query_as(
            r#"
            SELECT * FROM sagas
            WHERE NOT EXISTS (SELECT 1 FROM jobs WHERE jobs.saga_id = sagas.id)
            "#,
        )
        .fetch_all(&mut *tx)
        .await?;

        let mut promoted = Vec::with_capacity(sagas.len());
        for saga in &sagas {
            let Some(info) = self.registry.get(&saga.on_completed_job_type).copied() else {
                error!(
                    saga_id = saga.id,
                    job_type = %saga.on_completed_job_type,
                    "Completed saga references an unregistered job type; leaving it unconverted"
                );
                continue;
            };
            let status = self
                .decider
                .status_for(&saga.on_completed_job_type)
                .as_job_status();

            sqlx::query("DELETE FROM sagas WHERE id = ?1")
                .bind(saga.id)
                .execute(&mut *tx)
                .await?;

            let (id,): (i64,) = sqlx::query_as(INSERT_JOB_SQL)
                .bind(&saga.correlation_id)
                .bind(&saga.on_completed_job_type)
                .bind(info.category.as_str())
                .bind(info.priority)
                .bind(&saga.on_completed_definition)
                .bind(status.as_str())
                .bind(Utc::now())
                .bind(Utc::now())
                .bind(Option::<String>::None)
                .bind(Option::<i64>::None)
                .fetch_one(&mut *tx)
                .await?;

            info!(
                saga_id = saga.id,
                job = %format!("{}#{}", saga.on_completed_job_type, id),
                "Promoted completed saga into follow-up job"
            );
            promoted.push(JobId::new(id));
        }

        tx.commit().await?;
        Ok(promoted)
    }

    /// Crash recovery, run once at startup: any job still marked processing
    /// was owned by a process that no longer exists, so flip it back to
    /// pending.
    pub async fn unlock_stale_processing_jobs(&self) -> DbResult<Vec<JobId>> {
        let ids: Vec<(i64,)> = sqlx::query_as(
            r#"
            UPDATE jobs SET status = 'pending', processing_started_at = NULL
            WHERE status = 'processing'
            RETURNING id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        if !ids.is_empty() {
            warn!(
                count = ids.len(),
                "Recovered jobs stuck in processing from a previous run"
            );
        }
        Ok(ids.into_iter().map(|(id,)| JobId::new(id)).collect())
    }

    /// Re-evaluate every distinct blocked job type through the decision
    /// engine and flip now-admissible rows back to pending. Run on a slow
    /// timer by the producer.
    pub async fn unlock_blocked_jobs(&self) -> DbResult<u64> {
        let types: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT job_type FROM jobs WHERE status = 'blocked'")
                .fetch_all(&self.pool)
                .await?;

        let mut unlocked = 0;
        for (job_type,) in types {
            if self.decider.status_for(&job_type) != NewJobStatus::Pending {
                continue;
            }
            let result = sqlx::query(
                "UPDATE jobs SET status = 'pending' WHERE status = 'blocked' AND job_type = ?1",
            )
            .bind(&job_type)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() > 0 {
                info!(
                    job_type = %job_type,
                    count = result.rows_affected(),
                    "Unblocked jobs whose dependency became available"
                );
                unlocked += result.rows_affected();
            }
        }
        Ok(unlocked)
    }

    /// Apply a deliberate executor outcome in its own transaction.
    pub async fn handle_success(&self, job: &JobRecord, outcome: ExecutionOutcome) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        Self::apply_outcome_in(&mut tx, job, outcome).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Apply a deliberate executor outcome against an already-open
    /// transaction. Used by the db-only consumer so the executor's own writes
    /// and the outcome commit together.
    pub async fn apply_outcome_in(
        conn: &mut SqliteConnection,
        job: &JobRecord,
        outcome: ExecutionOutcome,
    ) -> DbResult<()> {
        let now = Utc::now();
        match outcome {
            ExecutionOutcome::Success => {
                sqlx::query(
                    r#"
                    INSERT INTO completed_jobs (job_id, job_type, definition, failed_retries_count,
                                                enqueued_at, execute_after_date, completed_at,
                                                correlation_id)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                    "#,
                )
                .bind(job.id)
                .bind(&job.job_type)
                .bind(&job.definition)
                .bind(job.failed_retries_count)
                .bind(job.enqueued_at)
                .bind(job.execute_after_date)
                .bind(now)
                .bind(&job.correlation_id)
                .execute(&mut *conn)
                .await?;

                sqlx::query("DELETE FROM jobs WHERE id = ?1")
                    .bind(job.id)
                    .execute(&mut *conn)
                    .await?;

                let elapsed_ms = job
                    .processing_started_at
                    .map(|started| (now - started).num_milliseconds())
                    .unwrap_or(0);
                info!(job = %job.identity(), elapsed_ms, "Job completed");
            }
            ExecutionOutcome::Blocked => {
                sqlx::query(
                    "UPDATE jobs SET status = 'blocked', processing_started_at = NULL \
                     WHERE id = ?1",
                )
                .bind(job.id)
                .execute(&mut *conn)
                .await?;
                warn!(job = %job.identity(), "Job blocked on unavailable dependency");
            }
            ExecutionOutcome::NeedsRetry(delay) => {
                sqlx::query(
                    "UPDATE jobs SET status = 'pending', processing_started_at = NULL, \
                     execute_after_date = ?1 WHERE id = ?2",
                )
                .bind(now + delay)
                .bind(job.id)
                .execute(&mut *conn)
                .await?;
                warn!(
                    job = %job.identity(),
                    delay_secs = delay.num_seconds(),
                    "External work still in flight; rescheduled"
                );
            }
        }
        Ok(())
    }

    /// Apply the retry policy to an uncaught executor failure.
    pub async fn handle_failure(&self, job: &JobRecord, cause: &anyhow::Error) -> DbResult<()> {
        let failed_retries = job.failed_retries_count as u32;
        if failed_retries < self.retry_policy.max_retries {
            let delay = self.retry_policy.delay_for(failed_retries)?;
            sqlx::query(
                r#"
                UPDATE jobs SET status = 'pending', processing_started_at = NULL,
                                failed_retries_count = failed_retries_count + 1,
                                execute_after_date = ?1
                WHERE id = ?2
                "#,
            )
            .bind(Utc::now() + delay)
            .bind(job.id)
            .execute(&self.pool)
            .await?;
            warn!(
                job = %job.identity(),
                attempt = failed_retries + 1,
                delay_secs = delay.num_seconds(),
                error = %cause,
                "Job failed; retry scheduled"
            );
        } else {
            // Detach from any saga: a permanently failed member counts as
            // having left the barrier, same as a completed one.
            sqlx::query(
                "UPDATE jobs SET status = 'failed', processing_started_at = NULL, \
                 saga_id = NULL WHERE id = ?1",
            )
            .bind(job.id)
            .execute(&self.pool)
            .await?;
            error!(
                job = %job.identity(),
                retries = failed_retries,
                error = %cause,
                "Job failed permanently after exhausting retries"
            );
        }
        Ok(())
    }

    pub async fn get_job(&self, id: JobId) -> DbResult<Option<JobRecord>> {
        let job = sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs WHERE id = ?1")
            .bind(id.as_i64())
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    pub async fn count_by_status(&self, status: JobStatus) -> DbResult<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM jobs WHERE status = ?1")
                .bind(status.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    pub async fn list_completed(&self, limit: i64) -> DbResult<Vec<CompletedJobRecord>> {
        let rows = sqlx::query_as::<_, CompletedJobRecord>(
            "SELECT * FROM completed_jobs ORDER BY completed_at DESC, id DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::{AlwaysPending, JobCategory, JobTypeInfo, RuleSetDecider};
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn test_registry() -> Arc<JobTypeRegistry> {
        Arc::new(
            JobTypeRegistry::from_entries([
                (
                    "send-email",
                    JobTypeInfo {
                        category: JobCategory::Normal,
                        priority: 10,
                    },
                ),
                (
                    "recompute-size",
                    JobTypeInfo {
                        category: JobCategory::Normal,
                        priority: 20,
                    },
                ),
                (
                    "poll-analysis",
                    JobTypeInfo {
                        category: JobCategory::LongRunning,
                        priority: 50,
                    },
                ),
                (
                    "apply-rows",
                    JobTypeInfo {
                        category: JobCategory::DbOnly,
                        priority: 10,
                    },
                ),
            ])
            .unwrap(),
        )
    }

    async fn store_with(decider: Arc<dyn JobStatusDecider>) -> JobStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::run_migrations(&pool).await.unwrap();
        JobStore::new(pool, test_registry(), decider, RetryPolicy::default())
    }

    async fn store() -> JobStore {
        store_with(Arc::new(AlwaysPending)).await
    }

    fn all_caps() -> CapacitySnapshot {
        CapacitySnapshot {
            normal: 100,
            long_running: 100,
            db_only: 100,
        }
    }

    #[tokio::test]
    async fn test_enqueue_inserts_pending_job() {
        let store = store().await;
        let id = store
            .enqueue_or_error(NewJob::new("send-email", "{}"))
            .await
            .unwrap();

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, "pending");
        assert_eq!(job.category, "normal");
        assert_eq!(job.priority, 10);
        assert_eq!(job.failed_retries_count, 0);
    }

    #[tokio::test]
    async fn test_enqueue_unknown_type_rejected() {
        let store = store().await;
        let result = store.enqueue(NewJob::new("no-such-type", "{}")).await;
        assert!(matches!(
            result,
            Err(DbError::Domain(conveyor_core::Error::UnknownJobType(_)))
        ));
    }

    #[tokio::test]
    async fn test_debounce_coalesces_to_max_execute_after() {
        let store = store().await;
        let later = Utc::now() + Duration::minutes(10);
        let earlier = Utc::now() + Duration::minutes(5);

        let first = store
            .enqueue_or_error(
                NewJob::new("recompute-size", "{}")
                    .with_debounce_id("ws-1")
                    .with_execute_after(later),
            )
            .await
            .unwrap();
        let second = store
            .enqueue_or_error(
                NewJob::new("recompute-size", "{}")
                    .with_debounce_id("ws-1")
                    .with_execute_after(earlier),
            )
            .await
            .unwrap();

        // One live row, keeping the later of the two dates.
        assert_eq!(first, second);
        assert_eq!(store.count_by_status(JobStatus::Pending).await.unwrap(), 1);
        let job = store.get_job(first).await.unwrap().unwrap();
        assert!((job.execute_after_date - later).num_milliseconds().abs() < 10);

        // A still-later enqueue pushes the date forward.
        let latest = Utc::now() + Duration::minutes(30);
        store
            .enqueue_or_error(
                NewJob::new("recompute-size", "{}")
                    .with_debounce_id("ws-1")
                    .with_execute_after(latest),
            )
            .await
            .unwrap();
        let job = store.get_job(first).await.unwrap().unwrap();
        assert!((job.execute_after_date - latest).num_milliseconds().abs() < 10);
    }

    #[tokio::test]
    async fn test_debounce_key_cleared_on_claim() {
        let store = store().await;
        let id = store
            .enqueue_or_error(NewJob::new("recompute-size", "{}").with_debounce_id("ws-9"))
            .await
            .unwrap();

        let claimed = store.claim_batch(all_caps(), 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].debounce_id, None);
        assert!(claimed[0].processing_started_at.is_some());

        // The key is free again: a new enqueue inserts a fresh row.
        let fresh = store
            .enqueue_or_error(NewJob::new("recompute-size", "{}").with_debounce_id("ws-9"))
            .await
            .unwrap();
        assert_ne!(fresh, id);
    }

    #[tokio::test]
    async fn test_bulk_enqueue_inserts_all_rows() {
        let store = store().await;
        let jobs = vec![
            BulkJob::new("send-email", "{\"to\":\"a\"}"),
            BulkJob::new("send-email", "{\"to\":\"b\"}"),
            BulkJob::new("poll-analysis", "{}"),
        ];
        let ids = store.enqueue_bulk(jobs, Utc::now()).await.unwrap();
        assert_eq!(ids.len(), 3);
        assert_eq!(store.count_by_status(JobStatus::Pending).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_bulk_enqueue_unknown_type_writes_nothing() {
        let store = store().await;
        let jobs = vec![
            BulkJob::new("send-email", "{}"),
            BulkJob::new("no-such-type", "{}"),
        ];
        assert!(store.enqueue_bulk(jobs, Utc::now()).await.is_err());
        assert_eq!(store.count_by_status(JobStatus::Pending).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_claim_respects_priority_within_category() {
        let store = store().await;
        // recompute-size has priority 20, send-email 10. Insertion order is
        // deliberately reversed.
        let low_prio = store
            .enqueue_or_error(NewJob::new("recompute-size", "{}"))
            .await
            .unwrap();
        let high_prio = store
            .enqueue_or_error(NewJob::new("send-email", "{}"))
            .await
            .unwrap();

        let caps = CapacitySnapshot {
            normal: 1,
            ..Default::default()
        };
        let claimed = store.claim_batch(caps, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].job_id(), high_prio);

        let claimed = store.claim_batch(caps, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].job_id(), low_prio);
    }

    #[tokio::test]
    async fn test_claim_bounded_per_category() {
        let store = store().await;
        for _ in 0..5 {
            store
                .enqueue_or_error(NewJob::new("send-email", "{}"))
                .await
                .unwrap();
        }
        for _ in 0..3 {
            store
                .enqueue_or_error(NewJob::new("poll-analysis", "{}"))
                .await
                .unwrap();
        }

        let caps = CapacitySnapshot {
            normal: 2,
            long_running: 1,
            db_only: 4,
        };
        let claimed = store.claim_batch(caps, 10).await.unwrap();
        let normal = claimed.iter().filter(|j| j.category == "normal").count();
        let long_running = claimed
            .iter()
            .filter(|j| j.category == "long_running")
            .count();
        assert_eq!(normal, 2);
        assert_eq!(long_running, 1);
        assert_eq!(store.count_by_status(JobStatus::Processing).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_claim_skips_future_jobs() {
        let store = store().await;
        store
            .enqueue_or_error(
                NewJob::new("send-email", "{}")
                    .with_execute_after(Utc::now() + Duration::hours(1)),
            )
            .await
            .unwrap();

        let claimed = store.claim_batch(all_caps(), 10).await.unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn test_claim_with_zero_capacity_is_empty() {
        let store = store().await;
        store
            .enqueue_or_error(NewJob::new("send-email", "{}"))
            .await
            .unwrap();

        let claimed = store
            .claim_batch(CapacitySnapshot::default(), 10)
            .await
            .unwrap();
        assert!(claimed.is_empty());
        assert_eq!(store.count_by_status(JobStatus::Pending).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_success_archives_and_deletes() {
        let store = store().await;
        let id = store
            .enqueue_or_error(NewJob::new("send-email", "{\"to\":\"x\"}"))
            .await
            .unwrap();
        let claimed = store.claim_batch(all_caps(), 10).await.unwrap();

        store
            .handle_success(&claimed[0], ExecutionOutcome::Success)
            .await
            .unwrap();

        assert!(store.get_job(id).await.unwrap().is_none());
        let completed = store.list_completed(10).await.unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].job_id, id.as_i64());
        assert_eq!(completed[0].job_type, "send-email");
        assert_eq!(completed[0].definition, "{\"to\":\"x\"}");
    }

    #[tokio::test]
    async fn test_needs_retry_reschedules_with_delay() {
        let store = store().await;
        let id = store
            .enqueue_or_error(NewJob::new("poll-analysis", "{}"))
            .await
            .unwrap();
        let claimed = store.claim_batch(all_caps(), 10).await.unwrap();

        store
            .handle_success(
                &claimed[0],
                ExecutionOutcome::NeedsRetry(Duration::minutes(2)),
            )
            .await
            .unwrap();

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, "pending");
        assert_eq!(job.failed_retries_count, 0);
        assert!(job.execute_after_date > Utc::now() + Duration::minutes(1));
    }

    #[tokio::test]
    async fn test_failure_follows_fixed_retry_schedule() {
        let store = store().await;
        let id = store
            .enqueue_or_error(NewJob::new("send-email", "{}"))
            .await
            .unwrap();

        let expected_minutes = [3i64, 5, 15];
        for (attempt, minutes) in expected_minutes.iter().enumerate() {
            let claimed = store.claim_batch(all_caps(), 10).await.unwrap();
            assert_eq!(claimed.len(), 1, "attempt {attempt} should be claimable");

            // Make the job immediately eligible again for the next round.
            store
                .handle_failure(&claimed[0], &anyhow::anyhow!("smtp down"))
                .await
                .unwrap();
            let job = store.get_job(id).await.unwrap().unwrap();
            assert_eq!(job.status, "pending");
            assert_eq!(job.failed_retries_count as usize, attempt + 1);
            let delay = job.execute_after_date - Utc::now();
            assert!(
                (delay.num_minutes() - minutes).abs() <= 1,
                "attempt {attempt}: expected ~{minutes}min, got {delay}"
            );
            sqlx::query("UPDATE jobs SET execute_after_date = ?1 WHERE id = ?2")
                .bind(Utc::now() - Duration::seconds(1))
                .bind(id.as_i64())
                .execute(store.pool())
                .await
                .unwrap();
        }

        // Fourth failure is terminal.
        let claimed = store.claim_batch(all_caps(), 10).await.unwrap();
        store
            .handle_failure(&claimed[0], &anyhow::anyhow!("smtp down"))
            .await
            .unwrap();
        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, "failed");

        // And it is never claimed again.
        assert!(store.claim_batch(all_caps(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_blocked_type_parks_and_unlocks() {
        let mail_configured = Arc::new(AtomicBool::new(false));
        let flag = mail_configured.clone();
        let decider = RuleSetDecider::new().with_rule("send-email", move || {
            if flag.load(Ordering::SeqCst) {
                NewJobStatus::Pending
            } else {
                NewJobStatus::Blocked
            }
        });
        let store = store_with(Arc::new(decider)).await;

        let id = store
            .enqueue_or_error(NewJob::new("send-email", "{}"))
            .await
            .unwrap();
        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, "blocked");
        assert!(store.claim_batch(all_caps(), 10).await.unwrap().is_empty());

        // Still blocked: the sweep leaves it parked.
        assert_eq!(store.unlock_blocked_jobs().await.unwrap(), 0);

        mail_configured.store(true, Ordering::SeqCst);
        assert_eq!(store.unlock_blocked_jobs().await.unwrap(), 1);
        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, "pending");
        assert_eq!(store.claim_batch(all_caps(), 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_processing_jobs_recovered() {
        let store = store().await;
        store
            .enqueue_or_error(NewJob::new("send-email", "{}"))
            .await
            .unwrap();
        let claimed = store.claim_batch(all_caps(), 10).await.unwrap();
        assert_eq!(claimed.len(), 1);

        // Simulated restart: the claimed job was never reported.
        let recovered = store.unlock_stale_processing_jobs().await.unwrap();
        assert_eq!(recovered, vec![claimed[0].job_id()]);
        let job = store.get_job(claimed[0].job_id()).await.unwrap().unwrap();
        assert_eq!(job.status, "pending");
        assert!(job.processing_started_at.is_none());
    }

    #[tokio::test]
    async fn test_saga_promotes_only_after_all_members_leave() {
        let store = store().await;
        let correlation = Uuid::new_v4();
        let saga = store
            .insert_saga(correlation, "recompute-size", "{\"ws\":1}")
            .await
            .unwrap();

        let members = store
            .enqueue_bulk(
                vec![
                    BulkJob::new("send-email", "{}").with_saga_id(saga),
                    BulkJob::new("send-email", "{}").with_saga_id(saga),
                    BulkJob::new("poll-analysis", "{}").with_saga_id(saga),
                ],
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(members.len(), 3);

        // Nothing to promote while members remain.
        assert!(store.sweep_completed_sagas().await.unwrap().is_empty());

        let claimed = store.claim_batch(all_caps(), 10).await.unwrap();
        assert_eq!(claimed.len(), 3);
        for (i, job) in claimed.iter().enumerate() {
            store
                .handle_success(job, ExecutionOutcome::Success)
                .await
                .unwrap();
            let promoted = store.sweep_completed_sagas().await.unwrap();
            if i < claimed.len() - 1 {
                assert!(promoted.is_empty(), "promoted before member {i} finished");
            } else {
                assert_eq!(promoted.len(), 1);
                let follow_up = store.get_job(promoted[0]).await.unwrap().unwrap();
                assert_eq!(follow_up.job_type, "recompute-size");
                assert_eq!(follow_up.definition, "{\"ws\":1}");
                assert_eq!(follow_up.correlation(), correlation);
            }
        }

        // The saga is gone; a second sweep is a no-op.
        assert!(store.sweep_completed_sagas().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_saga_counts_failed_members_as_left() {
        let store = store().await;
        let saga = store
            .insert_saga(Uuid::new_v4(), "recompute-size", "{}")
            .await
            .unwrap();
        store
            .enqueue_or_error(NewJob::new("send-email", "{}").with_saga_id(saga))
            .await
            .unwrap();

        // Retries still reference the saga, so it is not ready.
        let claimed = store.claim_batch(all_caps(), 10).await.unwrap();
        for attempt in 0..4 {
            let job = store.get_job(claimed[0].job_id()).await.unwrap().unwrap();
            store
                .handle_failure(&job, &anyhow::anyhow!("boom"))
                .await
                .unwrap();
            if attempt < 3 {
                assert!(store.sweep_completed_sagas().await.unwrap().is_empty());
            }
        }

        // The terminal failure detaches the member; the saga becomes ready
        // even though the failed row still exists.
        let job = store.get_job(claimed[0].job_id()).await.unwrap().unwrap();
        assert_eq!(job.status, "failed");
        assert_eq!(job.saga_id, None);
        assert_eq!(store.sweep_completed_sagas().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_saga_with_unregistered_type_skipped_not_fatal() {
        let store = store().await;

        // A row written by an earlier deployment whose executor no longer
        // exists. insert_saga validates the type, so write it directly.
        sqlx::query(
            "INSERT INTO sagas (on_completed_job_type, on_completed_definition, correlation_id) \
             VALUES ('ghost-type', '{}', ?1)",
        )
        .bind(Uuid::new_v4().to_string())
        .execute(store.pool())
        .await
        .unwrap();

        let healthy = store
            .insert_saga(Uuid::new_v4(), "recompute-size", "{}")
            .await
            .unwrap();

        // Both sagas are ready (no members). The ghost is skipped, the
        // healthy one still converts.
        let promoted = store.sweep_completed_sagas().await.unwrap();
        assert_eq!(promoted.len(), 1);
        let follow_up = store.get_job(promoted[0]).await.unwrap().unwrap();
        assert_eq!(follow_up.job_type, "recompute-size");

        // The ghost row survives for operators, and repeated sweeps stay
        // harmless.
        let ghosts: Vec<SagaRecord> = sqlx::query_as("SELECT * FROM sagas")
            .fetch_all(store.pool())
            .await
            .unwrap();
        assert_eq!(ghosts.len(), 1);
        assert_eq!(ghosts[0].on_completed_job_type, "ghost-type");
        assert_ne!(ghosts[0].id, healthy.as_i64());
        assert!(store.sweep_completed_sagas().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retry_policy_missing_entry_is_integrity_error() {
        let policy = RetryPolicy {
            max_retries: 3,
            delays: vec![Duration::minutes(3)],
        };
        assert!(policy.delay_for(0).is_ok());
        assert!(matches!(policy.delay_for(2), Err(DbError::Integrity(_))));
    }
}
