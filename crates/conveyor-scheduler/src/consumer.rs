//! Consumer pools.
//!
//! Normal and long-running pools run N parallel workers over a shared
//! channel. The db-only pool is a single worker whose executors run inside
//! the same transaction as the outcome write.

use std::collections::HashMap;
use std::sync::Arc;

use conveyor_core::{JobCategory, JobExecutor};
use conveyor_db::{DbJobExecutor, JobRecord, JobStore};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

type SharedReceiver = Arc<Mutex<mpsc::Receiver<JobRecord>>>;

/// Executors for one of the channel-fed pools, keyed by job type.
#[derive(Default)]
pub struct ExecutorSet {
    map: HashMap<String, Arc<dyn JobExecutor>>,
}

impl ExecutorSet {
    pub fn new(executors: impl IntoIterator<Item = Arc<dyn JobExecutor>>) -> Self {
        let map = executors
            .into_iter()
            .map(|e| (e.job_type().to_string(), e))
            .collect();
        Self { map }
    }

    pub fn get(&self, job_type: &str) -> Option<&Arc<dyn JobExecutor>> {
        self.map.get(job_type)
    }
}

/// Db-only executors, keyed by job type.
#[derive(Default)]
pub struct DbExecutorSet {
    map: HashMap<String, Arc<dyn DbJobExecutor>>,
}

impl DbExecutorSet {
    pub fn new(executors: impl IntoIterator<Item = Arc<dyn DbJobExecutor>>) -> Self {
        let map = executors
            .into_iter()
            .map(|e| (e.job_type().to_string(), e))
            .collect();
        Self { map }
    }

    pub fn get(&self, job_type: &str) -> Option<&Arc<dyn DbJobExecutor>> {
        self.map.get(job_type)
    }
}

/// A pool of workers for the normal or long-running category.
pub struct ConsumerPool {
    category: JobCategory,
    workers: usize,
    receiver: SharedReceiver,
    executors: Arc<ExecutorSet>,
    store: JobStore,
}

impl ConsumerPool {
    pub fn new(
        category: JobCategory,
        workers: usize,
        receiver: SharedReceiver,
        executors: Arc<ExecutorSet>,
        store: JobStore,
    ) -> Self {
        Self {
            category,
            workers,
            receiver,
            executors,
            store,
        }
    }

    /// Spawn the worker tasks. Each pulls from the shared channel until the
    /// channel closes or the token fires.
    pub fn spawn(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.workers)
            .map(|worker| {
                let category = self.category;
                let receiver = self.receiver.clone();
                let executors = self.executors.clone();
                let store = self.store.clone();
                let cancel = cancel.child_token();
                tokio::spawn(async move {
                    info!(pool = %category, worker, "Worker started");
                    loop {
                        let job = tokio::select! {
                            _ = cancel.cancelled() => break,
                            job = recv(&receiver) => match job {
                                Some(job) => job,
                                None => break,
                            },
                        };
                        execute_one(&executors, &store, job, &cancel).await;
                    }
                    info!(pool = %category, worker, "Worker stopped");
                })
            })
            .collect()
    }
}

/// The single db-only worker.
pub struct DbConsumer {
    receiver: SharedReceiver,
    executors: Arc<DbExecutorSet>,
    store: JobStore,
}

impl DbConsumer {
    pub fn new(receiver: SharedReceiver, executors: Arc<DbExecutorSet>, store: JobStore) -> Self {
        Self {
            receiver,
            executors,
            store,
        }
    }

    pub fn spawn(&self, cancel: &CancellationToken) -> JoinHandle<()> {
        let receiver = self.receiver.clone();
        let executors = self.executors.clone();
        let store = self.store.clone();
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            info!(pool = %JobCategory::DbOnly, "Worker started");
            loop {
                let job = tokio::select! {
                    _ = cancel.cancelled() => break,
                    job = recv(&receiver) => match job {
                        Some(job) => job,
                        None => break,
                    },
                };
                execute_one_db(&executors, &store, job).await;
            }
            info!(pool = %JobCategory::DbOnly, "Worker stopped");
        })
    }
}

async fn recv(receiver: &SharedReceiver) -> Option<JobRecord> {
    receiver.lock().await.recv().await
}

async fn execute_one(
    executors: &ExecutorSet,
    store: &JobStore,
    job: JobRecord,
    cancel: &CancellationToken,
) {
    let Some(executor) = executors.get(&job.job_type) else {
        // Deployment error, but one bad job type must not take the pool down.
        error!(job = %job.identity(), "No executor registered for job type");
        let cause = anyhow::anyhow!("no executor registered for job type '{}'", job.job_type);
        record(store.handle_failure(&job, &cause).await, &job);
        return;
    };

    debug!(job = %job.identity(), "Executing job");
    let report = match executor
        .execute(&job.definition, job.correlation(), cancel.child_token())
        .await
    {
        Ok(outcome) => store.handle_success(&job, outcome).await,
        Err(cause) => store.handle_failure(&job, &cause).await,
    };
    record(report, &job);
}

async fn execute_one_db(executors: &DbExecutorSet, store: &JobStore, job: JobRecord) {
    let Some(executor) = executors.get(&job.job_type) else {
        error!(job = %job.identity(), "No executor registered for job type");
        let cause = anyhow::anyhow!("no executor registered for job type '{}'", job.job_type);
        record(store.handle_failure(&job, &cause).await, &job);
        return;
    };

    let mut tx = match store.begin().await {
        Ok(tx) => tx,
        Err(e) => {
            error!(job = %job.identity(), error = %e, "Failed to open transaction");
            return;
        }
    };

    debug!(job = %job.identity(), "Executing db-only job");
    match executor
        .execute(&job.definition, job.correlation(), &mut tx)
        .await
    {
        Ok(execution) => {
            if let Err(e) = JobStore::apply_outcome_in(&mut tx, &job, execution.outcome).await {
                drop(tx);
                record(store.handle_failure(&job, &anyhow::Error::from(e)).await, &job);
                return;
            }
            match tx.commit().await {
                Ok(()) => {
                    // Deferred side effects run only once the transaction is
                    // durable.
                    if let Some(deferred) = execution.deferred {
                        deferred.await;
                    }
                }
                Err(e) => {
                    record(store.handle_failure(&job, &anyhow::Error::from(e)).await, &job);
                }
            }
        }
        Err(cause) => {
            // Dropping the transaction rolls the executor's writes back.
            drop(tx);
            record(store.handle_failure(&job, &cause).await, &job);
        }
    }
}

fn record(result: conveyor_db::DbResult<()>, job: &JobRecord) {
    if let Err(e) = result {
        error!(job = %job.identity(), error = %e, "Failed to record job outcome");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use conveyor_core::{
        AlwaysPending, ExecutionOutcome, JobTypeInfo, JobTypeRegistry, NewJob,
    };
    use conveyor_db::{CapacitySnapshot, DbExecution, RetryPolicy};
    use sqlx::sqlite::SqlitePoolOptions;
    use sqlx::SqliteConnection;
    use std::sync::atomic::{AtomicBool, Ordering};
    use uuid::Uuid;

    async fn test_store() -> JobStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        conveyor_db::run_migrations(&pool).await.unwrap();
        let registry = Arc::new(
            JobTypeRegistry::from_entries([
                (
                    "send-email",
                    JobTypeInfo {
                        category: JobCategory::Normal,
                        priority: 10,
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
        );
        JobStore::new(
            pool,
            registry,
            Arc::new(AlwaysPending),
            RetryPolicy::default(),
        )
    }

    async fn claim_one(store: &JobStore, job: NewJob) -> JobRecord {
        store.enqueue_or_error(job).await.unwrap();
        let mut batch = store
            .claim_batch(
                CapacitySnapshot {
                    normal: 10,
                    long_running: 10,
                    db_only: 10,
                },
                10,
            )
            .await
            .unwrap();
        batch.pop().unwrap()
    }

    #[tokio::test]
    async fn test_missing_executor_routed_through_failure_handler() {
        let store = test_store().await;
        let job = claim_one(&store, NewJob::new("send-email", "{}")).await;

        let executors = ExecutorSet::default();
        execute_one(&executors, &store, job.clone(), &CancellationToken::new()).await;

        let row = store.get_job(job.job_id()).await.unwrap().unwrap();
        assert_eq!(row.status, "pending");
        assert_eq!(row.failed_retries_count, 1);
    }

    struct AuditExecutor {
        fail: bool,
        deferred_ran: Arc<AtomicBool>,
    }

    #[async_trait]
    impl DbJobExecutor for AuditExecutor {
        fn job_type(&self) -> &'static str {
            "apply-rows"
        }

        async fn execute(
            &self,
            _definition: &str,
            _correlation_id: Uuid,
            conn: &mut SqliteConnection,
        ) -> anyhow::Result<DbExecution> {
            sqlx::query("INSERT INTO audit (note) VALUES ('applied')")
                .execute(&mut *conn)
                .await?;
            if self.fail {
                anyhow::bail!("constraint violated");
            }
            let flag = self.deferred_ran.clone();
            Ok(DbExecution::new(ExecutionOutcome::Success).with_deferred(Box::pin(async move {
                flag.store(true, Ordering::SeqCst);
            })))
        }
    }

    async fn audit_count(store: &JobStore) -> i64 {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM audit")
            .fetch_one(store.pool())
            .await
            .unwrap();
        count
    }

    #[tokio::test]
    async fn test_db_only_commits_executor_writes_with_outcome() {
        let store = test_store().await;
        sqlx::query("CREATE TABLE audit (note TEXT)")
            .execute(store.pool())
            .await
            .unwrap();
        let job = claim_one(&store, NewJob::new("apply-rows", "{}")).await;

        let deferred_ran = Arc::new(AtomicBool::new(false));
        let executors = DbExecutorSet::new([Arc::new(AuditExecutor {
            fail: false,
            deferred_ran: deferred_ran.clone(),
        }) as Arc<dyn DbJobExecutor>]);

        execute_one_db(&executors, &store, job.clone()).await;

        // Executor write and archival committed together; deferred hook ran
        // after the commit.
        assert_eq!(audit_count(&store).await, 1);
        assert!(store.get_job(job.job_id()).await.unwrap().is_none());
        assert_eq!(store.list_completed(10).await.unwrap().len(), 1);
        assert!(deferred_ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_db_only_failure_rolls_executor_writes_back() {
        let store = test_store().await;
        sqlx::query("CREATE TABLE audit (note TEXT)")
            .execute(store.pool())
            .await
            .unwrap();
        let job = claim_one(&store, NewJob::new("apply-rows", "{}")).await;

        let deferred_ran = Arc::new(AtomicBool::new(false));
        let executors = DbExecutorSet::new([Arc::new(AuditExecutor {
            fail: true,
            deferred_ran: deferred_ran.clone(),
        }) as Arc<dyn DbJobExecutor>]);

        execute_one_db(&executors, &store, job.clone()).await;

        assert_eq!(audit_count(&store).await, 0);
        assert!(!deferred_ran.load(Ordering::SeqCst));
        let row = store.get_job(job.job_id()).await.unwrap().unwrap();
        assert_eq!(row.status, "pending");
        assert_eq!(row.failed_retries_count, 1);
    }
}
