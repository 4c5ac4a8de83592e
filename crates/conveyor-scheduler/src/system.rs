//! Wiring and lifecycle for the whole job system.
//!
//! The builder collects executors and policy, builds the immutable job type
//! registry (rejecting duplicate registrations), and produces a [`JobSystem`]
//! that owns the producer, the channels, and the consumer pools.

use std::sync::Arc;

use conveyor_config::SchedulerConfig;
use conveyor_core::{
    AlwaysPending, Error, JobCategory, JobExecutor, JobStatusDecider, JobTypeInfo, JobTypeRegistry,
    Result,
};
use conveyor_db::{DbJobExecutor, DbResult, JobStore, RetryPolicy};
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::channel::DispatchChannels;
use crate::consumer::{ConsumerPool, DbConsumer, DbExecutorSet, ExecutorSet};
use crate::producer::Producer;

/// Collects executors and policy before the system starts.
pub struct JobSystemBuilder {
    config: SchedulerConfig,
    executors: Vec<Arc<dyn JobExecutor>>,
    db_executors: Vec<Arc<dyn DbJobExecutor>>,
    decider: Arc<dyn JobStatusDecider>,
}

impl Default for JobSystemBuilder {
    fn default() -> Self {
        Self {
            config: SchedulerConfig::default(),
            executors: Vec::new(),
            db_executors: Vec::new(),
            decider: Arc::new(AlwaysPending),
        }
    }
}

impl JobSystemBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_decider(mut self, decider: Arc<dyn JobStatusDecider>) -> Self {
        self.decider = decider;
        self
    }

    pub fn register(mut self, executor: Arc<dyn JobExecutor>) -> Self {
        self.executors.push(executor);
        self
    }

    pub fn register_db(mut self, executor: Arc<dyn DbJobExecutor>) -> Self {
        self.db_executors.push(executor);
        self
    }

    /// Build the system. Fails loudly on duplicate job types, an executor
    /// claiming the db-only category through the wrong trait, or an invalid
    /// config.
    pub fn build(self, pool: SqlitePool) -> Result<JobSystem> {
        self.config
            .validate()
            .map_err(|e| Error::InvalidInput(e.to_string()))?;

        let mut entries = Vec::new();
        for executor in &self.executors {
            if executor.category() == JobCategory::DbOnly {
                return Err(Error::InvalidInput(format!(
                    "executor '{}' claims the db-only category; implement DbJobExecutor instead",
                    executor.job_type()
                )));
            }
            entries.push((
                executor.job_type().to_string(),
                JobTypeInfo {
                    category: executor.category(),
                    priority: executor.priority(),
                },
            ));
        }
        for executor in &self.db_executors {
            entries.push((
                executor.job_type().to_string(),
                JobTypeInfo {
                    category: JobCategory::DbOnly,
                    priority: executor.priority(),
                },
            ));
        }
        let registry = Arc::new(JobTypeRegistry::from_entries(entries)?);

        let store = JobStore::new(
            pool,
            registry,
            self.decider.clone(),
            retry_policy_from(&self.config)?,
        );
        let channels = Arc::new(DispatchChannels::new(
            self.config.channel_capacity(self.config.normal_workers),
            self.config.channel_capacity(self.config.long_running_workers),
            self.config.channel_capacity(1),
        ));

        let normal_set = Arc::new(ExecutorSet::new(
            self.executors
                .iter()
                .filter(|e| e.category() == JobCategory::Normal)
                .cloned(),
        ));
        let long_running_set = Arc::new(ExecutorSet::new(
            self.executors
                .iter()
                .filter(|e| e.category() == JobCategory::LongRunning)
                .cloned(),
        ));
        let db_set = Arc::new(DbExecutorSet::new(self.db_executors.iter().cloned()));

        Ok(JobSystem {
            config: self.config,
            store,
            channels,
            normal_set,
            long_running_set,
            db_set,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }
}

fn retry_policy_from(config: &SchedulerConfig) -> Result<RetryPolicy> {
    let mut delays = Vec::with_capacity(config.retry_delays.len());
    for delay in &config.retry_delays {
        let delay = chrono::Duration::from_std(*delay)
            .map_err(|e| Error::InvalidInput(format!("retry delay out of range: {e}")))?;
        delays.push(delay);
    }
    Ok(RetryPolicy {
        max_retries: config.max_retries,
        delays,
    })
}

/// The assembled job system.
pub struct JobSystem {
    config: SchedulerConfig,
    store: JobStore,
    channels: Arc<DispatchChannels>,
    normal_set: Arc<ExecutorSet>,
    long_running_set: Arc<ExecutorSet>,
    db_set: Arc<DbExecutorSet>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl JobSystem {
    pub fn builder() -> JobSystemBuilder {
        JobSystemBuilder::new()
    }

    /// The store, for enqueuing and inspection.
    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Token linked to every channel operation and worker; fires on shutdown.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run startup recovery, then spawn the producer and all consumer pools.
    pub async fn start(&mut self) -> DbResult<()> {
        // Jobs left processing by a dead process are retried, not lost.
        self.store.unlock_stale_processing_jobs().await?;

        let normal_pool = ConsumerPool::new(
            JobCategory::Normal,
            self.config.normal_workers,
            self.channels.get(JobCategory::Normal).receiver(),
            self.normal_set.clone(),
            self.store.clone(),
        );
        self.tasks.extend(normal_pool.spawn(&self.cancel));

        let long_running_pool = ConsumerPool::new(
            JobCategory::LongRunning,
            self.config.long_running_workers,
            self.channels.get(JobCategory::LongRunning).receiver(),
            self.long_running_set.clone(),
            self.store.clone(),
        );
        self.tasks.extend(long_running_pool.spawn(&self.cancel));

        let db_consumer = DbConsumer::new(
            self.channels.get(JobCategory::DbOnly).receiver(),
            self.db_set.clone(),
            self.store.clone(),
        );
        self.tasks.push(db_consumer.spawn(&self.cancel));

        let producer = Producer::new(self.store.clone(), self.channels.clone(), &self.config);
        let cancel = self.cancel.clone();
        self.tasks.push(tokio::spawn(producer.run(cancel)));

        info!(
            normal_workers = self.config.normal_workers,
            long_running_workers = self.config.long_running_workers,
            "Job system started"
        );
        Ok(())
    }

    /// Signal shutdown and wait for every task to stop.
    ///
    /// Claimed-but-unfinished jobs stay processing in storage; the startup
    /// recovery sweep returns them to pending on next boot.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        info!("Job system stopped");
    }
}
