//! Job identifiers, statuses, and dispatch categories.

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a live or archived job row.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[display("{_0}")]
pub struct JobId(i64);

impl JobId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl From<i64> for JobId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Identifier of an open saga (completion barrier).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[display("{_0}")]
pub struct SagaId(i64);

impl SagaId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl From<i64> for SagaId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Dispatch category of a job. Determines which bounded channel and consumer
/// pool the job flows through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobCategory {
    /// Short I/O or CPU work, executed by the general worker pool.
    Normal,
    /// Work that may run for minutes (polling external services), executed by
    /// a dedicated pool so it cannot starve normal jobs.
    LongRunning,
    /// Work whose side effects must commit in the same transaction as the
    /// outcome write. Served by exactly one worker.
    DbOnly,
}

impl JobCategory {
    pub const ALL: [JobCategory; 3] = [
        JobCategory::Normal,
        JobCategory::LongRunning,
        JobCategory::DbOnly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobCategory::Normal => "normal",
            JobCategory::LongRunning => "long_running",
            JobCategory::DbOnly => "db_only",
        }
    }
}

impl std::fmt::Display for JobCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobCategory {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(JobCategory::Normal),
            "long_running" => Ok(JobCategory::LongRunning),
            "db_only" => Ok(JobCategory::DbOnly),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown job category '{other}'"
            ))),
        }
    }
}

/// Status of a live job row.
///
/// Successful jobs have no status here: they are archived into the completed
/// table and the live row is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Eligible for claiming once `execute_after_date` has passed.
    Pending,
    /// Claimed by the producer and handed to a consumer pool.
    Processing,
    /// Exhausted its retries. Terminal; requires operator attention.
    Failed,
    /// Parked until the periodic unlock sweep finds its dependency satisfied.
    Blocked,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Failed => "failed",
            JobStatus::Blocked => "blocked",
        }
    }

    /// Returns true if the job will never be scheduled again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "failed" => Ok(JobStatus::Failed),
            "blocked" => Ok(JobStatus::Blocked),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown job status '{other}'"
            ))),
        }
    }
}

/// Status a freshly enqueued (or unblocked) job may receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewJobStatus {
    Pending,
    Blocked,
}

impl NewJobStatus {
    pub fn as_job_status(&self) -> JobStatus {
        match self {
            NewJobStatus::Pending => JobStatus::Pending,
            NewJobStatus::Blocked => JobStatus::Blocked,
        }
    }
}

/// A request to enqueue one job.
///
/// The definition is an opaque JSON blob; the core never looks inside it.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: String,
    pub definition: String,
    pub correlation_id: Uuid,
    pub execute_after: DateTime<Utc>,
    pub debounce_id: Option<String>,
    pub saga_id: Option<SagaId>,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, definition: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            definition: definition.into(),
            correlation_id: Uuid::new_v4(),
            execute_after: Utc::now(),
            debounce_id: None,
            saga_id: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_execute_after(mut self, execute_after: DateTime<Utc>) -> Self {
        self.execute_after = execute_after;
        self
    }

    /// Coalesce with any pending job sharing this key instead of inserting a
    /// duplicate row.
    pub fn with_debounce_id(mut self, debounce_id: impl Into<String>) -> Self {
        self.debounce_id = Some(debounce_id.into());
        self
    }

    pub fn with_saga_id(mut self, saga_id: SagaId) -> Self {
        self.saga_id = Some(saga_id);
        self
    }
}
