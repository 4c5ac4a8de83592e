//! Row types for the job store.

use chrono::{DateTime, Utc};
use conveyor_core::{JobCategory, JobId, JobStatus, SagaId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A live job row.
///
/// `status` and `category` are stored as their wire strings; use the typed
/// accessors when branching on them.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobRecord {
    pub id: i64,
    pub correlation_id: String,
    pub job_type: String,
    pub category: String,
    pub priority: i64,
    pub definition: String,
    pub status: String,
    pub failed_retries_count: i64,
    pub enqueued_at: DateTime<Utc>,
    pub execute_after_date: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub debounce_id: Option<String>,
    pub saga_id: Option<i64>,
}

impl JobRecord {
    pub fn job_id(&self) -> JobId {
        JobId::new(self.id)
    }

    pub fn saga_id(&self) -> Option<SagaId> {
        self.saga_id.map(SagaId::new)
    }

    /// Correlation id for tracing. Rows are only ever written from a `Uuid`,
    /// so a malformed value decodes to the nil id rather than failing.
    pub fn correlation(&self) -> Uuid {
        Uuid::parse_str(&self.correlation_id).unwrap_or_else(|_| Uuid::nil())
    }

    pub fn typed_status(&self) -> Option<JobStatus> {
        self.status.parse().ok()
    }

    pub fn typed_category(&self) -> Option<JobCategory> {
        self.category.parse().ok()
    }

    /// `type#id` identity used in every log line about this job.
    pub fn identity(&self) -> String {
        format!("{}#{}", self.job_type, self.id)
    }
}

/// An archived job. Written once when a job succeeds; never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CompletedJobRecord {
    pub id: i64,
    pub job_id: i64,
    pub job_type: String,
    pub definition: String,
    pub failed_retries_count: i64,
    pub enqueued_at: DateTime<Utc>,
    pub execute_after_date: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub correlation_id: String,
}

/// An open completion barrier. Ready when no job row references it any more;
/// the producer then converts it into its on-completion job.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SagaRecord {
    pub id: i64,
    pub on_completed_job_type: String,
    pub on_completed_definition: String,
    pub correlation_id: String,
}
