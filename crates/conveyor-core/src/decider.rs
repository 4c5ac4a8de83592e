//! Status decision engine.
//!
//! Answers "what initial status should a job of this type get right now?".
//! The store consults it at enqueue time and again during the periodic
//! blocked-job sweep, so a type whose dependency appears later (a mail sender
//! getting configured, say) unblocks without operator action.

use std::collections::HashMap;
use std::sync::Arc;

use crate::NewJobStatus;

/// Policy deciding the initial (or resumed) status for a job type.
pub trait JobStatusDecider: Send + Sync {
    fn status_for(&self, job_type: &str) -> NewJobStatus;
}

/// Decider that admits every job type immediately.
#[derive(Debug, Default, Clone)]
pub struct AlwaysPending;

impl JobStatusDecider for AlwaysPending {
    fn status_for(&self, _job_type: &str) -> NewJobStatus {
        NewJobStatus::Pending
    }
}

type StatusRule = Arc<dyn Fn() -> NewJobStatus + Send + Sync>;

/// Decider built from per-type rules; types without a rule are Pending.
///
/// Rules are closures so they can consult live environment state (is a mail
/// sender configured?) on every evaluation.
#[derive(Clone, Default)]
pub struct RuleSetDecider {
    rules: HashMap<String, StatusRule>,
}

impl RuleSetDecider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule<F>(mut self, job_type: impl Into<String>, rule: F) -> Self
    where
        F: Fn() -> NewJobStatus + Send + Sync + 'static,
    {
        self.rules.insert(job_type.into(), Arc::new(rule));
        self
    }
}

impl JobStatusDecider for RuleSetDecider {
    fn status_for(&self, job_type: &str) -> NewJobStatus {
        match self.rules.get(job_type) {
            Some(rule) => rule(),
            None => NewJobStatus::Pending,
        }
    }
}
