//! Job type registry.
//!
//! An immutable map from job type to dispatch metadata, built once at process
//! start from the full set of registered executors. Dispatch logic works in
//! terms of this map; the job-type string only survives at the persistence
//! boundary.

use std::collections::HashMap;

use crate::{Error, JobCategory, Result};

/// Dispatch metadata for one job type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobTypeInfo {
    pub category: JobCategory,
    /// Lower executes first within the category.
    pub priority: i32,
}

/// Immutable registry of every job type the process can execute.
#[derive(Debug, Clone)]
pub struct JobTypeRegistry {
    types: HashMap<String, JobTypeInfo>,
}

impl JobTypeRegistry {
    /// Build the registry from `(job_type, info)` entries.
    ///
    /// Two executors claiming the same job type is a wiring error and fails
    /// construction, which is intended to abort startup.
    pub fn from_entries<I, S>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, JobTypeInfo)>,
        S: Into<String>,
    {
        let mut types = HashMap::new();
        for (job_type, info) in entries {
            let job_type = job_type.into();
            if types.insert(job_type.clone(), info).is_some() {
                return Err(Error::DuplicateJobType(job_type));
            }
        }
        Ok(Self { types })
    }

    pub fn get(&self, job_type: &str) -> Option<&JobTypeInfo> {
        self.types.get(job_type)
    }

    /// Like [`get`](Self::get), but an unknown type is an error.
    pub fn require(&self, job_type: &str) -> Result<&JobTypeInfo> {
        self.types
            .get(job_type)
            .ok_or_else(|| Error::UnknownJobType(job_type.to_string()))
    }

    pub fn job_types(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}
