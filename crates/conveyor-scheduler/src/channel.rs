//! Bounded dispatch channels.
//!
//! One bounded channel per category, written by the producer and read by the
//! category's consumer pool. Remaining capacity is read live from the sender,
//! which is what bounds the producer's next claim.

use std::sync::Arc;

use conveyor_core::JobCategory;
use conveyor_db::{CapacitySnapshot, JobRecord};
use tokio::sync::mpsc;
use tokio::sync::Mutex;

/// A bounded, single-writer, multi-reader hand-off channel for one category.
pub struct DispatchChannel {
    tx: mpsc::Sender<JobRecord>,
    rx: Arc<Mutex<mpsc::Receiver<JobRecord>>>,
}

impl DispatchChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Free slots right now.
    pub fn remaining(&self) -> usize {
        self.tx.capacity()
    }

    /// Push a claimed job. Blocks when the channel is full, back-pressuring
    /// the producer rather than the enqueuing callers.
    pub async fn send(&self, job: JobRecord) -> Result<(), mpsc::error::SendError<JobRecord>> {
        self.tx.send(job).await
    }

    /// Shared receiver handle for a pool worker.
    pub fn receiver(&self) -> Arc<Mutex<mpsc::Receiver<JobRecord>>> {
        self.rx.clone()
    }
}

/// The three per-category channels.
pub struct DispatchChannels {
    normal: DispatchChannel,
    long_running: DispatchChannel,
    db_only: DispatchChannel,
}

impl DispatchChannels {
    pub fn new(normal_capacity: usize, long_running_capacity: usize, db_only_capacity: usize) -> Self {
        Self {
            normal: DispatchChannel::new(normal_capacity),
            long_running: DispatchChannel::new(long_running_capacity),
            db_only: DispatchChannel::new(db_only_capacity),
        }
    }

    pub fn get(&self, category: JobCategory) -> &DispatchChannel {
        match category {
            JobCategory::Normal => &self.normal,
            JobCategory::LongRunning => &self.long_running,
            JobCategory::DbOnly => &self.db_only,
        }
    }

    /// Ephemeral free-slot counts, read once per claim iteration.
    pub fn snapshot(&self) -> CapacitySnapshot {
        CapacitySnapshot {
            normal: self.normal.remaining(),
            long_running: self.long_running.remaining(),
            db_only: self.db_only.remaining(),
        }
    }
}
