//! The producer loop.
//!
//! A single logical actor; never run two of these against one database. The
//! claim query evaluates capacity and flips statuses in one statement, but
//! that only bounds concurrent claims correctly because claims are serialized
//! against the capacity snapshots taken here.

use std::sync::Arc;
use std::time::Duration;

use conveyor_config::SchedulerConfig;
use conveyor_db::{DbResult, JobStore};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::channel::DispatchChannels;

pub struct Producer {
    store: JobStore,
    channels: Arc<DispatchChannels>,
    batch_size: usize,
    tick_interval: Duration,
    blocked_recheck_interval: Duration,
}

impl Producer {
    pub fn new(store: JobStore, channels: Arc<DispatchChannels>, config: &SchedulerConfig) -> Self {
        Self {
            store,
            channels,
            batch_size: config.batch_size,
            tick_interval: config.tick_interval,
            blocked_recheck_interval: config.blocked_recheck_interval,
        }
    }

    /// Run until the token fires.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            tick_ms = self.tick_interval.as_millis() as u64,
            batch_size = self.batch_size,
            "Producer started"
        );
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_blocked_check = Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if last_blocked_check.elapsed() >= self.blocked_recheck_interval {
                last_blocked_check = Instant::now();
                if let Err(e) = self.store.unlock_blocked_jobs().await {
                    warn!(error = %e, "Blocked-job sweep failed");
                }
            }

            if let Err(e) = self.tick(&cancel).await {
                warn!(error = %e, "Producer tick failed");
            }
        }
        info!("Producer stopped");
    }

    /// One full claim-and-dispatch pass: promote completed sagas, claim a
    /// capacity-bounded batch, push it onto the channels, and repeat until a
    /// claim comes back empty.
    ///
    /// Public so tests can drive the producer without the timer.
    pub async fn tick(&self, cancel: &CancellationToken) -> DbResult<()> {
        loop {
            self.store.sweep_completed_sagas().await?;

            let caps = self.channels.snapshot();
            let batch = self.store.claim_batch(caps, self.batch_size).await?;
            if batch.is_empty() {
                return Ok(());
            }

            for job in batch {
                let Some(category) = job.typed_category() else {
                    let cause =
                        anyhow::anyhow!("job has unrecognized category '{}'", job.category);
                    self.store.handle_failure(&job, &cause).await?;
                    continue;
                };
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    sent = self.channels.get(category).send(job) => {
                        if sent.is_err() {
                            warn!("Dispatch channel closed; stopping tick");
                            return Ok(());
                        }
                    }
                }
            }

            if cancel.is_cancelled() {
                return Ok(());
            }
        }
    }
}
