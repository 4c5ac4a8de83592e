//! Scheduler configuration parsing.

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tuning knobs for the producer and consumer pools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Parallel workers in the normal pool.
    pub normal_workers: usize,
    /// Parallel workers in the long-running pool.
    pub long_running_workers: usize,
    /// Channel capacity = workers x slack (the db-only channel, with its
    /// single worker, gets capacity = slack).
    pub channel_slack: usize,
    /// Maximum jobs claimed per producer iteration.
    pub batch_size: usize,
    /// Cadence of the producer loop.
    pub tick_interval: Duration,
    /// How often blocked jobs are re-evaluated against the decision engine.
    pub blocked_recheck_interval: Duration,
    /// Attempts before a job is marked failed for good.
    pub max_retries: u32,
    /// Delay before attempt n+1 after the n-th failure. Fixed escalation
    /// schedule, not computed backoff; must have `max_retries` entries.
    pub retry_delays: Vec<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            normal_workers: 4,
            long_running_workers: 2,
            channel_slack: 2,
            batch_size: 20,
            tick_interval: Duration::from_secs(1),
            blocked_recheck_interval: Duration::from_secs(15 * 60),
            max_retries: 3,
            retry_delays: vec![
                Duration::from_secs(3 * 60),
                Duration::from_secs(5 * 60),
                Duration::from_secs(15 * 60),
            ],
        }
    }
}

impl SchedulerConfig {
    /// Channel capacity for the given worker count.
    pub fn channel_capacity(&self, workers: usize) -> usize {
        (workers * self.channel_slack).max(1)
    }

    /// Check cross-field invariants.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.normal_workers == 0 {
            return Err(invalid("normal-workers", "must be at least 1"));
        }
        if self.long_running_workers == 0 {
            return Err(invalid("long-running-workers", "must be at least 1"));
        }
        if self.channel_slack == 0 {
            return Err(invalid("channel-slack", "must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(invalid("batch-size", "must be at least 1"));
        }
        if self.retry_delays.len() != self.max_retries as usize {
            return Err(invalid(
                "retry-delays",
                "must have exactly one entry per retry attempt",
            ));
        }
        Ok(())
    }
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
}

/// Parse a scheduler configuration from KDL text.
///
/// All nodes are optional; unknown nodes are ignored so the scheduler section
/// can live inside a larger config file.
pub fn parse_scheduler_config(kdl: &str) -> ConfigResult<SchedulerConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SchedulerConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "normal-workers" => config.normal_workers = get_usize(node)?,
            "long-running-workers" => config.long_running_workers = get_usize(node)?,
            "channel-slack" => config.channel_slack = get_usize(node)?,
            "batch-size" => config.batch_size = get_usize(node)?,
            "tick-interval-ms" => {
                config.tick_interval = Duration::from_millis(get_u64(node)?);
            }
            "blocked-recheck-secs" => {
                config.blocked_recheck_interval = Duration::from_secs(get_u64(node)?);
            }
            "max-retries" => config.max_retries = get_u64(node)? as u32,
            "retry-delays-secs" => {
                config.retry_delays = get_all_integers(node)?
                    .into_iter()
                    .map(Duration::from_secs)
                    .collect();
            }
            _ => {} // Ignore unknown nodes
        }
    }

    config.validate()?;
    Ok(config)
}

/// Read and parse a scheduler configuration file.
pub fn load_scheduler_config(path: impl AsRef<Path>) -> ConfigResult<SchedulerConfig> {
    let kdl = std::fs::read_to_string(path)?;
    parse_scheduler_config(&kdl)
}

fn get_u64(node: &KdlNode) -> ConfigResult<u64> {
    let value = node
        .entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
        .ok_or_else(|| ConfigError::MissingField(node.name().value().to_string()))?;
    u64::try_from(value).map_err(|_| invalid(node.name().value(), "must be a non-negative integer"))
}

fn get_usize(node: &KdlNode) -> ConfigResult<usize> {
    Ok(get_u64(node)? as usize)
}

fn get_all_integers(node: &KdlNode) -> ConfigResult<Vec<u64>> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .map(|e| {
            e.value()
                .as_integer()
                .and_then(|v| u64::try_from(v).ok())
                .ok_or_else(|| invalid(node.name().value(), "must be non-negative integers"))
        })
        .collect()
}
