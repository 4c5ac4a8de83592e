//! KDL configuration parsing for the Conveyor job queue.
//!
//! This crate handles:
//! - Scheduler tuning knobs (worker counts, batch size, tick cadence)
//! - The retry/backoff schedule
//!
//! Every knob has a default, so a missing or empty config file yields a
//! working scheduler.

pub mod error;
pub mod scheduler;

pub use error::{ConfigError, ConfigResult};
pub use scheduler::{load_scheduler_config, parse_scheduler_config, SchedulerConfig};
