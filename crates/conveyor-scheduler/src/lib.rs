//! Producer loop and consumer pools for the Conveyor job queue.
//!
//! The producer is a single logical actor: one periodic loop that promotes
//! completed sagas, claims a capacity-bounded batch, and pushes jobs onto
//! bounded per-category channels. Consumer pools pull from those channels,
//! run the matching executor, and report the outcome back to the store.

pub mod channel;
pub mod consumer;
pub mod producer;
pub mod system;

pub use channel::{DispatchChannel, DispatchChannels};
pub use consumer::{ConsumerPool, DbConsumer, DbExecutorSet, ExecutorSet};
pub use producer::Producer;
pub use system::{JobSystem, JobSystemBuilder};
