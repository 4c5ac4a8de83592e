//! Error types for Conveyor.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("duplicate job type: {0}")]
    DuplicateJobType(String),

    #[error("unknown job type: {0}")]
    UnknownJobType(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, Error>;
