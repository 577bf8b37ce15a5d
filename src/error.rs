use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to callers.
///
/// Validation errors are raised before any storage I/O or work submission;
/// storage errors propagate unchanged from the adapter.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("timestamp {ts} is not after the latest ingestion timestamp {latest}")]
    TimestampBeforeLatestIngestion { ts: u64, latest: u64 },

    #[error("partition {partition} needs {bytes} bytes, memory budget is {budget}")]
    PartitionTooLarge {
        partition: usize,
        bytes: usize,
        budget: usize,
    },

    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt array data: {0}")]
    Corrupt(String),
}
