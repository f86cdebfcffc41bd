//! Error types for batch aggregation and the notification pipeline.

use crate::account::AccountId;
use thiserror::Error;

/// Result type alias for fallible crate operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure of a single aggregation call. Never fatal to the process.
#[derive(Error, Debug)]
pub enum AggregationError {
    /// No account ids were supplied.
    #[error("batch contains no accounts")]
    Empty,

    /// The same account id appears more than once in the batch.
    #[error("duplicate account id {0} in batch")]
    DuplicateId(AccountId),

    /// Every lookup in the batch failed.
    #[error("all {attempted} account lookups failed")]
    AllFailed { attempted: usize },

    /// The job was cancelled before it completed; partial sums were discarded.
    #[error("batch was cancelled")]
    Cancelled,

    /// A balance or partial sum does not fit in a 4-place decimal.
    #[error("balance overflow while summing chunk {chunk}")]
    Overflow { chunk: usize },

    /// A worker thread panicked while summing its chunk.
    #[error("worker for chunk {chunk} panicked")]
    WorkerPanicked { chunk: usize },

    /// The blocking task running a threaded job panicked outside the workers.
    #[error("aggregation task panicked: {0}")]
    TaskPanicked(String),

    /// Worker threads or the cooperative runtime could not be started.
    #[error("failed to start batch runtime: {0}")]
    Runtime(#[from] std::io::Error),

    /// A blocking cooperative run was requested from inside an async runtime.
    #[error("cooperative batch cannot block inside an async runtime; use submit_batch_async")]
    NestedRuntime,
}

/// Rejection of an enqueue by the notification queue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The queue stayed at capacity for the whole enqueue timeout.
    #[error("notification queue is full (capacity {capacity})")]
    Full { capacity: usize },

    /// The mailer is shutting down and no longer accepts notifications.
    #[error("notification queue is closed")]
    Closed,
}

/// Failure to look up a single account in a snapshot source.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    #[error("account {0} not found")]
    NotFound(AccountId),

    #[error("account {id} unavailable: {reason}")]
    Unavailable { id: AccountId, reason: String },
}

/// Invalid configuration value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidValue {
        var: String,
        value: String,
        reason: String,
    },
}

/// Top-level errors surfaced by the command-line tool.
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to open or read the input file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV parsing or writing error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Aggregation(#[from] AggregationError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Unrecognised strategy name
    #[error("unknown strategy {0:?}; expected \"threaded\" or \"cooperative\"")]
    UnknownStrategy(String),

    /// Missing input file argument
    #[error("Missing input file argument. Usage: bms-batch <accounts.csv> [threaded|cooperative]")]
    MissingArgument,
}
