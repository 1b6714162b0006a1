//! Runtime error types.

use crate::afa::AfaError;
use crate::persistence::CheckpointError;
use crate::window::WindowError;
use tempora_core::{EventError, Timestamp};
use thiserror::Error;

/// Errors raised while a query process is running.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("input '{input}' rejected a malformed event: {source}")]
    Malformed {
        input: String,
        #[source]
        source: EventError,
    },

    #[error("input '{input}' received an event at {sync_time} behind the watermark {watermark}")]
    OutOfOrder {
        input: String,
        sync_time: Timestamp,
        watermark: Timestamp,
    },

    #[error("input '{input}' has faulted and accepts no further events")]
    StreamFaulted { input: String },

    #[error("input '{input}' has already completed")]
    InputCompleted { input: String },

    #[error("handle does not belong to this query process")]
    UnknownHandle,

    #[error("query process has been disposed")]
    Disposed,

    #[error("query process was already disposed")]
    AlreadyDisposed,

    #[error("output {output} still holds {pending} undrained events")]
    UndrainedOutput { output: usize, pending: usize },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// Errors raised while building a query.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("stream is not attached to a registered input")]
    Detached,

    #[error("stream was built from a different query container")]
    ForeignStream,

    #[error("an input named '{0}' is already registered")]
    DuplicateInput(String),

    #[error("{param} must be positive, got {value}")]
    NonPositive { param: &'static str, value: i64 },

    #[error(transparent)]
    Window(#[from] WindowError),

    #[error(transparent)]
    Pattern(#[from] AfaError),
}

pub type EngineResult<T> = Result<T, EngineError>;
