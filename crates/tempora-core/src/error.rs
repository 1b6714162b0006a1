//! Error types for event validation and the wire record.

use crate::event::{EventKind, Timestamp};
use thiserror::Error;

/// A structurally invalid event. Always fatal to the input that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    #[error("interval must end after it starts (start {start}, end {end})")]
    EmptyInterval { start: Timestamp, end: Timestamp },

    #[error("end edge at {end} closes a start at {start} that lies in its future")]
    EdgeInverted { start: Timestamp, end: Timestamp },

    #[error("{kind:?} event cannot take effect at +infinity")]
    DataAtInfinity { kind: EventKind },

    #[error("{kind:?} event at {sync_time} carries no payload")]
    MissingPayload { kind: EventKind, sync_time: Timestamp },

    #[error("end edge at {end} has no open start edge at {start}")]
    UnmatchedEndEdge { start: Timestamp, end: Timestamp },
}

/// Errors raised while decoding 24-byte wire records.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("wire record must be {expected} bytes, got {actual}")]
    BadLength { expected: usize, actual: usize },

    #[error("decoded record is not a valid event: {0}")]
    Invalid(#[from] EventError),
}
