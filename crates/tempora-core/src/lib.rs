//! # Tempora Core
//!
//! Foundational types for the tempora temporal query engine.
//!
//! This crate provides the event and time model every runtime component
//! builds on:
//!
//! - **Events**: point, interval, start-edge, end-edge and punctuation kinds
//!   sharing one `(sync_time, other_time, payload)` representation
//! - **Replay order**: the total order used for deterministic replay
//! - **Validation**: malformed intervals and edges are rejected up front
//! - **Wire record**: the fixed 24-byte encoding for `i64` payloads
//!
//! ## Modules
//!
//! - [`event`]: `StreamEvent`, `EventKind`, time sentinels and the `Payload` bound
//! - [`wire`]: 24-byte little-endian record codec
//! - [`error`]: validation and wire errors
//!
//! ## Quick Start
//!
//! ```rust
//! use tempora_core::{StreamEvent, INFINITY};
//!
//! let reading = StreamEvent::interval(10, 100, 42_i64);
//! assert_eq!(reading.start_time(), 10);
//! assert_eq!(reading.end_time(), 100);
//!
//! let open = StreamEvent::start(5, "session".to_string());
//! assert_eq!(open.end_time(), INFINITY);
//! ```

pub mod error;
pub mod event;
pub mod wire;

pub use error::{EventError, WireError};
pub use event::{EventKind, Payload, StreamEvent, Timestamp, INFINITY, PUNCTUATION_OTHER_TIME};
