//! Stream events and the time model.
//!
//! Every event shares one representation: a `sync_time` at which it becomes
//! visible, an `other_time` whose meaning depends on the kind, and an
//! optional payload (absent only for punctuations).
//!
//! | kind        | `sync_time`   | `other_time`                       |
//! |-------------|---------------|------------------------------------|
//! | Point       | start         | `start + 1`                        |
//! | Interval    | start         | end (exclusive, `> start`)         |
//! | Start-edge  | start         | [`INFINITY`]                       |
//! | End-edge    | end           | start of the matching Start-edge   |
//! | Punctuation | watermark     | [`PUNCTUATION_OTHER_TIME`]         |

use crate::error::EventError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Application time, in ticks.
pub type Timestamp = i64;

/// Sync time meaning "never": the end of an open lifetime, or the final
/// punctuation of a completed stream.
pub const INFINITY: Timestamp = i64::MAX;

/// `other_time` carried by punctuations.
pub const PUNCTUATION_OTHER_TIME: Timestamp = i64::MIN;

/// Bound shared by every payload that flows through a query.
///
/// Payloads must be serializable because operators that buffer events
/// write them into checkpoints, and shareable because pattern registers and
/// match provenance are shared between automaton instances.
pub trait Payload: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> Payload for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// The five event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Start,
    End,
    Interval,
    Point,
    Punctuation,
}

impl EventKind {
    /// Tie-break rank at equal sync time. Retractions and punctuations sort
    /// ahead of anything that opens a lifetime.
    pub fn priority(self) -> u8 {
        match self {
            EventKind::End => 0,
            EventKind::Punctuation => 1,
            EventKind::Start => 2,
            EventKind::Interval => 3,
            EventKind::Point => 4,
        }
    }
}

/// A single event in a temporal stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEvent<P> {
    pub kind: EventKind,
    pub sync_time: Timestamp,
    pub other_time: Timestamp,
    pub payload: Option<P>,
}

impl<P> StreamEvent<P> {
    /// A one-tick event `[time, time + 1)`.
    pub fn point(time: Timestamp, payload: P) -> Self {
        Self {
            kind: EventKind::Point,
            sync_time: time,
            other_time: time.saturating_add(1),
            payload: Some(payload),
        }
    }

    /// An event valid over `[start, end)`.
    pub fn interval(start: Timestamp, end: Timestamp, payload: P) -> Self {
        Self {
            kind: EventKind::Interval,
            sync_time: start,
            other_time: end,
            payload: Some(payload),
        }
    }

    /// Opens a lifetime whose end is not yet known.
    pub fn start(start: Timestamp, payload: P) -> Self {
        Self {
            kind: EventKind::Start,
            sync_time: start,
            other_time: INFINITY,
            payload: Some(payload),
        }
    }

    /// Closes, at `end`, the lifetime opened by a Start-edge at `start`.
    pub fn end(end: Timestamp, start: Timestamp, payload: P) -> Self {
        Self {
            kind: EventKind::End,
            sync_time: end,
            other_time: start,
            payload: Some(payload),
        }
    }

    /// Asserts that no event with a smaller sync time will follow.
    pub fn punctuation(time: Timestamp) -> Self {
        Self {
            kind: EventKind::Punctuation,
            sync_time: time,
            other_time: PUNCTUATION_OTHER_TIME,
            payload: None,
        }
    }

    pub fn is_punctuation(&self) -> bool {
        self.kind == EventKind::Punctuation
    }

    pub fn is_data(&self) -> bool {
        !self.is_punctuation()
    }

    /// Start of the event's lifetime.
    pub fn start_time(&self) -> Timestamp {
        match self.kind {
            EventKind::End => self.other_time,
            _ => self.sync_time,
        }
    }

    /// Exclusive end of the event's lifetime. Open Start-edges and
    /// punctuations report [`INFINITY`].
    pub fn end_time(&self) -> Timestamp {
        match self.kind {
            EventKind::Point => self.sync_time.saturating_add(1),
            EventKind::Interval => self.other_time,
            EventKind::End => self.sync_time,
            EventKind::Start | EventKind::Punctuation => INFINITY,
        }
    }

    pub fn payload(&self) -> Option<&P> {
        self.payload.as_ref()
    }

    pub fn into_payload(self) -> Option<P> {
        self.payload
    }

    /// Rewrites the payload, keeping kind and times.
    pub fn map_payload<Q>(self, f: impl FnOnce(P) -> Q) -> StreamEvent<Q> {
        StreamEvent {
            kind: self.kind,
            sync_time: self.sync_time,
            other_time: self.other_time,
            payload: self.payload.map(f),
        }
    }

    /// Retypes a punctuation. Returns `None` for data events.
    pub fn cast_punctuation<Q>(&self) -> Option<StreamEvent<Q>> {
        self.is_punctuation()
            .then(|| StreamEvent::punctuation(self.sync_time))
    }

    /// Checks the per-kind timing rules.
    pub fn validate(&self) -> Result<(), EventError> {
        if self.is_punctuation() {
            return Ok(());
        }
        if self.payload.is_none() {
            return Err(EventError::MissingPayload {
                kind: self.kind,
                sync_time: self.sync_time,
            });
        }
        if self.sync_time == INFINITY {
            return Err(EventError::DataAtInfinity { kind: self.kind });
        }
        match self.kind {
            EventKind::Interval if self.other_time <= self.sync_time => {
                Err(EventError::EmptyInterval {
                    start: self.sync_time,
                    end: self.other_time,
                })
            }
            EventKind::End if self.other_time > self.sync_time => Err(EventError::EdgeInverted {
                start: self.other_time,
                end: self.sync_time,
            }),
            _ => Ok(()),
        }
    }
}

impl<P: Ord> PartialOrd for StreamEvent<P> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Replay order: `(sync_time, kind priority, other_time, payload)`.
impl<P: Ord> Ord for StreamEvent<P> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sync_time
            .cmp(&other.sync_time)
            .then_with(|| self.kind.priority().cmp(&other.kind.priority()))
            .then_with(|| self.other_time.cmp(&other.other_time))
            .then_with(|| self.payload.cmp(&other.payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_is_one_tick() {
        let e = StreamEvent::point(7, 1u8);
        assert_eq!(e.start_time(), 7);
        assert_eq!(e.end_time(), 8);
        assert!(e.validate().is_ok());
    }

    #[test]
    fn test_end_edge_times() {
        let e = StreamEvent::end(30, 10, "x");
        assert_eq!(e.start_time(), 10);
        assert_eq!(e.end_time(), 30);
        assert!(e.validate().is_ok());
    }

    #[test]
    fn test_empty_interval_rejected() {
        let e = StreamEvent::interval(10, 10, 0i32);
        assert_eq!(
            e.validate(),
            Err(EventError::EmptyInterval { start: 10, end: 10 })
        );
    }

    #[test]
    fn test_inverted_edge_rejected() {
        let e = StreamEvent::end(5, 9, 0i32);
        assert!(matches!(e.validate(), Err(EventError::EdgeInverted { .. })));
    }

    #[test]
    fn test_data_at_infinity_rejected() {
        let e = StreamEvent::start(INFINITY, 0i32);
        assert!(matches!(e.validate(), Err(EventError::DataAtInfinity { .. })));
    }

    #[test]
    fn test_missing_payload_rejected() {
        let mut e = StreamEvent::point(3, 0i32);
        e.payload = None;
        assert!(matches!(e.validate(), Err(EventError::MissingPayload { .. })));
    }

    #[test]
    fn test_retractions_sort_before_opens() {
        let mut events = vec![
            StreamEvent::point(5, 1),
            StreamEvent::start(5, 1),
            StreamEvent::punctuation(5),
            StreamEvent::end(5, 2, 1),
            StreamEvent::interval(4, 9, 1),
        ];
        events.sort();
        let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::Interval,
                EventKind::End,
                EventKind::Punctuation,
                EventKind::Start,
                EventKind::Point,
            ]
        );
    }

    #[test]
    fn test_payload_breaks_ties() {
        let a = StreamEvent::interval(1, 2, 1);
        let b = StreamEvent::interval(1, 2, 2);
        assert!(a < b);
    }
}
