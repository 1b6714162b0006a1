//! Windowing as lifetime rewrites.
//!
//! A window never exists as an object of its own: each shape is a rule that
//! rewrites event lifetimes before they reach an aggregate.
//!
//! - **Tumbling**: the start is floored to the grid, the lifetime becomes
//!   one grid cell.
//! - **Hopping**: every event is replicated into each window it intersects,
//!   with the window's span as lifetime.
//! - **Sliding**: the lifetime becomes `[start, start + size)`.
//! - **Session**: events whose starts are at most `gap` apart share the
//!   session's lifetime `[first_start, last_start + gap)`. An optional
//!   maximum duration cuts a session at `first_start + max_duration`.
//!
//! Tumbling and sliding are stateless (see [`crate::lifetime`]); hopping
//! and session buffer events here so that output stays ordered.

use crate::error::EngineError;
use crate::operator::Operator;
use crate::persistence::{state_from_value, state_to_value, CheckpointError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::SmallVec;
use std::collections::BTreeMap;
use tempora_core::{EventKind, Payload, StreamEvent, Timestamp, INFINITY};
use thiserror::Error;

/// Invalid window parameters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WindowError {
    #[error("window {param} must be positive, got {value}")]
    NonPositive { param: &'static str, value: i64 },
}

fn positive(param: &'static str, value: i64) -> Result<i64, WindowError> {
    if value > 0 {
        Ok(value)
    } else {
        Err(WindowError::NonPositive { param, value })
    }
}

/// A validated window shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowShape {
    Tumbling { size: i64, offset: i64 },
    Hopping { size: i64, hop: i64, offset: i64 },
    Sliding { size: i64 },
    Session { gap: i64, max_duration: Option<i64> },
}

impl WindowShape {
    pub fn tumbling(size: i64, offset: i64) -> Result<Self, WindowError> {
        let size = positive("size", size)?;
        Ok(WindowShape::Tumbling {
            size,
            offset: offset.rem_euclid(size),
        })
    }

    pub fn hopping(size: i64, hop: i64, offset: i64) -> Result<Self, WindowError> {
        let size = positive("size", size)?;
        let hop = positive("hop", hop)?;
        Ok(WindowShape::Hopping {
            size,
            hop,
            offset: offset.rem_euclid(hop),
        })
    }

    pub fn sliding(size: i64) -> Result<Self, WindowError> {
        Ok(WindowShape::Sliding {
            size: positive("size", size)?,
        })
    }

    pub fn session(gap: i64) -> Result<Self, WindowError> {
        Ok(WindowShape::Session {
            gap: positive("gap", gap)?,
            max_duration: None,
        })
    }

    /// A session window no session of which lasts longer than `max_duration`.
    pub fn capped_session(gap: i64, max_duration: i64) -> Result<Self, WindowError> {
        Ok(WindowShape::Session {
            gap: positive("gap", gap)?,
            max_duration: Some(positive("maximum duration", max_duration)?),
        })
    }
}

/// Largest grid point `<= time` on the grid `offset + k * period`, or
/// `Timestamp::MIN` when that point is not representable.
pub fn floor_to_grid(time: Timestamp, period: i64, offset: i64) -> Timestamp {
    time.saturating_sub(time.wrapping_sub(offset).rem_euclid(period))
}

/// Smallest grid point `> time`.
pub fn first_grid_after(time: Timestamp, period: i64, offset: i64) -> Timestamp {
    floor_to_grid(time, period, offset).saturating_add(period)
}

// =============================================================================
// Hopping replication
// =============================================================================

type Replicas = SmallVec<[Timestamp; 8]>;

#[derive(Serialize, Deserialize)]
#[serde(bound = "P: Payload")]
struct OpenEdge<P> {
    start: Timestamp,
    payload: P,
    /// Next window start not yet replicated.
    next_window: Timestamp,
}

#[derive(Serialize, Deserialize)]
#[serde(bound = "P: Payload")]
struct HoppingState<P> {
    buffered: Vec<StreamEvent<P>>,
    open: Vec<OpenEdge<P>>,
    emitted_punctuation: Timestamp,
}

/// Replicates events into every hopping window they intersect.
///
/// An event `[s, e)` lands in every window `[w, w + size)` with
/// `w < e` and `w + size > s`; each replica carries the window's span.
/// Open Start-edges keep producing replicas for each new window until their
/// End-edge arrives.
pub struct HoppingExpand<P> {
    size: i64,
    hop: i64,
    offset: i64,
    buffer: BTreeMap<Timestamp, Vec<StreamEvent<P>>>,
    open: Vec<OpenEdge<P>>,
    emitted_punctuation: Timestamp,
}

impl<P> HoppingExpand<P> {
    pub fn new(size: i64, hop: i64, offset: i64) -> Self {
        Self {
            size,
            hop,
            offset,
            buffer: BTreeMap::new(),
            open: Vec::new(),
            emitted_punctuation: Timestamp::MIN,
        }
    }

    /// First window that can contain time `t`.
    fn first_window_containing(&self, t: Timestamp) -> Timestamp {
        first_grid_after(t.saturating_sub(self.size), self.hop, self.offset)
    }

    /// Windows intersecting `[start, end)`, capped below `limit`.
    fn windows(&self, start: Timestamp, end: Timestamp, limit: Timestamp) -> Replicas {
        let mut out = Replicas::new();
        let mut w = self.first_window_containing(start);
        while w < end && w < limit {
            out.push(w);
            w = w.saturating_add(self.hop);
        }
        out
    }
}

impl<P: Payload + PartialEq> HoppingExpand<P> {
    fn place(&mut self, window: Timestamp, payload: P) {
        let replica = StreamEvent::interval(window, window.saturating_add(self.size), payload);
        self.buffer.entry(window).or_default().push(replica);
    }

    /// Replicates open edges into every window starting before `t`.
    fn advance_open(&mut self, t: Timestamp) {
        let hop = self.hop;
        let mut placed = Vec::new();
        for edge in &mut self.open {
            while edge.next_window < t {
                placed.push((edge.next_window, edge.payload.clone()));
                edge.next_window = edge.next_window.saturating_add(hop);
            }
        }
        for (w, p) in placed {
            self.place(w, p);
        }
    }

    fn release_before(&mut self, bound: Timestamp, out: &mut Vec<StreamEvent<P>>) {
        while let Some(entry) = self.buffer.first_entry() {
            if *entry.key() >= bound {
                break;
            }
            out.extend(entry.remove());
        }
    }
}

impl<P: Payload + PartialEq> Operator<P, P> for HoppingExpand<P> {
    fn on_event(&mut self, event: StreamEvent<P>, out: &mut Vec<StreamEvent<P>>) -> Result<(), EngineError> {
        let t = event.sync_time;
        if event.is_punctuation() {
            if t == INFINITY {
                // Open edges never close; their replicas end here.
                self.open.clear();
                self.release_before(INFINITY, out);
                out.extend(self.buffer.values_mut().flat_map(std::mem::take));
                self.buffer.clear();
                if self.emitted_punctuation < INFINITY {
                    self.emitted_punctuation = INFINITY;
                    out.push(event);
                }
                return Ok(());
            }
            self.advance_open(t);
            let bound = self.first_window_containing(t);
            self.release_before(bound, out);
            if bound > self.emitted_punctuation {
                self.emitted_punctuation = bound;
                out.push(StreamEvent::punctuation(bound));
            }
            return Ok(());
        }

        self.advance_open(t);
        match event.kind {
            EventKind::Interval | EventKind::Point => {
                let end = event.end_time();
                if let Some(payload) = event.payload {
                    for w in self.windows(t, end, INFINITY) {
                        self.place(w, payload.clone());
                    }
                }
            }
            EventKind::Start => {
                if let Some(payload) = event.payload {
                    let windows = self.windows(t, INFINITY, t.saturating_add(1));
                    for &w in &windows {
                        self.place(w, payload.clone());
                    }
                    let next_window = windows
                        .last()
                        .map_or_else(|| self.first_window_containing(t), |w| w.saturating_add(self.hop));
                    self.open.push(OpenEdge {
                        start: t,
                        payload,
                        next_window,
                    });
                }
            }
            EventKind::End => {
                let start = event.other_time;
                if let Some(payload) = event.payload {
                    if let Some(pos) = self
                        .open
                        .iter()
                        .position(|edge| edge.start == start && edge.payload == payload)
                    {
                        self.open.remove(pos);
                    }
                }
            }
            EventKind::Punctuation => {}
        }
        let bound = self.first_window_containing(t);
        self.release_before(bound, out);
        Ok(())
    }

    fn is_idle(&self) -> bool {
        self.buffer.is_empty() && self.open.is_empty()
    }

    fn serialize_state(&self) -> Result<Value, CheckpointError> {
        let state = HoppingState {
            buffered: self.buffer.values().flatten().cloned().collect(),
            open: self
                .open
                .iter()
                .map(|e| OpenEdge {
                    start: e.start,
                    payload: e.payload.clone(),
                    next_window: e.next_window,
                })
                .collect(),
            emitted_punctuation: self.emitted_punctuation,
        };
        state_to_value(&state)
    }

    fn deserialize_state(&mut self, state: Value) -> Result<(), CheckpointError> {
        let state: HoppingState<P> = state_from_value(state)?;
        self.buffer.clear();
        for e in state.buffered {
            self.buffer.entry(e.sync_time).or_default().push(e);
        }
        self.open = state.open;
        self.emitted_punctuation = state.emitted_punctuation;
        Ok(())
    }
}

// =============================================================================
// Session windows
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "P: Payload")]
struct OpenSession<P> {
    start: Timestamp,
    last_start: Timestamp,
    members: Vec<P>,
}

#[derive(Serialize, Deserialize)]
#[serde(bound = "P: Payload")]
struct SessionState<P> {
    open: Option<OpenSession<P>>,
    emitted_punctuation: Timestamp,
}

/// Groups events whose starts are at most `gap` apart into sessions.
///
/// Members are held until the session closes, then emitted with the
/// session's lifetime. End-edges carry no new start and are dropped.
pub struct SessionWindow<P> {
    gap: i64,
    max_duration: Option<i64>,
    open: Option<OpenSession<P>>,
    emitted_punctuation: Timestamp,
}

impl<P> SessionWindow<P> {
    pub fn new(gap: i64) -> Self {
        Self {
            gap,
            max_duration: None,
            open: None,
            emitted_punctuation: Timestamp::MIN,
        }
    }

    /// Closes every session at `start + max_duration` at the latest.
    pub fn with_max_duration(mut self, max_duration: Option<i64>) -> Self {
        self.max_duration = max_duration;
        self
    }

    /// First instant that no longer belongs to `session`.
    fn session_end(&self, session: &OpenSession<P>) -> Timestamp {
        let by_gap = session.last_start.saturating_add(self.gap);
        match self.max_duration {
            Some(max) => by_gap.min(session.start.saturating_add(max)),
            None => by_gap,
        }
    }
}

impl<P: Payload> SessionWindow<P> {
    fn close(&mut self, out: &mut Vec<StreamEvent<P>>) {
        if let Some(session) = self.open.take() {
            let end = self.session_end(&session);
            for payload in session.members {
                out.push(StreamEvent::interval(session.start, end, payload));
            }
        }
    }

    fn forward_punctuation(&mut self, time: Timestamp, out: &mut Vec<StreamEvent<P>>) {
        let held = self.open.as_ref().map_or(time, |s| s.start.min(time));
        if held > self.emitted_punctuation {
            self.emitted_punctuation = held;
            out.push(StreamEvent::punctuation(held));
        }
    }
}

impl<P: Payload> Operator<P, P> for SessionWindow<P> {
    fn on_event(&mut self, event: StreamEvent<P>, out: &mut Vec<StreamEvent<P>>) -> Result<(), EngineError> {
        let t = event.sync_time;
        let expired = self.open.as_ref().is_some_and(|s| {
            t > s.last_start.saturating_add(self.gap)
                || self.max_duration.is_some_and(|max| t >= s.start.saturating_add(max))
        });
        if expired {
            self.close(out);
        }
        match event.kind {
            EventKind::Punctuation => self.forward_punctuation(t, out),
            EventKind::End => {}
            _ => {
                if let Some(payload) = event.payload {
                    match &mut self.open {
                        Some(session) => {
                            session.last_start = t;
                            session.members.push(payload);
                        }
                        None => {
                            self.open = Some(OpenSession {
                                start: t,
                                last_start: t,
                                members: vec![payload],
                            })
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn is_idle(&self) -> bool {
        self.open.is_none()
    }

    fn serialize_state(&self) -> Result<Value, CheckpointError> {
        state_to_value(&SessionState {
            open: self.open.clone(),
            emitted_punctuation: self.emitted_punctuation,
        })
    }

    fn deserialize_state(&mut self, state: Value) -> Result<(), CheckpointError> {
        let state: SessionState<P> = state_from_value(state)?;
        self.open = state.open;
        self.emitted_punctuation = state.emitted_punctuation;
        Ok(())
    }
}
