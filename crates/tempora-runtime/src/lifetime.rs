//! Lifetime rewrites.
//!
//! [`AlterLifetime`] covers rewrites whose output order follows the input
//! order without buffering: fixed durations, shifts and tumbling grids.
//! [`EndRewrite`] covers clip and extend, which must hold End-edges until
//! their (new) end time is reached.

use crate::error::EngineError;
use crate::operator::Operator;
use crate::persistence::{state_from_value, state_to_value, CheckpointError};
use crate::window::floor_to_grid;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use tempora_core::{EventKind, Payload, StreamEvent, Timestamp, INFINITY};

/// A stateless lifetime rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifetimeMap {
    /// `[s, e) -> [s, s + duration)`
    Duration(i64),
    /// `[s, e) -> [s + delta, e + delta)`
    Shift(i64),
    /// `[s, e) -> [floor(s), floor(s) + size)` on a grid anchored at `offset`.
    Tumbling { size: i64, offset: i64 },
}

impl LifetimeMap {
    /// True when the new end depends only on the start, so edges collapse
    /// into intervals and End-edges disappear.
    fn drops_end_edges(self) -> bool {
        !matches!(self, LifetimeMap::Shift(_))
    }

    fn start_of(self, start: Timestamp) -> Timestamp {
        match self {
            LifetimeMap::Duration(_) => start,
            LifetimeMap::Shift(delta) => shift(start, delta),
            LifetimeMap::Tumbling { size, offset } => floor_to_grid(start, size, offset),
        }
    }

    fn end_of(self, start: Timestamp, end: Timestamp) -> Timestamp {
        match self {
            LifetimeMap::Duration(d) => start.saturating_add(d),
            LifetimeMap::Shift(delta) => shift(end, delta),
            LifetimeMap::Tumbling { size, offset } => floor_to_grid(start, size, offset).saturating_add(size),
        }
    }

    fn punctuation(self, time: Timestamp) -> Timestamp {
        if time == INFINITY {
            return INFINITY;
        }
        match self {
            LifetimeMap::Duration(_) => time,
            LifetimeMap::Shift(delta) => shift(time, delta),
            LifetimeMap::Tumbling { size, offset } => floor_to_grid(time, size, offset),
        }
    }
}

fn shift(time: Timestamp, delta: i64) -> Timestamp {
    if time == INFINITY {
        INFINITY
    } else {
        time.saturating_add(delta)
    }
}

/// Applies a [`LifetimeMap`] to every event.
pub struct AlterLifetime<P> {
    map: LifetimeMap,
    last_punctuation: Timestamp,
    _marker: PhantomData<fn(P) -> P>,
}

impl<P> AlterLifetime<P> {
    pub fn new(map: LifetimeMap) -> Self {
        Self {
            map,
            last_punctuation: Timestamp::MIN,
            _marker: PhantomData,
        }
    }
}

impl<P: Payload> Operator<P, P> for AlterLifetime<P> {
    fn on_event(&mut self, event: StreamEvent<P>, out: &mut Vec<StreamEvent<P>>) -> Result<(), EngineError> {
        let map = self.map;
        let rewritten = match event.kind {
            EventKind::Punctuation => {
                let time = map.punctuation(event.sync_time);
                if time <= self.last_punctuation {
                    return Ok(());
                }
                self.last_punctuation = time;
                StreamEvent::punctuation(time)
            }
            EventKind::End if map.drops_end_edges() => return Ok(()),
            EventKind::End => StreamEvent {
                kind: EventKind::End,
                sync_time: map.end_of(event.other_time, event.sync_time),
                other_time: map.start_of(event.other_time),
                payload: event.payload,
            },
            EventKind::Start if !map.drops_end_edges() => StreamEvent {
                kind: EventKind::Start,
                sync_time: map.start_of(event.sync_time),
                other_time: INFINITY,
                payload: event.payload,
            },
            EventKind::Point if !map.drops_end_edges() => StreamEvent {
                kind: EventKind::Point,
                sync_time: map.start_of(event.sync_time),
                other_time: map.end_of(event.sync_time, event.other_time),
                payload: event.payload,
            },
            _ => {
                let start = event.start_time();
                let end = event.end_time();
                StreamEvent {
                    kind: EventKind::Interval,
                    sync_time: map.start_of(start),
                    other_time: map.end_of(start, end),
                    payload: event.payload,
                }
            }
        };
        out.push(rewritten);
        Ok(())
    }

    fn serialize_state(&self) -> Result<Value, CheckpointError> {
        state_to_value(&self.last_punctuation)
    }

    fn deserialize_state(&mut self, state: Value) -> Result<(), CheckpointError> {
        self.last_punctuation = state_from_value(state)?;
        Ok(())
    }
}

// =============================================================================
// Clip and extend
// =============================================================================

/// End rewrites that need buffering of End-edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndMap {
    /// Caps every lifetime at `max` ticks.
    Clip(i64),
    /// Lengthens every lifetime by `extra` ticks.
    Extend(i64),
}

#[derive(Serialize, Deserialize)]
#[serde(bound = "P: Payload")]
struct EndRewriteState<P> {
    pending: Vec<(Timestamp, Timestamp, P)>,
}

/// Clip/extend operator. Intervals are rewritten in place; End-edges are
/// parked until their rewritten end time and released in order.
pub struct EndRewrite<P> {
    map: EndMap,
    /// end time -> (start, payload)
    pending: BTreeMap<Timestamp, Vec<(Timestamp, P)>>,
}

impl<P> EndRewrite<P> {
    pub fn new(map: EndMap) -> Self {
        Self {
            map,
            pending: BTreeMap::new(),
        }
    }
}

impl<P: Payload + PartialEq> EndRewrite<P> {
    fn release_through(&mut self, time: Timestamp, out: &mut Vec<StreamEvent<P>>) {
        while let Some(entry) = self.pending.first_entry() {
            if *entry.key() > time {
                break;
            }
            let end = *entry.key();
            for (start, payload) in entry.remove() {
                out.push(StreamEvent::end(end, start, payload));
            }
        }
    }

    fn new_end(&self, start: Timestamp, end: Timestamp) -> Timestamp {
        match self.map {
            EndMap::Clip(max) => end.min(start.saturating_add(max)),
            EndMap::Extend(extra) => end.saturating_add(extra),
        }
    }
}

impl<P: Payload + PartialEq> Operator<P, P> for EndRewrite<P> {
    fn on_event(&mut self, event: StreamEvent<P>, out: &mut Vec<StreamEvent<P>>) -> Result<(), EngineError> {
        self.release_through(event.sync_time, out);
        match event.kind {
            EventKind::Punctuation => out.push(event),
            EventKind::Interval | EventKind::Point => {
                let start = event.sync_time;
                let end = self.new_end(start, event.end_time());
                out.push(StreamEvent {
                    kind: if end == start.saturating_add(1) {
                        EventKind::Point
                    } else {
                        EventKind::Interval
                    },
                    sync_time: start,
                    other_time: end,
                    payload: event.payload,
                });
            }
            EventKind::Start => {
                if let (EndMap::Clip(max), Some(payload)) = (self.map, event.payload.clone()) {
                    let cap = event.sync_time.saturating_add(max);
                    self.pending.entry(cap).or_default().push((event.sync_time, payload));
                }
                out.push(event);
            }
            EventKind::End => {
                let start = event.other_time;
                let Some(payload) = event.payload else {
                    return Ok(());
                };
                match self.map {
                    EndMap::Extend(extra) => {
                        let end = event.sync_time.saturating_add(extra);
                        self.pending.entry(end).or_default().push((start, payload));
                    }
                    EndMap::Clip(max) => {
                        // The synthetic end is still parked only if the real
                        // one arrived first; otherwise it was already emitted.
                        let cap = start.saturating_add(max);
                        if let Some(parked) = self.pending.get_mut(&cap) {
                            if let Some(pos) = parked.iter().position(|(s, p)| *s == start && *p == payload) {
                                parked.remove(pos);
                                if parked.is_empty() {
                                    self.pending.remove(&cap);
                                }
                                out.push(StreamEvent::end(event.sync_time, start, payload));
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }

    fn serialize_state(&self) -> Result<Value, CheckpointError> {
        let pending = self
            .pending
            .iter()
            .flat_map(|(end, parked)| parked.iter().map(move |(start, p)| (*end, *start, p.clone())))
            .collect();
        state_to_value(&EndRewriteState { pending })
    }

    fn deserialize_state(&mut self, state: Value) -> Result<(), CheckpointError> {
        let state: EndRewriteState<P> = state_from_value(state)?;
        self.pending.clear();
        for (end, start, payload) in state.pending {
            self.pending.entry(end).or_default().push((start, payload));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run<O: Operator<i32, i32>>(op: &mut O, events: Vec<StreamEvent<i32>>) -> Vec<StreamEvent<i32>> {
        let mut out = Vec::new();
        for e in events {
            op.on_event(e, &mut out).unwrap();
        }
        out
    }

    #[test]
    fn test_alter_duration_collapses_edges() {
        let mut op = AlterLifetime::new(LifetimeMap::Duration(5));
        let out = run(
            &mut op,
            vec![StreamEvent::start(1, 7), StreamEvent::end(3, 1, 7), StreamEvent::point(4, 8)],
        );
        assert_eq!(out, vec![StreamEvent::interval(1, 6, 7), StreamEvent::interval(4, 9, 8)]);
    }

    #[test]
    fn test_shift_moves_edges_and_punctuations() {
        let mut op = AlterLifetime::new(LifetimeMap::Shift(10));
        let out = run(
            &mut op,
            vec![
                StreamEvent::start(1, 7),
                StreamEvent::end(3, 1, 7),
                StreamEvent::punctuation(5),
                StreamEvent::punctuation(INFINITY),
            ],
        );
        assert_eq!(
            out,
            vec![
                StreamEvent::start(11, 7),
                StreamEvent::end(13, 11, 7),
                StreamEvent::punctuation(15),
                StreamEvent::punctuation(INFINITY),
            ]
        );
    }

    #[test]
    fn test_tumbling_floors_to_grid() {
        let mut op = AlterLifetime::new(LifetimeMap::Tumbling { size: 10, offset: 0 });
        let out = run(
            &mut op,
            vec![StreamEvent::point(3, 1), StreamEvent::interval(12, 40, 2), StreamEvent::punctuation(17)],
        );
        assert_eq!(
            out,
            vec![
                StreamEvent::interval(0, 10, 1),
                StreamEvent::interval(10, 20, 2),
                StreamEvent::punctuation(10),
            ]
        );
    }

    #[test]
    fn test_extend_parks_end_edges() {
        let mut op = EndRewrite::new(EndMap::Extend(5));
        let out = run(
            &mut op,
            vec![
                StreamEvent::start(1, 7),
                StreamEvent::end(3, 1, 7),
                StreamEvent::point(6, 1),
                StreamEvent::point(9, 2),
            ],
        );
        assert_eq!(
            out,
            vec![
                StreamEvent::start(1, 7),
                StreamEvent::interval(6, 12, 1),
                StreamEvent::end(8, 1, 7),
                StreamEvent::interval(9, 15, 2),
            ]
        );
        assert!(op.is_idle());
    }

    #[test]
    fn test_clip_caps_intervals_and_edges() {
        let mut op = EndRewrite::new(EndMap::Clip(4));
        let out = run(
            &mut op,
            vec![
                StreamEvent::interval(0, 10, 1),
                StreamEvent::start(2, 2),
                StreamEvent::start(3, 3),
                StreamEvent::end(4, 3, 3),
                StreamEvent::end(9, 2, 2),
            ],
        );
        assert_eq!(
            out,
            vec![
                StreamEvent::interval(0, 4, 1),
                StreamEvent::start(2, 2),
                StreamEvent::start(3, 3),
                StreamEvent::end(4, 3, 3),
                StreamEvent::end(6, 2, 2),
            ]
        );
        assert!(op.is_idle());
    }
}
