//! Operators that drive an [`Aggregate`] over a stream.
//!
//! - [`SnapshotAggregate`]: the "ongoing" aggregate. The result is
//!   recomputed whenever the set of live inputs changes and is reported as
//!   a sequence of edges, one `Start` per distinct value and an `End` when
//!   it is superseded.
//! - [`WindowAggregate`]: tumbling and hopping windows. Two states are
//!   kept, everything that started and everything that ended before the
//!   current left edge; each window is their `difference`, so window
//!   contents are never rescanned.
//!
//! Both operators rebase after every result they report: the difference
//! becomes the new entered state and the exited state starts over. State
//! therefore folds only inputs that are still live, never the history.

use crate::aggregation::Aggregate;
use crate::error::EngineError;
use crate::operator::Operator;
use crate::persistence::{state_from_value, state_to_value, CheckpointError};
use crate::window::first_grid_after;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use tempora_core::{EventKind, Payload, StreamEvent, Timestamp, INFINITY};

/// How a [`SnapshotAggregate`] removes inputs whose lifetime ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RetractionMode {
    /// Calls `deaccumulate` on the live state.
    #[default]
    Deaccumulate,
    /// Folds retired inputs into a second state and reports
    /// `difference(entered, exited)`.
    Difference,
}

// =============================================================================
// Snapshot aggregate
// =============================================================================

#[derive(Serialize, Deserialize)]
#[serde(bound = "I: Payload, S: Serialize + DeserializeOwned, R: Payload")]
struct SnapshotState<I, S, R> {
    entered: S,
    exited: S,
    live: u64,
    pending: Vec<(Timestamp, Timestamp, I)>,
    dirty: Option<Timestamp>,
    current: Option<(Timestamp, R)>,
    emitted_punctuation: Timestamp,
}

/// Aggregate over all currently live inputs.
///
/// Changes at one instant are batched: the result for instant `b` is only
/// emitted once time moves past `b`, so an instant produces at most one
/// `End`/`Start` pair and nothing when the value is unchanged.
pub struct SnapshotAggregate<I, A: Aggregate<I>> {
    aggregate: A,
    mode: RetractionMode,
    entered: A::State,
    exited: A::State,
    live: u64,
    /// end time -> (start, input) for inputs whose end is already known
    pending: BTreeMap<Timestamp, Vec<(Timestamp, I)>>,
    dirty: Option<Timestamp>,
    current: Option<(Timestamp, A::Output)>,
    emitted_punctuation: Timestamp,
}

impl<I, A: Aggregate<I>> SnapshotAggregate<I, A> {
    pub fn new(aggregate: A, mode: RetractionMode) -> Self {
        let entered = aggregate.initial_state();
        let exited = aggregate.initial_state();
        Self {
            aggregate,
            mode,
            entered,
            exited,
            live: 0,
            pending: BTreeMap::new(),
            dirty: None,
            current: None,
            emitted_punctuation: Timestamp::MIN,
        }
    }

    fn enter(&mut self, time: Timestamp, input: &I) {
        self.aggregate.accumulate(&mut self.entered, time, input);
        self.live += 1;
        self.dirty = Some(time);
    }

    fn exit(&mut self, time: Timestamp, input: &I) {
        match self.mode {
            RetractionMode::Deaccumulate => self.aggregate.deaccumulate(&mut self.entered, time, input),
            RetractionMode::Difference => self.aggregate.accumulate(&mut self.exited, time, input),
        }
        self.live = self.live.saturating_sub(1);
        self.dirty = Some(time);
    }

    /// Folds the exited state out of the entered one.
    fn rebase(&mut self) {
        if self.mode == RetractionMode::Difference {
            self.entered = self.aggregate.difference(&self.entered, &self.exited);
            self.exited = self.aggregate.initial_state();
        }
    }

    fn emit(&mut self, time: Timestamp, out: &mut Vec<StreamEvent<A::Output>>) {
        if self.live == 0 {
            self.entered = self.aggregate.initial_state();
            self.exited = self.aggregate.initial_state();
        } else {
            self.rebase();
        }
        let next = (self.live > 0).then(|| self.aggregate.compute_result(&self.entered));
        let unchanged = match (&self.current, &next) {
            (Some((_, prev)), Some(value)) => prev == value,
            (None, None) => true,
            _ => false,
        };
        if !unchanged {
            if let Some((start, prev)) = self.current.take() {
                out.push(StreamEvent::end(time, start, prev));
            }
            if let Some(value) = next {
                out.push(StreamEvent::start(time, value.clone()));
                self.current = Some((time, value));
            }
        }
    }

    /// Settles every instant strictly before `time`.
    fn flush_before(&mut self, time: Timestamp, out: &mut Vec<StreamEvent<A::Output>>) {
        loop {
            let next_end = self.pending.keys().next().copied().filter(|e| *e < time);
            if let Some(d) = self.dirty.filter(|d| *d < time) {
                if next_end.is_none_or(|e| d < e) {
                    self.dirty = None;
                    self.emit(d, out);
                    continue;
                }
            }
            let Some(end) = next_end else {
                break;
            };
            if let Some(retired) = self.pending.remove(&end) {
                for (_, input) in &retired {
                    self.exit(end, input);
                }
            }
        }
    }
}

impl<I, A> Operator<I, A::Output> for SnapshotAggregate<I, A>
where
    I: Payload,
    A: Aggregate<I>,
{
    fn on_event(&mut self, event: StreamEvent<I>, out: &mut Vec<StreamEvent<A::Output>>) -> Result<(), EngineError> {
        let t = event.sync_time;
        self.flush_before(t, out);
        match event.kind {
            EventKind::Punctuation => {
                if t > self.emitted_punctuation {
                    self.emitted_punctuation = t;
                    out.push(StreamEvent::punctuation(t));
                }
            }
            EventKind::Point | EventKind::Interval => {
                let end = event.end_time();
                if let Some(input) = event.payload {
                    self.enter(t, &input);
                    self.pending.entry(end).or_default().push((t, input));
                }
            }
            EventKind::Start => {
                if let Some(input) = event.payload {
                    self.enter(t, &input);
                }
            }
            EventKind::End => {
                if let Some(input) = event.payload {
                    self.exit(t, &input);
                }
            }
        }
        Ok(())
    }

    fn is_idle(&self) -> bool {
        self.live == 0 && self.pending.is_empty() && self.dirty.is_none() && self.current.is_none()
    }

    fn serialize_state(&self) -> Result<Value, CheckpointError> {
        let pending = self
            .pending
            .iter()
            .flat_map(|(end, inputs)| inputs.iter().map(move |(start, i)| (*end, *start, i.clone())))
            .collect();
        state_to_value(&SnapshotState {
            entered: self.entered.clone(),
            exited: self.exited.clone(),
            live: self.live,
            pending,
            dirty: self.dirty,
            current: self.current.clone(),
            emitted_punctuation: self.emitted_punctuation,
        })
    }

    fn deserialize_state(&mut self, state: Value) -> Result<(), CheckpointError> {
        let state: SnapshotState<I, A::State, A::Output> = state_from_value(state)?;
        self.entered = state.entered;
        self.exited = state.exited;
        self.live = state.live;
        self.pending.clear();
        for (end, start, input) in state.pending {
            self.pending.entry(end).or_default().push((start, input));
        }
        self.dirty = state.dirty;
        self.current = state.current;
        self.emitted_punctuation = state.emitted_punctuation;
        Ok(())
    }
}

// =============================================================================
// Window aggregate
// =============================================================================

/// Which windows an input counts in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Membership {
    /// The window containing the input's start time.
    Start,
    /// Every window its lifetime intersects.
    Lifetime,
}

#[derive(Serialize, Deserialize)]
#[serde(bound = "I: Payload, S: Serialize + DeserializeOwned")]
struct WindowState<I, S> {
    started: S,
    ended: S,
    started_count: u64,
    ended_count: u64,
    pending: Vec<(Timestamp, I)>,
    next_emit: Option<Timestamp>,
    emitted_punctuation: Timestamp,
}

/// Fused tumbling/hopping window aggregate.
///
/// Window `[L, R)` is final once time reaches `R`; it is then emitted as an
/// Interval `[L, R)` unless it is empty.
pub struct WindowAggregate<I, A: Aggregate<I>> {
    aggregate: A,
    size: i64,
    hop: i64,
    offset: i64,
    membership: Membership,
    started: A::State,
    ended: A::State,
    started_count: u64,
    ended_count: u64,
    /// membership end -> inputs that leave the windows starting at or after it
    pending: BTreeMap<Timestamp, Vec<I>>,
    /// right edge of the next window to emit
    next_emit: Option<Timestamp>,
    emitted_punctuation: Timestamp,
    _marker: PhantomData<fn(I)>,
}

impl<I, A: Aggregate<I>> WindowAggregate<I, A> {
    pub fn tumbling(aggregate: A, size: i64, offset: i64) -> Self {
        Self::new(aggregate, size, size, offset, Membership::Start)
    }

    pub fn hopping(aggregate: A, size: i64, hop: i64, offset: i64) -> Self {
        Self::new(aggregate, size, hop, offset, Membership::Lifetime)
    }

    fn new(aggregate: A, size: i64, hop: i64, offset: i64, membership: Membership) -> Self {
        let started = aggregate.initial_state();
        let ended = aggregate.initial_state();
        Self {
            aggregate,
            size,
            hop,
            offset,
            membership,
            started,
            ended,
            started_count: 0,
            ended_count: 0,
            pending: BTreeMap::new(),
            next_emit: None,
            emitted_punctuation: Timestamp::MIN,
            _marker: PhantomData,
        }
    }

    /// Left edge of the earliest window that can still contain `time`.
    fn first_left_edge(&self, time: Timestamp) -> Timestamp {
        first_grid_after(time.saturating_sub(self.size), self.hop, self.offset)
    }

    fn start(&mut self, time: Timestamp, input: &I) {
        self.aggregate.accumulate(&mut self.started, time, input);
        self.started_count += 1;
        if self.next_emit.is_none() {
            self.next_emit = Some(self.first_left_edge(time).saturating_add(self.size));
        }
    }

    fn schedule_end(&mut self, end: Timestamp, input: I) {
        self.pending.entry(end).or_default().push(input);
    }

    fn fold_ends_through(&mut self, left: Timestamp) {
        while let Some(entry) = self.pending.first_entry() {
            if *entry.key() > left {
                break;
            }
            let end = *entry.key();
            for input in entry.remove() {
                self.aggregate.accumulate(&mut self.ended, end, &input);
                self.ended_count += 1;
            }
        }
    }

    /// Leaves `started` folding exactly the inputs that are still live.
    fn rebase(&mut self) {
        if self.started_count == self.ended_count {
            self.started = self.aggregate.initial_state();
        } else if self.ended_count > 0 {
            self.started = self.aggregate.difference(&self.started, &self.ended);
        } else {
            return;
        }
        self.ended = self.aggregate.initial_state();
        self.started_count = self.started_count.saturating_sub(self.ended_count);
        self.ended_count = 0;
    }

    fn reset(&mut self) {
        self.started = self.aggregate.initial_state();
        self.ended = self.aggregate.initial_state();
        self.started_count = 0;
        self.ended_count = 0;
        self.next_emit = None;
    }

    /// Emits every window whose right edge is at or before `time`.
    fn advance_to(&mut self, time: Timestamp, out: &mut Vec<StreamEvent<A::Output>>) {
        while let Some(right) = self.next_emit {
            if right > time {
                break;
            }
            if time == INFINITY && self.pending.is_empty() {
                // Only open edges remain and they never close.
                self.reset();
                break;
            }
            let left = right.saturating_sub(self.size);
            self.fold_ends_through(left);
            self.rebase();
            if self.started_count > 0 {
                out.push(StreamEvent::interval(left, right, self.aggregate.compute_result(&self.started)));
            }
            self.next_emit = Some(right.saturating_add(self.hop));
            if self.started_count == 0 && self.pending.is_empty() {
                self.reset();
            }
        }
    }
}

impl<I, A> Operator<I, A::Output> for WindowAggregate<I, A>
where
    I: Payload,
    A: Aggregate<I>,
{
    fn on_event(&mut self, event: StreamEvent<I>, out: &mut Vec<StreamEvent<A::Output>>) -> Result<(), EngineError> {
        let t = event.sync_time;
        self.advance_to(t, out);
        if event.is_punctuation() {
            let forwarded = if t == INFINITY { INFINITY } else { self.first_left_edge(t) };
            if forwarded > self.emitted_punctuation {
                self.emitted_punctuation = forwarded;
                out.push(StreamEvent::punctuation(forwarded));
            }
            return Ok(());
        }

        let end = event.end_time();
        let Some(input) = event.payload else {
            return Ok(());
        };
        match (self.membership, event.kind) {
            (Membership::Start, EventKind::End) => {}
            (Membership::Start, _) => {
                self.start(t, &input);
                self.schedule_end(t.saturating_add(1), input);
            }
            (Membership::Lifetime, EventKind::Start) => self.start(t, &input),
            (Membership::Lifetime, EventKind::End) => self.schedule_end(t, input),
            (Membership::Lifetime, _) => {
                self.start(t, &input);
                self.schedule_end(end, input);
            }
        }
        Ok(())
    }

    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.started_count == self.ended_count && self.next_emit.is_none()
    }

    fn serialize_state(&self) -> Result<Value, CheckpointError> {
        let pending = self
            .pending
            .iter()
            .flat_map(|(end, inputs)| inputs.iter().map(move |i| (*end, i.clone())))
            .collect();
        state_to_value(&WindowState {
            started: self.started.clone(),
            ended: self.ended.clone(),
            started_count: self.started_count,
            ended_count: self.ended_count,
            pending,
            next_emit: self.next_emit,
            emitted_punctuation: self.emitted_punctuation,
        })
    }

    fn deserialize_state(&mut self, state: Value) -> Result<(), CheckpointError> {
        let state: WindowState<I, A::State> = state_from_value(state)?;
        self.started = state.started;
        self.ended = state.ended;
        self.started_count = state.started_count;
        self.ended_count = state.ended_count;
        self.pending.clear();
        for (end, input) in state.pending {
            self.pending.entry(end).or_default().push(input);
        }
        self.next_emit = state.next_emit;
        self.emitted_punctuation = state.emitted_punctuation;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::{Count, Max, Sum};

    fn run<O: Operator<i64, R>, R>(op: &mut O, events: Vec<StreamEvent<i64>>) -> Vec<StreamEvent<R>> {
        let mut out = Vec::new();
        for e in events {
            op.on_event(e, &mut out).unwrap();
        }
        out
    }

    fn sum() -> Sum<impl Fn(&i64) -> i64 + Send + 'static, i64> {
        Sum::new(|v: &i64| *v)
    }

    fn max() -> Max<impl Fn(&i64) -> i64 + Send + 'static, i64> {
        Max::new(|v: &i64| *v)
    }

    /// Serialized state size after 1 000 and after 10 000 events from `event`.
    fn state_sizes<O, R>(op: &mut O, event: impl Fn(i64) -> StreamEvent<i64>) -> (usize, usize, Vec<StreamEvent<R>>)
    where
        O: Operator<i64, R>,
    {
        let mut out = Vec::new();
        let mut early = 0;
        for t in 0..10_000 {
            op.on_event(event(t), &mut out).unwrap();
            if t == 999 {
                early = op.serialize_state().unwrap().to_string().len();
            }
        }
        let late = op.serialize_state().unwrap().to_string().len();
        (early, late, out)
    }

    // =========================================================================
    // Snapshot
    // =========================================================================

    #[test]
    fn test_snapshot_emits_changes_as_edges() {
        let mut op = SnapshotAggregate::new(sum(), RetractionMode::Deaccumulate);
        let out = run(
            &mut op,
            vec![
                StreamEvent::interval(1, 5, 10),
                StreamEvent::interval(3, 8, 5),
                StreamEvent::punctuation(INFINITY),
            ],
        );
        assert_eq!(
            out,
            vec![
                StreamEvent::start(1, 10),
                StreamEvent::end(3, 1, 10),
                StreamEvent::start(3, 15),
                StreamEvent::end(5, 3, 15),
                StreamEvent::start(5, 5),
                StreamEvent::end(8, 5, 5),
                StreamEvent::punctuation(INFINITY),
            ]
        );
        assert!(op.is_idle());
    }

    #[test]
    fn test_snapshot_batches_one_instant() {
        let mut op = SnapshotAggregate::new(Count::new(), RetractionMode::Deaccumulate);
        let out = run(
            &mut op,
            vec![
                StreamEvent::point(2, 1),
                StreamEvent::point(2, 2),
                StreamEvent::punctuation(4),
            ],
        );
        assert_eq!(
            out,
            vec![
                StreamEvent::start(2, 2u64),
                StreamEvent::end(3, 2, 2u64),
                StreamEvent::punctuation(4),
            ]
        );
    }

    #[test]
    fn test_snapshot_skips_unchanged_values() {
        let mut op = SnapshotAggregate::new(sum(), RetractionMode::Deaccumulate);
        // At 4 one input of 3 leaves and another of 3 arrives.
        let out = run(
            &mut op,
            vec![
                StreamEvent::interval(1, 4, 3),
                StreamEvent::interval(4, 6, 3),
                StreamEvent::punctuation(10),
            ],
        );
        assert_eq!(
            out,
            vec![
                StreamEvent::start(1, 3),
                StreamEvent::end(6, 1, 3),
                StreamEvent::punctuation(10),
            ]
        );
    }

    #[test]
    fn test_snapshot_difference_mode_matches_deaccumulate() {
        let events = vec![
            StreamEvent::start(1, 4),
            StreamEvent::interval(2, 9, 6),
            StreamEvent::end(5, 1, 4),
            StreamEvent::point(7, 1),
            StreamEvent::punctuation(INFINITY),
        ];
        let mut a = SnapshotAggregate::new(sum(), RetractionMode::Deaccumulate);
        let mut b = SnapshotAggregate::new(sum(), RetractionMode::Difference);
        assert_eq!(run(&mut a, events.clone()), run(&mut b, events));
    }

    #[test]
    fn test_difference_mode_state_tracks_live_inputs_only() {
        let mut op = SnapshotAggregate::new(max(), RetractionMode::Difference);
        let (early, late, out) = state_sizes(&mut op, |t| StreamEvent::interval(t, t + 10, t));
        assert!(late < 2 * early, "state grew from {early} to {late} bytes");
        assert_eq!(out.last(), Some(&StreamEvent::start(9_998, Some(9_998))));
    }

    #[test]
    fn test_snapshot_state_roundtrip() {
        let mut op = SnapshotAggregate::new(sum(), RetractionMode::Difference);
        run(&mut op, vec![StreamEvent::interval(1, 9, 2), StreamEvent::point(3, 5)]);
        let state = op.serialize_state().unwrap();

        let mut restored = SnapshotAggregate::new(sum(), RetractionMode::Difference);
        restored.deserialize_state(state).unwrap();
        let tail = vec![StreamEvent::punctuation(INFINITY)];
        assert_eq!(run(&mut op, tail.clone()), run(&mut restored, tail));
    }

    // =========================================================================
    // Windows
    // =========================================================================

    #[test]
    fn test_tumbling_counts_by_start() {
        let mut op = WindowAggregate::tumbling(Count::new(), 10, 0);
        let out = run(
            &mut op,
            vec![
                StreamEvent::interval(1, 50, 0),
                StreamEvent::point(5, 0),
                StreamEvent::point(12, 0),
                StreamEvent::point(35, 0),
                StreamEvent::punctuation(INFINITY),
            ],
        );
        assert_eq!(
            out,
            vec![
                StreamEvent::interval(0, 10, 2u64),
                StreamEvent::interval(10, 20, 1u64),
                StreamEvent::interval(30, 40, 1u64),
                StreamEvent::punctuation(INFINITY),
            ]
        );
        assert!(op.is_idle());
    }

    #[test]
    fn test_hopping_counts_intersections() {
        let mut op = WindowAggregate::hopping(sum(), 10, 5, 0);
        let out = run(
            &mut op,
            vec![
                StreamEvent::point(3, 1),
                StreamEvent::point(7, 10),
                StreamEvent::punctuation(INFINITY),
            ],
        );
        assert_eq!(
            out,
            vec![
                StreamEvent::interval(-5, 5, 1),
                StreamEvent::interval(0, 10, 11),
                StreamEvent::interval(5, 15, 10),
                StreamEvent::punctuation(INFINITY),
            ]
        );
    }

    #[test]
    fn test_window_punctuation_is_held_to_open_window() {
        let mut op = WindowAggregate::hopping(Count::new(), 10, 5, 0);
        let out = run(&mut op, vec![StreamEvent::point(21, 1), StreamEvent::punctuation(22)]);
        assert_eq!(out, vec![StreamEvent::punctuation(15)]);
        assert!(!op.is_idle());
    }

    #[test]
    fn test_window_edges_span_many_windows() {
        let mut op = WindowAggregate::hopping(Count::new(), 4, 4, 0);
        let out = run(
            &mut op,
            vec![
                StreamEvent::start(1, 0),
                StreamEvent::end(10, 1, 0),
                StreamEvent::punctuation(INFINITY),
            ],
        );
        let windows: Vec<_> = out.iter().filter(|e| e.is_data()).map(|e| e.sync_time).collect();
        assert_eq!(windows, vec![0, 4, 8]);
    }

    #[test]
    fn test_window_state_tracks_live_inputs_only() {
        let mut op = WindowAggregate::tumbling(max(), 10, 0);
        let (early, late, out) = state_sizes(&mut op, |t| StreamEvent::point(t, t));
        assert!(late < 2 * early, "state grew from {early} to {late} bytes");
        assert_eq!(out.last(), Some(&StreamEvent::interval(9_980, 9_990, Some(9_989))));

        let mut op = WindowAggregate::hopping(max(), 30, 10, 0);
        let (early, late, _) = state_sizes(&mut op, |t| StreamEvent::interval(t, t + 25, t));
        assert!(late < 2 * early, "state grew from {early} to {late} bytes");
    }

    #[test]
    fn test_window_state_roundtrip() {
        let mut op = WindowAggregate::hopping(sum(), 6, 3, 0);
        run(&mut op, vec![StreamEvent::point(1, 4), StreamEvent::interval(4, 9, 2)]);
        let state = op.serialize_state().unwrap();

        let mut restored = WindowAggregate::hopping(sum(), 6, 3, 0);
        restored.deserialize_state(state).unwrap();
        let tail = vec![StreamEvent::point(11, 1), StreamEvent::punctuation(INFINITY)];
        assert_eq!(run(&mut op, tail.clone()), run(&mut restored, tail));
    }
}
