//! Operators that combine streams: temporal equi-join, union and multicast.
//!
//! Two-input operators see their inputs through [`Merge`], which interleaves
//! the two sync-ordered inputs into one sync-ordered sequence and forwards
//! the smaller of the two punctuations. Everything downstream of a merge is
//! then ordinary single-stream logic.
//!
//! [`EquiJoin`] pairs every left event with every right event of the same
//! key whose lifetimes overlap. The pair lives over the intersection of the
//! two lifetimes: an Interval when both ends are known, otherwise a
//! Start-edge closed by an End-edge when the first of the two lifetimes
//! ends. A cross join is an equi-join on a constant key.

use crate::error::EngineError;
use crate::operator::BinaryOperator;
use crate::partition::{KeyFn, PartitionKey};
use crate::persistence::{state_from_value, state_to_value, CheckpointError};
use crate::FxIndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;
use tempora_core::{EventKind, Payload, StreamEvent, Timestamp};
use tracing::debug;

// =============================================================================
// Alignment
// =============================================================================

/// The next item of a merged two-input stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Merged<L, R> {
    Left(StreamEvent<L>),
    Right(StreamEvent<R>),
    Punctuation(Timestamp),
}

/// Interleaves two sync-ordered inputs.
///
/// An event is released once the other input holds a later event or has
/// itself reached the event's sync time. Equal sync times release the left
/// event first.
#[derive(Clone, Serialize, Deserialize)]
#[serde(bound = "L: Payload, R: Payload")]
pub struct Merge<L, R> {
    left: VecDeque<StreamEvent<L>>,
    right: VecDeque<StreamEvent<R>>,
    left_time: Timestamp,
    right_time: Timestamp,
    left_punctuation: Timestamp,
    right_punctuation: Timestamp,
    emitted_punctuation: Timestamp,
}

impl<L, R> Default for Merge<L, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L, R> Merge<L, R> {
    pub fn new() -> Self {
        Self {
            left: VecDeque::new(),
            right: VecDeque::new(),
            left_time: Timestamp::MIN,
            right_time: Timestamp::MIN,
            left_punctuation: Timestamp::MIN,
            right_punctuation: Timestamp::MIN,
            emitted_punctuation: Timestamp::MIN,
        }
    }

    pub fn push_left(&mut self, event: StreamEvent<L>) {
        self.left_time = self.left_time.max(event.sync_time);
        if event.is_punctuation() {
            self.left_punctuation = self.left_punctuation.max(event.sync_time);
        } else {
            self.left.push_back(event);
        }
    }

    pub fn push_right(&mut self, event: StreamEvent<R>) {
        self.right_time = self.right_time.max(event.sync_time);
        if event.is_punctuation() {
            self.right_punctuation = self.right_punctuation.max(event.sync_time);
        } else {
            self.right.push_back(event);
        }
    }

    /// Next releasable item, or `None` until more input arrives.
    pub fn pop(&mut self) -> Option<Merged<L, R>> {
        let take_left = match (self.left.front(), self.right.front()) {
            (Some(l), Some(r)) => Some(l.sync_time <= r.sync_time),
            (Some(l), None) => (l.sync_time <= self.right_time).then_some(true),
            (None, Some(r)) => (r.sync_time <= self.left_time).then_some(false),
            (None, None) => None,
        };
        match take_left {
            Some(true) => self.left.pop_front().map(Merged::Left),
            Some(false) => self.right.pop_front().map(Merged::Right),
            None => {
                let frontier = self.left_punctuation.min(self.right_punctuation);
                (frontier > self.emitted_punctuation).then(|| {
                    self.emitted_punctuation = frontier;
                    Merged::Punctuation(frontier)
                })
            }
        }
    }

    /// Number of events waiting for the other input.
    pub fn buffered(&self) -> usize {
        self.left.len() + self.right.len()
    }
}

// =============================================================================
// Equi-join
// =============================================================================

/// A stored event of one join input. `end` is `None` while a Start-edge is
/// open.
#[derive(Clone, Serialize, Deserialize)]
#[serde(bound = "P: Payload")]
struct Entry<P> {
    id: u64,
    start: Timestamp,
    end: Option<Timestamp>,
    payload: P,
}

/// A result emitted as a Start-edge and not yet closed.
#[derive(Clone, Serialize, Deserialize)]
#[serde(bound = "J: Payload")]
struct OpenPair<J> {
    start: Timestamp,
    members: [u64; 2],
    /// End already known from the members, if any.
    due: Option<Timestamp>,
    payload: J,
}

#[derive(Serialize, Deserialize)]
#[serde(bound = "L: Payload, R: Payload, K: PartitionKey, J: Payload")]
struct JoinState<L, R, K, J> {
    merge: Merge<L, R>,
    left: Vec<(K, Vec<Entry<L>>)>,
    right: Vec<(K, Vec<Entry<R>>)>,
    pairs: Vec<OpenPair<J>>,
    next_id: u64,
}

/// Combines a matched left and right payload.
pub type JoinResultFn<L, R, J> = Arc<dyn Fn(&L, &R) -> J + Send + Sync>;

/// Inner join of two streams on equal keys and overlapping lifetimes.
pub struct EquiJoin<L, R, K, J> {
    left_key: KeyFn<L, K>,
    right_key: KeyFn<R, K>,
    result: JoinResultFn<L, R, J>,
    merge: Merge<L, R>,
    left: FxIndexMap<K, Vec<Entry<L>>>,
    right: FxIndexMap<K, Vec<Entry<R>>>,
    pairs: Vec<OpenPair<J>>,
    next_id: u64,
}

impl<L, R, K, J> EquiJoin<L, R, K, J>
where
    L: Payload + PartialEq,
    R: Payload + PartialEq,
    K: PartitionKey,
    J: Payload,
{
    pub fn new(left_key: KeyFn<L, K>, right_key: KeyFn<R, K>, result: JoinResultFn<L, R, J>) -> Self {
        Self {
            left_key,
            right_key,
            result,
            merge: Merge::new(),
            left: FxIndexMap::default(),
            right: FxIndexMap::default(),
            pairs: Vec::new(),
            next_id: 0,
        }
    }

    /// Events of both inputs still stored for matching.
    pub fn stored(&self) -> usize {
        self.left.values().fold(0, |n, v| n + v.len()) + self.right.values().fold(0, |n, v| n + v.len())
    }

    /// Results emitted as Start-edges and not yet closed.
    pub fn open_results(&self) -> usize {
        self.pairs.len()
    }

    fn drain(&mut self, out: &mut Vec<StreamEvent<J>>) {
        while let Some(item) = self.merge.pop() {
            match item {
                Merged::Punctuation(time) => {
                    self.advance(time, out);
                    sweep(&mut self.left, time);
                    sweep(&mut self.right, time);
                    out.push(StreamEvent::punctuation(time));
                }
                Merged::Left(event) => {
                    self.advance(event.sync_time, out);
                    let Some(key) = event.payload().map(|p| (self.left_key)(p)) else {
                        continue;
                    };
                    let result = &self.result;
                    join_one(
                        event,
                        key,
                        &mut self.left,
                        &mut self.right,
                        |l: &L, r: &R| result(l, r),
                        &mut self.pairs,
                        &mut self.next_id,
                        out,
                    );
                }
                Merged::Right(event) => {
                    self.advance(event.sync_time, out);
                    let Some(key) = event.payload().map(|p| (self.right_key)(p)) else {
                        continue;
                    };
                    let result = &self.result;
                    join_one(
                        event,
                        key,
                        &mut self.right,
                        &mut self.left,
                        |r: &R, l: &L| result(l, r),
                        &mut self.pairs,
                        &mut self.next_id,
                        out,
                    );
                }
            }
        }
    }

    /// Closes every open result whose end is known and at or before `time`.
    fn advance(&mut self, time: Timestamp, out: &mut Vec<StreamEvent<J>>) {
        if !self.pairs.iter().any(|p| p.due.is_some_and(|due| due <= time)) {
            return;
        }
        let (mut due, open): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pairs)
            .into_iter()
            .partition(|p| p.due.is_some_and(|due| due <= time));
        self.pairs = open;
        due.sort_by_key(|p| (p.due, p.start));
        for pair in due {
            let end = pair.due.unwrap_or(time);
            out.push(StreamEvent::end(end, pair.start, pair.payload));
        }
    }
}

/// Drops entries that ended at or before `time`, and keys left empty.
fn sweep<K: PartitionKey, P>(entries: &mut FxIndexMap<K, Vec<Entry<P>>>, time: Timestamp) {
    entries.retain(|_, list| {
        list.retain(|e| e.end.map_or(true, |end| end > time));
        !list.is_empty()
    });
}

/// Joins one data event of side `own` against the stored events of `other`.
#[allow(clippy::too_many_arguments)]
fn join_one<S, O, K, J, F>(
    event: StreamEvent<S>,
    key: K,
    own: &mut FxIndexMap<K, Vec<Entry<S>>>,
    other: &mut FxIndexMap<K, Vec<Entry<O>>>,
    combine: F,
    pairs: &mut Vec<OpenPair<J>>,
    next_id: &mut u64,
    out: &mut Vec<StreamEvent<J>>,
) where
    S: Payload + PartialEq,
    K: PartitionKey,
    J: Payload,
    F: Fn(&S, &O) -> J,
{
    let time = event.sync_time;
    let kind = event.kind;
    let end_time = event.end_time();
    let start_time = event.other_time;
    let Some(payload) = event.into_payload() else {
        return;
    };

    if kind == EventKind::End {
        let closed = own.get_mut(&key).and_then(|list| {
            let pos = list
                .iter()
                .position(|e| e.end.is_none() && e.start == start_time && e.payload == payload)?;
            Some(list.remove(pos).id)
        });
        let Some(id) = closed else {
            debug!(start = start_time, end = time, "join end edge has no open start");
            return;
        };
        if own.get(&key).is_some_and(|list| list.is_empty()) {
            own.shift_remove(&key);
        }
        pairs.retain(|pair| {
            if pair.members.contains(&id) {
                out.push(StreamEvent::end(time, pair.start, pair.payload.clone()));
                false
            } else {
                true
            }
        });
        return;
    }

    let end = match kind {
        EventKind::Point | EventKind::Interval => Some(end_time),
        _ => None,
    };
    let id = *next_id;
    *next_id += 1;

    if let Some(partners) = other.get_mut(&key) {
        partners.retain(|p| p.end.map_or(true, |pe| pe > time));
        for partner in partners.iter() {
            let joined = combine(&payload, &partner.payload);
            match (end, partner.end) {
                (Some(own_end), Some(partner_end)) => {
                    out.push(StreamEvent::interval(time, own_end.min(partner_end), joined));
                }
                (own_end, partner_end) => {
                    out.push(StreamEvent::start(time, joined.clone()));
                    pairs.push(OpenPair {
                        start: time,
                        members: [id, partner.id],
                        due: own_end.or(partner_end),
                        payload: joined,
                    });
                }
            }
        }
        if partners.is_empty() {
            other.shift_remove(&key);
        }
    }

    own.entry(key).or_default().push(Entry {
        id,
        start: time,
        end,
        payload,
    });
}

impl<L, R, K, J> BinaryOperator<L, R, J> for EquiJoin<L, R, K, J>
where
    L: Payload + PartialEq,
    R: Payload + PartialEq,
    K: PartitionKey,
    J: Payload,
{
    fn on_left(&mut self, event: StreamEvent<L>, out: &mut Vec<StreamEvent<J>>) -> Result<(), EngineError> {
        self.merge.push_left(event);
        self.drain(out);
        Ok(())
    }

    fn on_right(&mut self, event: StreamEvent<R>, out: &mut Vec<StreamEvent<J>>) -> Result<(), EngineError> {
        self.merge.push_right(event);
        self.drain(out);
        Ok(())
    }

    fn serialize_state(&self) -> Result<Value, CheckpointError> {
        state_to_value(&JoinState {
            merge: self.merge.clone(),
            left: self.left.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            right: self.right.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            pairs: self.pairs.clone(),
            next_id: self.next_id,
        })
    }

    fn deserialize_state(&mut self, state: Value) -> Result<(), CheckpointError> {
        let state: JoinState<L, R, K, J> = state_from_value(state)?;
        self.merge = state.merge;
        self.left = state.left.into_iter().collect();
        self.right = state.right.into_iter().collect();
        self.pairs = state.pairs;
        self.next_id = state.next_id;
        Ok(())
    }
}

// =============================================================================
// Union and multicast
// =============================================================================

/// Both inputs as one stream, in sync-time order.
pub struct Union<P> {
    merge: Merge<P, P>,
}

impl<P> Default for Union<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> Union<P> {
    pub fn new() -> Self {
        Self { merge: Merge::new() }
    }

    fn drain(&mut self, out: &mut Vec<StreamEvent<P>>) {
        while let Some(item) = self.merge.pop() {
            out.push(match item {
                Merged::Left(event) | Merged::Right(event) => event,
                Merged::Punctuation(time) => StreamEvent::punctuation(time),
            });
        }
    }
}

impl<P: Payload> BinaryOperator<P, P, P> for Union<P> {
    fn on_left(&mut self, event: StreamEvent<P>, out: &mut Vec<StreamEvent<P>>) -> Result<(), EngineError> {
        self.merge.push_left(event);
        self.drain(out);
        Ok(())
    }

    fn on_right(&mut self, event: StreamEvent<P>, out: &mut Vec<StreamEvent<P>>) -> Result<(), EngineError> {
        self.merge.push_right(event);
        self.drain(out);
        Ok(())
    }

    fn serialize_state(&self) -> Result<Value, CheckpointError> {
        state_to_value(&self.merge)
    }

    fn deserialize_state(&mut self, state: Value) -> Result<(), CheckpointError> {
        self.merge = state_from_value(state)?;
        Ok(())
    }
}

/// Forwards its single input unchanged to every consumer attached to it.
pub struct Multicast<P>(PhantomData<fn(P) -> P>);

impl<P> Default for Multicast<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> Multicast<P> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<P: Payload> BinaryOperator<P, P, P> for Multicast<P> {
    fn on_left(&mut self, event: StreamEvent<P>, out: &mut Vec<StreamEvent<P>>) -> Result<(), EngineError> {
        out.push(event);
        Ok(())
    }

    fn on_right(&mut self, event: StreamEvent<P>, out: &mut Vec<StreamEvent<P>>) -> Result<(), EngineError> {
        out.push(event);
        Ok(())
    }
}
