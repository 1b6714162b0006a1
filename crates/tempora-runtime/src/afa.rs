//! Augmented finite automata: NFAs whose arcs carry predicates and a
//! register transfer.
//!
//! Build an [`Afa`] directly with arcs, or through the regex front-end in
//! [`crate::pattern`]. [`Afa::compile`] turns it into an immutable
//! [`CompiledAfa`] that any number of [`AfaMatcher`]s (one per partition,
//! say) can share.
//!
//! Matching is contiguous: every event must be consumed by an arc, so an
//! instance with no satisfied arc dies. Timing constraints are plain
//! predicate logic over a register that carries a timestamp;
//! [`Afa::with_max_duration`] is a shorthand that retires instances older
//! than a bound.
//!
//! A match takes the lifetime of the event that completed it when that
//! event is an Interval, and is a point otherwise.
//!
//! # Example
//!
//! ```rust
//! use tempora_runtime::afa::Afa;
//!
//! // Rising pair: two consecutive readings where the second is larger.
//! let afa = Afa::<i64, i64>::new(0)
//!     .add_arc(0, 1, |_, _, _| true, |_, v, _| *v)
//!     .add_arc(1, 2, |_, v, first| v > first, |_, v, first| v - first)
//!     .compile()
//!     .unwrap();
//! assert_eq!(afa.state_count(), 3);
//! ```

use crate::error::EngineError;
use crate::operator::Operator;
use crate::persistence::{state_from_value, state_to_value, CheckpointError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tempora_core::{EventKind, Payload, StreamEvent, Timestamp};
use thiserror::Error;
use tracing::warn;

pub type StateId = usize;

/// Arc guard over `(time, event, register)`.
pub type Predicate<T, R> = Arc<dyn Fn(Timestamp, &T, &R) -> bool + Send + Sync>;

/// Register update over `(time, event, register)`.
pub type Transfer<T, R> = Arc<dyn Fn(Timestamp, &T, &R) -> R + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AfaError {
    #[error("automaton has no arcs")]
    Empty,

    #[error("no accepting state is reachable from the start state")]
    NoAcceptingPath,
}

/// Eager pruning applied after every step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PruningPolicy {
    /// Keep every instance.
    #[default]
    None,
    /// Of instances in the same state with equal registers, keep only the
    /// newest. Their futures are identical, so the older ones can only
    /// produce duplicate matches with earlier start times.
    SubsumeOlder,
}

// ============================================================================
// AUTOMATON BUILDER
// ============================================================================

enum ArcLabel<T, R> {
    Event {
        predicate: Predicate<T, R>,
        transfer: Option<Transfer<T, R>>,
    },
    Epsilon,
}

struct ArcSpec<T, R> {
    from: StateId,
    to: StateId,
    label: ArcLabel<T, R>,
}

/// An automaton under construction. State 0 is the start state.
pub struct Afa<T, R> {
    default_register: R,
    arcs: Vec<ArcSpec<T, R>>,
    finals: BTreeSet<StateId>,
    allow_overlap: bool,
    max_duration: Option<i64>,
    pruning: PruningPolicy,
    register_eq: Option<fn(&R, &R) -> bool>,
    max_live_instances: Option<usize>,
}

impl<T, R> Afa<T, R> {
    pub fn new(default_register: R) -> Self {
        Self {
            default_register,
            arcs: Vec::new(),
            finals: BTreeSet::new(),
            allow_overlap: true,
            max_duration: None,
            pruning: PruningPolicy::None,
            register_eq: None,
            max_live_instances: None,
        }
    }

    /// Adds an arc that fires when `predicate` holds and updates the
    /// register with `transfer`.
    pub fn add_arc<P, F>(mut self, from: StateId, to: StateId, predicate: P, transfer: F) -> Self
    where
        P: Fn(Timestamp, &T, &R) -> bool + Send + Sync + 'static,
        F: Fn(Timestamp, &T, &R) -> R + Send + Sync + 'static,
    {
        self.arcs.push(ArcSpec {
            from,
            to,
            label: ArcLabel::Event {
                predicate: Arc::new(predicate),
                transfer: Some(Arc::new(transfer)),
            },
        });
        self
    }

    /// Adds an arc that leaves the register unchanged.
    pub fn add_filter_arc<P>(mut self, from: StateId, to: StateId, predicate: P) -> Self
    where
        P: Fn(Timestamp, &T, &R) -> bool + Send + Sync + 'static,
    {
        self.arcs.push(ArcSpec {
            from,
            to,
            label: ArcLabel::Event {
                predicate: Arc::new(predicate),
                transfer: None,
            },
        });
        self
    }

    pub(crate) fn push_event_arc(
        &mut self,
        from: StateId,
        to: StateId,
        predicate: Predicate<T, R>,
        transfer: Option<Transfer<T, R>>,
    ) {
        self.arcs.push(ArcSpec {
            from,
            to,
            label: ArcLabel::Event { predicate, transfer },
        });
    }

    pub(crate) fn push_epsilon_arc(&mut self, from: StateId, to: StateId) {
        self.arcs.push(ArcSpec {
            from,
            to,
            label: ArcLabel::Epsilon,
        });
    }

    /// Adds an arc that consumes no event.
    pub fn add_epsilon_arc(mut self, from: StateId, to: StateId) -> Self {
        self.push_epsilon_arc(from, to);
        self
    }

    pub fn add_final_state(mut self, state: StateId) -> Self {
        self.finals.insert(state);
        self
    }

    /// Whether a new instance may start while another is in flight, and
    /// whether an instance keeps running after it accepts. Default: true.
    pub fn with_overlapping_instances(mut self, allow: bool) -> Self {
        self.allow_overlap = allow;
        self
    }

    /// Retires instances whose first event is `ticks` or more in the past.
    pub fn with_max_duration(mut self, ticks: i64) -> Self {
        self.max_duration = Some(ticks);
        self
    }

    /// Evicts the oldest instance once more than `max` are live.
    pub fn with_max_live_instances(mut self, max: usize) -> Self {
        self.max_live_instances = Some(max.max(1));
        self
    }

    fn state_count(&self) -> usize {
        self.arcs
            .iter()
            .map(|a| a.from.max(a.to) + 1)
            .chain(self.finals.iter().map(|f| f + 1))
            .max()
            .unwrap_or(1)
    }

    /// Removes epsilon arcs and arcs into states that cannot reach an
    /// accepting state.
    pub fn compile(self) -> Result<Arc<CompiledAfa<T, R>>, AfaError> {
        if self.arcs.is_empty() {
            return Err(AfaError::Empty);
        }
        let n = self.state_count();

        let mut finals = self.finals.clone();
        if finals.is_empty() {
            let mut has_outgoing = vec![false; n];
            for arc in &self.arcs {
                has_outgoing[arc.from] = true;
            }
            finals = self
                .arcs
                .iter()
                .map(|a| a.to)
                .filter(|s| !has_outgoing[*s])
                .collect();
        }

        let mut epsilon = vec![Vec::new(); n];
        for arc in &self.arcs {
            if let ArcLabel::Epsilon = arc.label {
                epsilon[arc.from].push(arc.to);
            }
        }
        let closures: Vec<Vec<StateId>> = (0..n).map(|s| epsilon_closure(&epsilon, s)).collect();

        let accepting: Vec<bool> = closures
            .iter()
            .map(|c| c.iter().any(|s| finals.contains(s)))
            .collect();

        let mut outgoing: Vec<Vec<CompiledArc<T, R>>> = (0..n).map(|_| Vec::new()).collect();
        for (state, closure) in closures.iter().enumerate() {
            for &member in closure {
                for arc in self.arcs.iter().filter(|a| a.from == member) {
                    if let ArcLabel::Event { predicate, transfer } = &arc.label {
                        outgoing[state].push(CompiledArc {
                            to: arc.to,
                            predicate: Arc::clone(predicate),
                            transfer: transfer.clone(),
                        });
                    }
                }
            }
        }

        // Co-reachability: a state is useful if it accepts or can reach one
        // that does.
        let mut useful = accepting.clone();
        loop {
            let mut changed = false;
            for s in 0..n {
                if !useful[s] && outgoing[s].iter().any(|a| useful[a.to]) {
                    useful[s] = true;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        if !useful[0] {
            return Err(AfaError::NoAcceptingPath);
        }
        for arcs in &mut outgoing {
            arcs.retain(|a| useful[a.to]);
        }

        Ok(Arc::new(CompiledAfa {
            default_register: self.default_register,
            outgoing,
            accepting,
            allow_overlap: self.allow_overlap,
            max_duration: self.max_duration,
            register_eq: match self.pruning {
                PruningPolicy::None => None,
                PruningPolicy::SubsumeOlder => self.register_eq,
            },
            max_live_instances: self.max_live_instances,
        }))
    }
}

impl<T, R: PartialEq> Afa<T, R> {
    pub fn with_pruning(mut self, policy: PruningPolicy) -> Self {
        self.pruning = policy;
        self.register_eq = Some(<R as PartialEq>::eq);
        self
    }
}

fn epsilon_closure(epsilon: &[Vec<StateId>], state: StateId) -> Vec<StateId> {
    let mut seen = BTreeSet::from([state]);
    let mut stack = vec![state];
    while let Some(s) = stack.pop() {
        for &next in &epsilon[s] {
            if seen.insert(next) {
                stack.push(next);
            }
        }
    }
    seen.into_iter().collect()
}

struct CompiledArc<T, R> {
    to: StateId,
    predicate: Predicate<T, R>,
    transfer: Option<Transfer<T, R>>,
}

/// An epsilon-free, pruned automaton.
pub struct CompiledAfa<T, R> {
    default_register: R,
    outgoing: Vec<Vec<CompiledArc<T, R>>>,
    accepting: Vec<bool>,
    allow_overlap: bool,
    max_duration: Option<i64>,
    register_eq: Option<fn(&R, &R) -> bool>,
    max_live_instances: Option<usize>,
}

impl<T, R> CompiledAfa<T, R> {
    pub fn state_count(&self) -> usize {
        self.outgoing.len()
    }

    pub fn is_accepting(&self, state: StateId) -> bool {
        self.accepting.get(state).copied().unwrap_or(false)
    }

    pub fn arc_count(&self) -> usize {
        self.outgoing.iter().map(Vec::len).sum()
    }
}

// ============================================================================
// MATCHER
// ============================================================================

/// A completed match with the events that contributed to it, in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "T: Payload, R: Payload")]
pub struct PatternMatch<T, R> {
    pub start_time: Timestamp,
    pub register: R,
    pub events: Vec<T>,
}

/// Events consumed so far by one instance, newest first.
struct Provenance<T> {
    event: T,
    prev: Option<Arc<Provenance<T>>>,
}

fn collect_events<T: Clone>(mut node: Option<&Arc<Provenance<T>>>) -> Vec<T> {
    let mut events = Vec::new();
    while let Some(p) = node {
        events.push(p.event.clone());
        node = p.prev.as_ref();
    }
    events.reverse();
    events
}

struct Instance<T, R> {
    state: StateId,
    register: R,
    start_time: Timestamp,
    provenance: Option<Arc<Provenance<T>>>,
}

#[derive(Serialize, Deserialize)]
#[serde(bound = "T: Payload, R: Payload")]
struct SavedInstance<T, R> {
    state: StateId,
    register: R,
    start_time: Timestamp,
    events: Option<Vec<T>>,
}

/// Builds the matcher's output from `(start_time, register, events)`.
pub type MatchBuilder<T, R, O> = fn(Timestamp, R, Vec<T>) -> O;

/// Runs a [`CompiledAfa`] over a stream.
///
/// Instances live in an arena indexed by slot, with a free list, so retiring
/// an instance is O(1). `active` holds live slots from oldest to newest.
pub struct AfaMatcher<T, R, O> {
    afa: Arc<CompiledAfa<T, R>>,
    build: MatchBuilder<T, R, O>,
    track_events: bool,
    arena: Vec<Option<Instance<T, R>>>,
    free: Vec<usize>,
    active: Vec<usize>,
    evicted: u64,
}

impl<T: Payload, R: Payload> AfaMatcher<T, R, R> {
    /// Emits the register of every match.
    pub fn registers(afa: Arc<CompiledAfa<T, R>>) -> Self {
        Self::new(afa, |_, register, _| register, false)
    }
}

impl<T: Payload, R: Payload> AfaMatcher<T, R, PatternMatch<T, R>> {
    /// Emits every match with the events that formed it.
    pub fn with_events(afa: Arc<CompiledAfa<T, R>>) -> Self {
        Self::new(
            afa,
            |start_time, register, events| PatternMatch {
                start_time,
                register,
                events,
            },
            true,
        )
    }
}

impl<T: Payload, R: Payload, O> AfaMatcher<T, R, O> {
    fn new(afa: Arc<CompiledAfa<T, R>>, build: MatchBuilder<T, R, O>, track_events: bool) -> Self {
        Self {
            afa,
            build,
            track_events,
            arena: Vec::new(),
            free: Vec::new(),
            active: Vec::new(),
            evicted: 0,
        }
    }

    pub fn live_instances(&self) -> usize {
        self.active.len()
    }

    /// Instances evicted by the live-instance bound so far.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    fn allocate(&mut self, instance: Instance<T, R>) -> usize {
        match self.free.pop() {
            Some(slot) => {
                self.arena[slot] = Some(instance);
                slot
            }
            None => {
                self.arena.push(Some(instance));
                self.arena.len() - 1
            }
        }
    }

    fn release(&mut self, slot: usize) -> Option<Instance<T, R>> {
        let instance = self.arena.get_mut(slot).and_then(Option::take);
        if instance.is_some() {
            self.free.push(slot);
        }
        instance
    }

    fn clear(&mut self) {
        for slot in std::mem::take(&mut self.active) {
            self.release(slot);
        }
    }

    fn expire(&mut self, time: Timestamp) {
        let Some(max) = self.afa.max_duration else {
            return;
        };
        let active = std::mem::take(&mut self.active);
        for slot in active {
            let expired = self.arena[slot]
                .as_ref()
                .is_some_and(|i| time.saturating_sub(i.start_time) >= max);
            if expired {
                self.release(slot);
            } else {
                self.active.push(slot);
            }
        }
    }

    /// Every successor of `from` on `event`.
    fn successors(&self, from: &Instance<T, R>, time: Timestamp, event: &T, next: &mut Vec<Instance<T, R>>) {
        for arc in &self.afa.outgoing[from.state] {
            if !(arc.predicate)(time, event, &from.register) {
                continue;
            }
            let register = match &arc.transfer {
                Some(transfer) => transfer(time, event, &from.register),
                None => from.register.clone(),
            };
            let provenance = self.track_events.then(|| {
                Arc::new(Provenance {
                    event: event.clone(),
                    prev: from.provenance.clone(),
                })
            });
            next.push(Instance {
                state: arc.to,
                register,
                start_time: from.start_time,
                provenance,
            });
        }
    }

    fn prune(&self, next: Vec<Instance<T, R>>) -> Vec<Instance<T, R>> {
        let Some(eq) = self.afa.register_eq else {
            return next;
        };
        let mut kept: Vec<Instance<T, R>> = Vec::with_capacity(next.len());
        for candidate in next.into_iter().rev() {
            let subsumed = kept
                .iter()
                .any(|k| k.state == candidate.state && eq(&k.register, &candidate.register));
            if !subsumed {
                kept.push(candidate);
            }
        }
        kept.reverse();
        kept
    }

    fn step(&mut self, time: Timestamp, end: Timestamp, kind: EventKind, event: &T, out: &mut Vec<StreamEvent<O>>)
    where
        O: Payload,
    {
        self.expire(time);

        let mut next = Vec::new();
        for slot in std::mem::take(&mut self.active) {
            if let Some(instance) = self.release(slot) {
                self.successors(&instance, time, event, &mut next);
            }
        }
        if self.afa.allow_overlap || next.is_empty() {
            let seed = Instance {
                state: 0,
                register: self.afa.default_register.clone(),
                start_time: time,
                provenance: None,
            };
            self.successors(&seed, time, event, &mut next);
        }
        let next = self.prune(next);

        let mut accepted = false;
        for instance in next {
            if self.afa.accepting[instance.state] {
                accepted = true;
                let events = if self.track_events {
                    collect_events(instance.provenance.as_ref())
                } else {
                    Vec::new()
                };
                let payload = (self.build)(instance.start_time, instance.register.clone(), events);
                // An edge's end is not known yet and End-edges are not
                // matched, so a match on a Start-edge is reported as a point.
                out.push(match kind {
                    EventKind::Interval => StreamEvent::interval(time, end, payload),
                    _ => StreamEvent::point(time, payload),
                });
                if !self.afa.allow_overlap {
                    continue;
                }
            }
            if !self.afa.outgoing[instance.state].is_empty() {
                let slot = self.allocate(instance);
                self.active.push(slot);
            }
        }
        if accepted && !self.afa.allow_overlap {
            self.clear();
        }

        if let Some(max) = self.afa.max_live_instances {
            while self.active.len() > max {
                let oldest = self.active.remove(0);
                self.release(oldest);
                self.evicted += 1;
                warn!(max, evicted = self.evicted, "pattern instance limit reached, evicting oldest");
            }
        }
    }
}

impl<T, R, O> Operator<T, O> for AfaMatcher<T, R, O>
where
    T: Payload,
    R: Payload,
    O: Payload,
{
    fn on_event(&mut self, event: StreamEvent<T>, out: &mut Vec<StreamEvent<O>>) -> Result<(), EngineError> {
        let time = event.sync_time;
        match event.kind {
            EventKind::Punctuation => {
                self.expire(time);
                out.push(StreamEvent::punctuation(time));
            }
            EventKind::End => {}
            kind => {
                let end = event.end_time();
                if let Some(payload) = event.payload() {
                    self.step(time, end, kind, payload, out);
                }
            }
        }
        Ok(())
    }

    fn is_idle(&self) -> bool {
        self.active.is_empty()
    }

    fn serialize_state(&self) -> Result<Value, CheckpointError> {
        let saved: Vec<SavedInstance<T, R>> = self
            .active
            .iter()
            .filter_map(|slot| self.arena[*slot].as_ref())
            .map(|i| SavedInstance {
                state: i.state,
                register: i.register.clone(),
                start_time: i.start_time,
                events: self.track_events.then(|| collect_events(i.provenance.as_ref())),
            })
            .collect();
        state_to_value(&(saved, self.evicted))
    }

    fn deserialize_state(&mut self, state: Value) -> Result<(), CheckpointError> {
        let (saved, evicted): (Vec<SavedInstance<T, R>>, u64) = state_from_value(state)?;
        self.arena.clear();
        self.free.clear();
        self.active.clear();
        for s in saved {
            if s.state >= self.afa.state_count() {
                return Err(CheckpointError::ShapeMismatch(format!(
                    "pattern state {} does not exist",
                    s.state
                )));
            }
            let provenance = s.events.unwrap_or_default().into_iter().fold(None, |prev, event| {
                Some(Arc::new(Provenance { event, prev }))
            });
            let slot = self.allocate(Instance {
                state: s.state,
                register: s.register,
                start_time: s.start_time,
                provenance,
            });
            self.active.push(slot);
        }
        self.evicted = evicted;
        Ok(())
    }
}
