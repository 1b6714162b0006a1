//! Input admission: disorder, punctuation and completion policies.
//!
//! Every registered input owns an ingress stage. It validates events,
//! applies the configured [`DisorderPolicy`] to anything behind the low
//! watermark, pairs End-edges with their Start-edges, and hands downstream a
//! stream that is non-decreasing in sync time and interleaved with
//! punctuations.

use crate::error::EngineError;
use crate::partition::{KeyFn, PartitionKey};
use crate::watermark::{EdgeBook, EdgeClose, WatermarkClock};
use crate::FxIndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tempora_core::{EventKind, Payload, StreamEvent, Timestamp, INFINITY};
use tracing::{debug, warn};

// =============================================================================
// Policies
// =============================================================================

/// What happens to an event whose sync time is behind the low watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisorderMode {
    /// Fault the input.
    #[default]
    Throw,
    /// Discard the event.
    Drop,
    /// Move the event's start up to the watermark.
    Adjust,
}

/// Disorder handling for one input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DisorderPolicy {
    pub mode: DisorderMode,
    /// Ticks an event may trail the newest admitted event and still be
    /// reordered instead of treated as late.
    pub reorder_latency: i64,
}

impl DisorderPolicy {
    pub fn throw() -> Self {
        Self {
            mode: DisorderMode::Throw,
            reorder_latency: 0,
        }
    }

    pub fn drop() -> Self {
        Self {
            mode: DisorderMode::Drop,
            reorder_latency: 0,
        }
    }

    pub fn adjust() -> Self {
        Self {
            mode: DisorderMode::Adjust,
            reorder_latency: 0,
        }
    }

    pub fn with_reorder_latency(mut self, latency: i64) -> Self {
        self.reorder_latency = latency.max(0);
        self
    }
}

/// Punctuations generated on behalf of the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PunctuationPolicy {
    /// Only punctuations the caller pushes.
    #[default]
    None,
    /// A punctuation each time the watermark crosses a multiple of `period`.
    Time { period: i64 },
}

/// What completing an input does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnCompletedPolicy {
    /// Release buffered events and punctuate at +infinity.
    #[default]
    EndOfStream,
    /// Release buffered events only.
    Flush,
    /// Leave everything as is.
    None,
}

/// Full ingress configuration of an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IngressPolicy {
    pub disorder: DisorderPolicy,
    pub punctuation: PunctuationPolicy,
    pub on_completed: OnCompletedPolicy,
}

impl IngressPolicy {
    pub fn new(disorder: DisorderPolicy, punctuation: PunctuationPolicy) -> Self {
        Self {
            disorder,
            punctuation,
            on_completed: OnCompletedPolicy::default(),
        }
    }

    pub fn with_on_completed(mut self, on_completed: OnCompletedPolicy) -> Self {
        self.on_completed = on_completed;
        self
    }
}

/// Counters kept per input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressStats {
    pub admitted: u64,
    pub dropped: u64,
    pub adjusted: u64,
    pub punctuations: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngressStatus {
    #[default]
    Open,
    Faulted,
    Completed,
}

// =============================================================================
// Disorder resolution
// =============================================================================

enum Disposition<P> {
    Keep { event: StreamEvent<P>, adjusted: bool },
    Discard,
    Fault,
}

/// Applies the disorder mode to an event. `floor` is the lowest sync time
/// the input may still emit.
fn resolve_disorder<P>(mode: DisorderMode, event: StreamEvent<P>, floor: Timestamp) -> Disposition<P> {
    if event.sync_time >= floor {
        return Disposition::Keep {
            event,
            adjusted: false,
        };
    }
    match mode {
        DisorderMode::Throw => Disposition::Fault,
        DisorderMode::Drop => Disposition::Discard,
        DisorderMode::Adjust => {
            let mut event = event;
            match event.kind {
                EventKind::Interval if event.other_time <= floor => return Disposition::Discard,
                EventKind::Point => event.other_time = floor.saturating_add(1),
                _ => {}
            }
            event.sync_time = floor;
            Disposition::Keep {
                event,
                adjusted: true,
            }
        }
    }
}

/// Outcome of pairing an admitted event against the edge book.
enum EdgeOutcome<P> {
    Pass(StreamEvent<P>),
    Discard,
    Unmatched { start: Timestamp, end: Timestamp },
}

fn pair_edges<P>(book: &mut EdgeBook, original_start: Timestamp, event: StreamEvent<P>) -> EdgeOutcome<P> {
    match event.kind {
        EventKind::Start => {
            book.open_start(original_start, event.sync_time);
            EdgeOutcome::Pass(event)
        }
        EventKind::End => match book.close(event.other_time) {
            EdgeClose::Matched(effective) => {
                let mut event = event;
                event.other_time = effective;
                EdgeOutcome::Pass(event)
            }
            EdgeClose::Discarded => EdgeOutcome::Discard,
            EdgeClose::Unmatched => EdgeOutcome::Unmatched {
                start: event.other_time,
                end: event.sync_time,
            },
        },
        _ => EdgeOutcome::Pass(event),
    }
}

fn floor_to_period(time: Timestamp, period: i64) -> Timestamp {
    time.div_euclid(period) * period
}

// =============================================================================
// Ordered ingress
// =============================================================================

/// Serialized state of an [`Ingress`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "P: Payload")]
pub struct IngressCheckpoint<P> {
    pub clock: WatermarkClock,
    pub buffered: Vec<StreamEvent<P>>,
    pub edges: EdgeBook,
    pub last_generated: Timestamp,
    pub emitted_watermark: Timestamp,
    pub status: IngressStatus,
    pub stats: IngressStats,
}

/// Admission stage of an ordered input.
pub struct Ingress<P> {
    name: String,
    policy: IngressPolicy,
    clock: WatermarkClock,
    reorder: BTreeMap<Timestamp, Vec<StreamEvent<P>>>,
    edges: EdgeBook,
    last_generated: Timestamp,
    emitted_watermark: Timestamp,
    status: IngressStatus,
    stats: IngressStats,
}

impl<P: Payload> Ingress<P> {
    pub fn new(name: impl Into<String>, policy: IngressPolicy) -> Self {
        Self {
            name: name.into(),
            clock: WatermarkClock::new(policy.disorder.reorder_latency),
            policy,
            reorder: BTreeMap::new(),
            edges: EdgeBook::default(),
            last_generated: Timestamp::MIN,
            emitted_watermark: Timestamp::MIN,
            status: IngressStatus::Open,
            stats: IngressStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &IngressPolicy {
        &self.policy
    }

    pub fn stats(&self) -> IngressStats {
        self.stats
    }

    pub fn status(&self) -> IngressStatus {
        self.status
    }

    pub fn low_watermark(&self) -> Timestamp {
        self.clock.low()
    }

    /// Admits one event, appending whatever it releases to `out`.
    pub fn admit(&mut self, event: StreamEvent<P>, out: &mut Vec<StreamEvent<P>>) -> Result<(), EngineError> {
        self.ensure_open()?;
        if let Err(source) = event.validate() {
            return Err(self.fault_malformed(source));
        }

        if event.is_punctuation() {
            let time = event.sync_time;
            if time < self.clock.low() {
                debug!(input = %self.name, time, watermark = self.clock.low(), "dropping stale punctuation");
                return Ok(());
            }
            self.clock.punctuate(time);
            self.release(self.clock.low(), out);
            self.emit_punctuation(time, out);
            return Ok(());
        }

        let original_start = event.sync_time;
        let kind = event.kind;
        let floor = self.clock.low();
        let (event, adjusted) = match resolve_disorder(self.policy.disorder.mode, event, floor) {
            Disposition::Keep { event, adjusted } => (event, adjusted),
            Disposition::Discard => {
                if kind == EventKind::Start {
                    self.edges.discard_start(original_start);
                }
                self.stats.dropped += 1;
                debug!(input = %self.name, sync_time = original_start, watermark = floor, "dropping late event");
                return Ok(());
            }
            Disposition::Fault => {
                self.status = IngressStatus::Faulted;
                warn!(input = %self.name, sync_time = original_start, watermark = floor, "out-of-order event faulted input");
                return Err(EngineError::OutOfOrder {
                    input: self.name.clone(),
                    sync_time: original_start,
                    watermark: floor,
                });
            }
        };

        let event = match pair_edges(&mut self.edges, original_start, event) {
            EdgeOutcome::Pass(event) => event,
            EdgeOutcome::Discard => {
                self.stats.dropped += 1;
                return Ok(());
            }
            EdgeOutcome::Unmatched { start, end } => {
                return Err(self.fault_malformed(tempora_core::EventError::UnmatchedEndEdge { start, end }));
            }
        };

        if adjusted {
            self.stats.adjusted += 1;
            debug!(input = %self.name, from = original_start, to = event.sync_time, "adjusted late event");
        }
        self.stats.admitted += 1;
        self.clock.observe(event.sync_time);
        self.reorder.entry(event.sync_time).or_default().push(event);
        self.release(self.clock.low(), out);
        self.generate_punctuation(out);
        Ok(())
    }

    /// Applies the completion policy. The input accepts nothing afterwards.
    pub fn complete(&mut self, out: &mut Vec<StreamEvent<P>>) -> Result<(), EngineError> {
        self.ensure_open()?;
        match self.policy.on_completed {
            OnCompletedPolicy::EndOfStream => {
                self.release(INFINITY, out);
                self.clock.punctuate(INFINITY);
                self.emit_punctuation(INFINITY, out);
            }
            OnCompletedPolicy::Flush => self.release(INFINITY, out),
            OnCompletedPolicy::None => {}
        }
        self.status = IngressStatus::Completed;
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        match self.status {
            IngressStatus::Open => Ok(()),
            IngressStatus::Faulted => Err(EngineError::StreamFaulted {
                input: self.name.clone(),
            }),
            IngressStatus::Completed => Err(EngineError::InputCompleted {
                input: self.name.clone(),
            }),
        }
    }

    fn fault_malformed(&mut self, source: tempora_core::EventError) -> EngineError {
        self.status = IngressStatus::Faulted;
        warn!(input = %self.name, error = %source, "malformed event faulted input");
        EngineError::Malformed {
            input: self.name.clone(),
            source,
        }
    }

    fn release(&mut self, bound: Timestamp, out: &mut Vec<StreamEvent<P>>) {
        while let Some(entry) = self.reorder.first_entry() {
            if *entry.key() > bound {
                break;
            }
            out.extend(entry.remove());
        }
    }

    fn emit_punctuation(&mut self, time: Timestamp, out: &mut Vec<StreamEvent<P>>) {
        if time > self.emitted_watermark {
            self.emitted_watermark = time;
            self.stats.punctuations += 1;
            out.push(StreamEvent::punctuation(time));
        }
    }

    fn generate_punctuation(&mut self, out: &mut Vec<StreamEvent<P>>) {
        let PunctuationPolicy::Time { period } = self.policy.punctuation else {
            return;
        };
        if period <= 0 || self.clock.low() == Timestamp::MIN {
            return;
        }
        let candidate = floor_to_period(self.clock.low(), period);
        if candidate > self.last_generated {
            self.last_generated = candidate;
            self.emit_punctuation(candidate, out);
        }
    }

    pub fn checkpoint(&self) -> IngressCheckpoint<P> {
        IngressCheckpoint {
            clock: self.clock.clone(),
            buffered: self.reorder.values().flatten().cloned().collect(),
            edges: self.edges.clone(),
            last_generated: self.last_generated,
            emitted_watermark: self.emitted_watermark,
            status: self.status,
            stats: self.stats,
        }
    }

    pub fn restore(&mut self, cp: IngressCheckpoint<P>) {
        self.clock = cp.clock;
        self.reorder.clear();
        for event in cp.buffered {
            self.reorder.entry(event.sync_time).or_default().push(event);
        }
        self.edges = cp.edges;
        self.last_generated = cp.last_generated;
        self.emitted_watermark = cp.emitted_watermark;
        self.status = cp.status;
        self.stats = cp.stats;
    }
}

// =============================================================================
// Partitioned ingress
// =============================================================================

/// Per-key ordering state of a partitioned input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyClock {
    pub last_sync: Timestamp,
    pub edges: EdgeBook,
}

impl Default for KeyClock {
    fn default() -> Self {
        Self {
            last_sync: Timestamp::MIN,
            edges: EdgeBook::default(),
        }
    }
}

/// Serialized state of a [`PartitionedIngress`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "K: PartitionKey")]
pub struct PartitionedIngressCheckpoint<K> {
    pub keys: Vec<(K, KeyClock)>,
    pub high: Timestamp,
    pub low: Timestamp,
    pub status: IngressStatus,
    pub stats: IngressStats,
}

/// Admission stage of an input whose order is only guaranteed per key.
///
/// Each key must be ordered relative to itself; across keys, events may
/// trail the newest event by up to `punctuation_lag`. The low watermark
/// emitted downstream is `max_sync_seen - punctuation_lag`.
pub struct PartitionedIngress<P, K> {
    name: String,
    key_fn: KeyFn<P, K>,
    mode: DisorderMode,
    on_completed: OnCompletedPolicy,
    lag: i64,
    keys: FxIndexMap<K, KeyClock>,
    high: Timestamp,
    low: Timestamp,
    status: IngressStatus,
    stats: IngressStats,
}

impl<P: Payload, K: PartitionKey> PartitionedIngress<P, K> {
    pub fn new(name: impl Into<String>, key_fn: KeyFn<P, K>, disorder: DisorderPolicy, punctuation_lag: i64) -> Self {
        Self {
            name: name.into(),
            key_fn,
            mode: disorder.mode,
            on_completed: OnCompletedPolicy::EndOfStream,
            lag: punctuation_lag.max(0),
            keys: FxIndexMap::default(),
            high: Timestamp::MIN,
            low: Timestamp::MIN,
            status: IngressStatus::Open,
            stats: IngressStats::default(),
        }
    }

    pub fn with_on_completed(mut self, on_completed: OnCompletedPolicy) -> Self {
        self.on_completed = on_completed;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> IngressStats {
        self.stats
    }

    pub fn low_watermark(&self) -> Timestamp {
        self.low
    }

    /// Number of keys whose ordering state is still tracked.
    pub fn tracked_keys(&self) -> usize {
        self.keys.len()
    }

    pub fn admit(&mut self, event: StreamEvent<P>, out: &mut Vec<StreamEvent<P>>) -> Result<(), EngineError> {
        match self.status {
            IngressStatus::Open => {}
            IngressStatus::Faulted => {
                return Err(EngineError::StreamFaulted {
                    input: self.name.clone(),
                })
            }
            IngressStatus::Completed => {
                return Err(EngineError::InputCompleted {
                    input: self.name.clone(),
                })
            }
        }
        if let Err(source) = event.validate() {
            return Err(self.fault_malformed(source));
        }

        if event.is_punctuation() {
            if event.sync_time < self.low {
                debug!(input = %self.name, time = event.sync_time, watermark = self.low, "dropping stale punctuation");
            } else {
                self.high = self.high.max(event.sync_time);
                self.advance_low(event.sync_time, out);
            }
            return Ok(());
        }

        let Some(payload) = event.payload() else {
            return Ok(());
        };
        let key = (self.key_fn)(payload);
        let clock = self.keys.entry(key).or_default();
        let floor = self.low.max(clock.last_sync);
        let original_start = event.sync_time;
        let kind = event.kind;

        let (event, adjusted) = match resolve_disorder(self.mode, event, floor) {
            Disposition::Keep { event, adjusted } => (event, adjusted),
            Disposition::Discard => {
                if kind == EventKind::Start {
                    clock.edges.discard_start(original_start);
                }
                self.stats.dropped += 1;
                debug!(input = %self.name, sync_time = original_start, floor, "dropping late keyed event");
                return Ok(());
            }
            Disposition::Fault => {
                self.status = IngressStatus::Faulted;
                warn!(input = %self.name, sync_time = original_start, floor, "out-of-order keyed event faulted input");
                return Err(EngineError::OutOfOrder {
                    input: self.name.clone(),
                    sync_time: original_start,
                    watermark: floor,
                });
            }
        };

        let event = match pair_edges(&mut clock.edges, original_start, event) {
            EdgeOutcome::Pass(event) => event,
            EdgeOutcome::Discard => {
                self.stats.dropped += 1;
                debug!(input = %self.name, sync_time = original_start, "dropping end of discarded keyed start");
                return Ok(());
            }
            EdgeOutcome::Unmatched { start, end } => {
                return Err(self.fault_malformed(tempora_core::EventError::UnmatchedEndEdge { start, end }));
            }
        };

        clock.last_sync = clock.last_sync.max(event.sync_time);
        if adjusted {
            self.stats.adjusted += 1;
            debug!(input = %self.name, from = original_start, to = event.sync_time, "adjusted late keyed event");
        }
        self.stats.admitted += 1;
        self.high = self.high.max(event.sync_time);
        out.push(event);

        let candidate = self.high.saturating_sub(self.lag);
        self.advance_low(candidate, out);
        Ok(())
    }

    pub fn complete(&mut self, out: &mut Vec<StreamEvent<P>>) -> Result<(), EngineError> {
        if self.status != IngressStatus::Open {
            return Err(EngineError::InputCompleted {
                input: self.name.clone(),
            });
        }
        if self.on_completed == OnCompletedPolicy::EndOfStream {
            self.advance_low(INFINITY, out);
        }
        self.status = IngressStatus::Completed;
        Ok(())
    }

    fn fault_malformed(&mut self, source: tempora_core::EventError) -> EngineError {
        self.status = IngressStatus::Faulted;
        warn!(input = %self.name, error = %source, "malformed keyed event faulted input");
        EngineError::Malformed {
            input: self.name.clone(),
            source,
        }
    }

    fn advance_low(&mut self, candidate: Timestamp, out: &mut Vec<StreamEvent<P>>) {
        if candidate <= self.low {
            return;
        }
        self.low = candidate;
        self.stats.punctuations += 1;
        out.push(StreamEvent::punctuation(candidate));
        let low = self.low;
        self.keys
            .retain(|_, clock| clock.last_sync >= low || !clock.edges.is_empty());
    }

    pub fn checkpoint(&self) -> PartitionedIngressCheckpoint<K> {
        PartitionedIngressCheckpoint {
            keys: self
                .keys
                .iter()
                .map(|(k, c)| (k.clone(), c.clone()))
                .collect(),
            high: self.high,
            low: self.low,
            status: self.status,
            stats: self.stats,
        }
    }

    pub fn restore(&mut self, cp: PartitionedIngressCheckpoint<K>) {
        self.keys = cp.keys.into_iter().collect();
        self.high = cp.high;
        self.low = cp.low;
        self.status = cp.status;
        self.stats = cp.stats;
    }
}
