//! Grouping: one independent copy of a sub-query per key.
//!
//! [`GroupApply`] routes every data event to the partition of its key,
//! creating the partition (a fresh pipeline from the factory) on the first
//! event for that key. Time reaches every partition through punctuations,
//! so a quiet key still closes its windows while other keys advance.
//!
//! Partition outputs are merged through an ordered buffer. An event is
//! released once every live partition has promised, through its forwarded
//! punctuation, not to emit anything earlier.
//!
//! A partition is reclaimed when its watermark has passed the end of the
//! last event it received, no Start-edge it received is still open, and its
//! pipeline reports idle.

use crate::error::EngineError;
use crate::operator::{BoxedOperator, Operator};
use crate::persistence::{state_from_value, state_to_value, CheckpointError};
use crate::FxIndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::hash::Hash;
use std::sync::Arc;
use tempora_core::{EventKind, Payload, StreamEvent, Timestamp, INFINITY};
use tracing::debug;

/// Bound on grouping keys.
pub trait PartitionKey: Clone + Eq + Hash + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> PartitionKey for T where T: Clone + Eq + Hash + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Extracts the grouping key of a payload.
pub type KeyFn<P, K> = Arc<dyn Fn(&P) -> K + Send + Sync>;

/// Builds a fresh per-key pipeline.
pub type PipelineFactory<I, O> = Arc<dyn Fn() -> BoxedOperator<I, O> + Send + Sync>;

/// Combines a key with a per-key result.
pub type ResultFn<K, O, R> = Arc<dyn Fn(&K, O) -> R + Send + Sync>;

/// How time reaches the partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeSource {
    /// Input is globally ordered. Each advance of the data time `t` is
    /// broadcast as punctuation `t - lag`.
    Ordered { lag: i64 },
    /// Input is ordered per key only; upstream punctuations are the sole
    /// clock.
    Punctuated,
}

struct Partition<I, O> {
    pipeline: BoxedOperator<I, O>,
    watermark: Timestamp,
    last_end: Timestamp,
    open_edges: u64,
    /// Last punctuation the pipeline forwarded.
    emitted: Timestamp,
}

impl<I: Payload, O: Payload> Partition<I, O> {
    fn new(pipeline: BoxedOperator<I, O>) -> Self {
        Self {
            pipeline,
            watermark: Timestamp::MIN,
            last_end: Timestamp::MIN,
            open_edges: 0,
            emitted: Timestamp::MIN,
        }
    }

    fn feed(&mut self, event: StreamEvent<I>, scratch: &mut Vec<StreamEvent<O>>) -> Result<(), EngineError> {
        match event.kind {
            EventKind::Punctuation => {
                if event.sync_time <= self.watermark {
                    return Ok(());
                }
                self.watermark = event.sync_time;
            }
            EventKind::Start => self.open_edges += 1,
            EventKind::End => {
                self.open_edges = self.open_edges.saturating_sub(1);
                self.last_end = self.last_end.max(event.sync_time);
            }
            EventKind::Interval | EventKind::Point => {
                self.last_end = self.last_end.max(event.end_time());
            }
        }
        let start = scratch.len();
        self.pipeline.on_event(event, scratch)?;
        for e in &scratch[start..] {
            if e.is_punctuation() {
                self.emitted = self.emitted.max(e.sync_time);
            }
        }
        Ok(())
    }

    fn reclaimable(&self) -> bool {
        self.watermark > self.last_end && self.open_edges == 0 && self.pipeline.is_idle()
    }
}

#[derive(Serialize, Deserialize)]
struct PartitionState {
    pipeline: Value,
    watermark: Timestamp,
    last_end: Timestamp,
    open_edges: u64,
    emitted: Timestamp,
}

#[derive(Serialize, Deserialize)]
#[serde(bound = "K: PartitionKey, R: Payload")]
struct GroupState<K, R> {
    partitions: Vec<(K, PartitionState)>,
    buffered: Vec<StreamEvent<R>>,
    broadcast: Timestamp,
    forwarded: Timestamp,
}

/// Runs a pipeline per key and merges the re-tagged results.
pub struct GroupApply<I, K, O, R> {
    key_fn: KeyFn<I, K>,
    factory: PipelineFactory<I, O>,
    result_fn: ResultFn<K, O, R>,
    time: TimeSource,
    partitions: FxIndexMap<K, Partition<I, O>>,
    /// Latest punctuation delivered to every partition.
    broadcast: Timestamp,
    buffer: BTreeMap<Timestamp, Vec<StreamEvent<R>>>,
    forwarded: Timestamp,
    scratch: Vec<StreamEvent<O>>,
}

impl<I, K, O, R> GroupApply<I, K, O, R>
where
    I: Payload,
    K: PartitionKey,
    O: Payload,
    R: Payload,
{
    pub fn new(
        key_fn: KeyFn<I, K>,
        factory: PipelineFactory<I, O>,
        result_fn: ResultFn<K, O, R>,
        time: TimeSource,
    ) -> Self {
        Self {
            key_fn,
            factory,
            result_fn,
            time,
            partitions: FxIndexMap::default(),
            broadcast: Timestamp::MIN,
            buffer: BTreeMap::new(),
            forwarded: Timestamp::MIN,
            scratch: Vec::new(),
        }
    }

    /// Number of partitions currently holding state.
    pub fn live_partitions(&self) -> usize {
        self.partitions.len()
    }

    fn collect(&mut self, key: &K) {
        for e in self.scratch.drain(..) {
            if e.is_punctuation() {
                continue;
            }
            let tagged = StreamEvent {
                kind: e.kind,
                sync_time: e.sync_time,
                other_time: e.other_time,
                payload: e.payload.map(|o| (self.result_fn)(key, o)),
            };
            self.buffer.entry(tagged.sync_time).or_default().push(tagged);
        }
    }

    fn broadcast_to_all(&mut self, time: Timestamp) -> Result<(), EngineError> {
        if time <= self.broadcast {
            return Ok(());
        }
        self.broadcast = time;
        let keys: Vec<K> = self.partitions.keys().cloned().collect();
        for key in keys {
            if let Some(partition) = self.partitions.get_mut(&key) {
                partition.feed(StreamEvent::punctuation(time), &mut self.scratch)?;
            }
            self.collect(&key);
        }
        Ok(())
    }

    fn route(&mut self, event: StreamEvent<I>) -> Result<(), EngineError> {
        let Some(payload) = event.payload() else {
            return Ok(());
        };
        let key = (self.key_fn)(payload);
        if !self.partitions.contains_key(&key) {
            let mut partition = Partition::new((self.factory)());
            if self.broadcast > Timestamp::MIN {
                partition.feed(StreamEvent::punctuation(self.broadcast), &mut self.scratch)?;
            }
            debug!(partitions = self.partitions.len() + 1, "opened partition");
            self.partitions.insert(key.clone(), partition);
        }
        if let Some(partition) = self.partitions.get_mut(&key) {
            partition.feed(event, &mut self.scratch)?;
        }
        self.collect(&key);
        Ok(())
    }

    /// The punctuation a partition with no history would forward for the
    /// current broadcast time.
    fn fresh_watermark(&self) -> Result<Timestamp, EngineError> {
        if self.broadcast == Timestamp::MIN {
            return Ok(Timestamp::MIN);
        }
        let mut pipeline = (self.factory)();
        let mut out = Vec::new();
        pipeline.on_event(StreamEvent::punctuation(self.broadcast), &mut out)?;
        Ok(out
            .iter()
            .filter(|e| e.is_punctuation())
            .map(|e| e.sync_time)
            .max()
            .unwrap_or(Timestamp::MIN))
    }

    fn reclaim(&mut self) {
        let before = self.partitions.len();
        self.partitions.retain(|_, p| !p.reclaimable());
        let reclaimed = before - self.partitions.len();
        if reclaimed > 0 {
            debug!(reclaimed, live = self.partitions.len(), "reclaimed idle partitions");
        }
    }

    fn release(&mut self, out: &mut Vec<StreamEvent<R>>) -> Result<(), EngineError> {
        let bound = if self.broadcast == INFINITY {
            INFINITY
        } else {
            match self.partitions.values().map(|p| p.emitted).min() {
                Some(bound) => bound,
                None => self.fresh_watermark()?,
            }
        };
        while let Some(entry) = self.buffer.first_entry() {
            if *entry.key() >= bound {
                break;
            }
            out.extend(entry.remove());
        }
        if bound > self.forwarded {
            self.forwarded = bound;
            out.push(StreamEvent::punctuation(bound));
        }
        Ok(())
    }
}

impl<I, K, O, R> Operator<I, R> for GroupApply<I, K, O, R>
where
    I: Payload,
    K: PartitionKey,
    O: Payload,
    R: Payload,
{
    fn on_event(&mut self, event: StreamEvent<I>, out: &mut Vec<StreamEvent<R>>) -> Result<(), EngineError> {
        if event.is_punctuation() {
            self.broadcast_to_all(event.sync_time)?;
        } else {
            if let TimeSource::Ordered { lag } = self.time {
                let t = event.sync_time;
                self.broadcast_to_all(if lag == 0 { t } else { t.saturating_sub(lag) })?;
            }
            self.route(event)?;
        }
        self.reclaim();
        self.release(out)
    }

    fn is_idle(&self) -> bool {
        self.partitions.is_empty() && self.buffer.is_empty()
    }

    fn serialize_state(&self) -> Result<Value, CheckpointError> {
        let mut partitions = Vec::with_capacity(self.partitions.len());
        for (key, p) in &self.partitions {
            partitions.push((
                key.clone(),
                PartitionState {
                    pipeline: p.pipeline.serialize_state()?,
                    watermark: p.watermark,
                    last_end: p.last_end,
                    open_edges: p.open_edges,
                    emitted: p.emitted,
                },
            ));
        }
        state_to_value(&GroupState {
            partitions,
            buffered: self.buffer.values().flatten().cloned().collect(),
            broadcast: self.broadcast,
            forwarded: self.forwarded,
        })
    }

    fn deserialize_state(&mut self, state: Value) -> Result<(), CheckpointError> {
        let state: GroupState<K, R> = state_from_value(state)?;
        self.partitions.clear();
        for (key, saved) in state.partitions {
            let mut pipeline = (self.factory)();
            pipeline.deserialize_state(saved.pipeline)?;
            self.partitions.insert(
                key,
                Partition {
                    pipeline,
                    watermark: saved.watermark,
                    last_end: saved.last_end,
                    open_edges: saved.open_edges,
                    emitted: saved.emitted,
                },
            );
        }
        self.buffer.clear();
        for e in state.buffered {
            self.buffer.entry(e.sync_time).or_default().push(e);
        }
        self.broadcast = state.broadcast;
        self.forwarded = state.forwarded;
        Ok(())
    }
}
