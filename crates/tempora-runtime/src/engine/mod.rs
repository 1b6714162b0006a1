//! Query containers and running query processes.
//!
//! A [`QueryContainer`] collects inputs and outputs while a query is being
//! built. [`QueryContainer::start`] or [`QueryContainer::restore`] turns it
//! into a [`QueryProcess`] that accepts events.
//!
//! Every event pushed into a process runs through the input's ingress, every
//! pipeline attached to that input, and every join, union or multicast node
//! downstream of it before `push` returns, so a process is quiescent between
//! calls and can be checkpointed at any of them.
//!
//! Nodes only consume streams that existed when they were created, so
//! visiting nodes in creation order delivers everything in one pass.

mod types;

#[cfg(test)]
mod tests;

pub use types::{InputHandle, OutputHandle};
pub(crate) use types::SourceId;

use crate::codec;
use crate::config::EngineConfig;
use crate::error::{EngineError, QueryError};
use crate::ingress::{DisorderPolicy, Ingress, IngressPolicy, IngressStats, PartitionedIngress, PunctuationPolicy};
use crate::join::{EquiJoin, Multicast, Union};
use crate::operator::BoxedBinaryOperator;
use crate::partition::{KeyFn, PartitionKey};
use crate::persistence::{CheckpointError, CheckpointStore, QueryCheckpoint};
use crate::stream::{Origin, PartitionedStreamable, Streamable};
use rustc_hash::FxHashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tempora_core::{EventKind, Payload, StreamEvent, Timestamp};
use tracing::{debug, info};
use types::{Fanout, InputSlot, NodeSlot, Port, Target, TypedInput, TypedNode, TypedPipeline};

static NEXT_CONTAINER_ID: AtomicU64 = AtomicU64::new(1);

/// A query under construction.
pub struct QueryContainer {
    id: u64,
    config: EngineConfig,
    inputs: Vec<Box<dyn InputSlot>>,
    nodes: Vec<Box<dyn NodeSlot>>,
    outputs: usize,
}

impl Default for QueryContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryContainer {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            id: NEXT_CONTAINER_ID.fetch_add(1, Ordering::Relaxed),
            config,
            inputs: Vec::new(),
            nodes: Vec::new(),
            outputs: 0,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn check_name(&self, name: &str) -> Result<(), QueryError> {
        if self.inputs.iter().any(|i| i.name() == name) {
            return Err(QueryError::DuplicateInput(name.to_string()));
        }
        Ok(())
    }

    fn origin(&self) -> Origin {
        Origin {
            container: self.id,
            source: SourceId::Input(self.inputs.len()),
        }
    }

    /// Checks that `stream` was built on this container and that its source
    /// carries payload `I`.
    fn check_stream<I: Payload, P: Payload>(&mut self, stream: &Streamable<I, P>) -> Result<SourceId, QueryError> {
        let origin = stream.origin().ok_or(QueryError::Detached)?;
        if origin.container != self.id {
            return Err(QueryError::ForeignStream);
        }
        self.fanout::<I>(origin.source).ok_or(QueryError::ForeignStream)?;
        Ok(origin.source)
    }

    fn fanout<I: Payload>(&mut self, source: SourceId) -> Option<&mut Fanout<I>> {
        let any = match source {
            SourceId::Input(input) => self.inputs.get_mut(input)?.fanout_any(),
            SourceId::Node(node) => self.nodes.get_mut(node)?.fanout_any(),
        };
        any.downcast_mut::<Fanout<I>>()
    }

    fn attach<I: Payload, P: Payload>(&mut self, stream: Streamable<I, P>, target: Target) -> Result<SourceId, QueryError> {
        let source = self.check_stream(&stream)?;
        let fanout = self.fanout::<I>(source).ok_or(QueryError::ForeignStream)?;
        fanout.attach(Box::new(TypedPipeline::new(target, stream.into_operator())));
        Ok(source)
    }

    fn add_node<L: Payload, R: Payload, O: Payload>(
        &mut self,
        kind: &str,
        op: BoxedBinaryOperator<L, R, O>,
    ) -> Origin {
        let node = self.nodes.len();
        let name = format!("{kind}#{node}");
        debug!(node = %name, "registered node");
        self.nodes.push(Box::new(TypedNode::new(name, op)));
        Origin {
            container: self.id,
            source: SourceId::Node(node),
        }
    }

    /// Registers an ordered input.
    pub fn register_input<P: Payload>(
        &mut self,
        name: impl Into<String>,
        disorder: DisorderPolicy,
        punctuation: PunctuationPolicy,
    ) -> Result<(InputHandle<P>, Streamable<P, P>), QueryError> {
        let policy = IngressPolicy::new(disorder, punctuation).with_on_completed(self.config.ingress.on_completed);
        self.register_input_with(name, policy)
    }

    /// Registers an ordered input using the configured ingress defaults.
    pub fn register_configured_input<P: Payload>(
        &mut self,
        name: impl Into<String>,
    ) -> Result<(InputHandle<P>, Streamable<P, P>), QueryError> {
        let policy = self.config.ingress.policy();
        self.register_input_with(name, policy)
    }

    pub fn register_input_with<P: Payload>(
        &mut self,
        name: impl Into<String>,
        policy: IngressPolicy,
    ) -> Result<(InputHandle<P>, Streamable<P, P>), QueryError> {
        let name = name.into();
        self.check_name(&name)?;
        let origin = self.origin();
        let input = self.inputs.len();
        let ingress = Ingress::<P>::new(name.clone(), policy);
        self.inputs.push(Box::new(TypedInput::new(name.clone(), Box::new(ingress))));
        debug!(input = %name, ?policy, "registered input");
        Ok((
            InputHandle::new(origin.container, input, name),
            Streamable::attached(origin),
        ))
    }

    /// Registers an input that is ordered per key only.
    ///
    /// Disorder is judged per key; the stream's time is the newest sync
    /// time seen minus `punctuation_lag`. The returned stream is already
    /// partitioned by `key_fn`.
    pub fn register_partitioned_input<P, K, KF>(
        &mut self,
        name: impl Into<String>,
        key_fn: KF,
        disorder: DisorderPolicy,
        punctuation_lag: i64,
    ) -> Result<(InputHandle<P>, PartitionedStreamable<P, P, K>), QueryError>
    where
        P: Payload,
        K: PartitionKey,
        KF: Fn(&P) -> K + Send + Sync + 'static,
    {
        let name = name.into();
        self.check_name(&name)?;
        let origin = self.origin();
        let input = self.inputs.len();
        let key_fn: crate::partition::KeyFn<P, K> = Arc::new(key_fn);
        let ingress = PartitionedIngress::new(name.clone(), Arc::clone(&key_fn), disorder, punctuation_lag)
            .with_on_completed(self.config.ingress.on_completed);
        self.inputs.push(Box::new(TypedInput::new(name.clone(), Box::new(ingress))));
        debug!(input = %name, punctuation_lag, "registered partitioned input");
        Ok((
            InputHandle::new(origin.container, input, name),
            PartitionedStreamable::punctuated(Streamable::attached(origin), key_fn),
        ))
    }

    /// Attaches a finished stream as an output.
    pub fn register_output<I: Payload, O: Payload>(
        &mut self,
        stream: Streamable<I, O>,
    ) -> Result<OutputHandle<O>, QueryError> {
        let output = self.outputs;
        let source = self.attach(stream, Target::Output(output))?;
        self.outputs += 1;
        Ok(OutputHandle::new(self.id, source, output))
    }

    /// Temporal inner join of two streams.
    ///
    /// A left and a right event match when their keys are equal and their
    /// lifetimes overlap; the result `result(left, right)` lives over the
    /// intersection of the two lifetimes.
    pub fn join<IL, L, IR, R, K, J, LK, RK, F>(
        &mut self,
        left: Streamable<IL, L>,
        right: Streamable<IR, R>,
        left_key: LK,
        right_key: RK,
        result: F,
    ) -> Result<Streamable<J, J>, QueryError>
    where
        IL: Payload,
        L: Payload + PartialEq,
        IR: Payload,
        R: Payload + PartialEq,
        K: PartitionKey,
        J: Payload,
        LK: Fn(&L) -> K + Send + Sync + 'static,
        RK: Fn(&R) -> K + Send + Sync + 'static,
        F: Fn(&L, &R) -> J + Send + Sync + 'static,
    {
        self.check_stream(&left)?;
        self.check_stream(&right)?;
        let node = self.nodes.len();
        self.attach(left, Target::Node { node, port: Port::Left })?;
        self.attach(right, Target::Node { node, port: Port::Right })?;
        let left_key: KeyFn<L, K> = Arc::new(left_key);
        let right_key: KeyFn<R, K> = Arc::new(right_key);
        let op = EquiJoin::new(left_key, right_key, Arc::new(result));
        Ok(Streamable::attached(self.add_node::<L, R, J>("join", Box::new(op))))
    }

    /// Joins every left event with every overlapping right event.
    pub fn cross_join<IL, L, IR, R, J, F>(
        &mut self,
        left: Streamable<IL, L>,
        right: Streamable<IR, R>,
        result: F,
    ) -> Result<Streamable<J, J>, QueryError>
    where
        IL: Payload,
        L: Payload + PartialEq,
        IR: Payload,
        R: Payload + PartialEq,
        J: Payload,
        F: Fn(&L, &R) -> J + Send + Sync + 'static,
    {
        self.join(left, right, |_: &L| (), |_: &R| (), result)
    }

    /// Both streams as one, in sync-time order.
    pub fn union<IA, IB, P>(&mut self, first: Streamable<IA, P>, second: Streamable<IB, P>) -> Result<Streamable<P, P>, QueryError>
    where
        IA: Payload,
        IB: Payload,
        P: Payload,
    {
        self.check_stream(&first)?;
        self.check_stream(&second)?;
        let node = self.nodes.len();
        self.attach(first, Target::Node { node, port: Port::Left })?;
        self.attach(second, Target::Node { node, port: Port::Right })?;
        Ok(Streamable::attached(self.add_node::<P, P, P>("union", Box::new(Union::new()))))
    }

    /// Shares one stream between `copies` consumers. The operators before
    /// the multicast run once, whatever is built on the copies.
    pub fn multicast<I: Payload, P: Payload>(
        &mut self,
        stream: Streamable<I, P>,
        copies: usize,
    ) -> Result<Vec<Streamable<P, P>>, QueryError> {
        if copies == 0 {
            return Err(QueryError::NonPositive { param: "copies", value: 0 });
        }
        let node = self.nodes.len();
        self.attach(stream, Target::Node { node, port: Port::Left })?;
        let origin = self.add_node::<P, P, P>("multicast", Box::new(Multicast::new()));
        Ok((0..copies).map(|_| Streamable::attached(origin)).collect())
    }

    /// Starts the query with fresh state.
    pub fn start(self) -> QueryProcess {
        info!(
            container = self.id,
            inputs = self.inputs.len(),
            nodes = self.nodes.len(),
            outputs = self.outputs,
            "query started"
        );
        QueryProcess {
            id: self.id,
            config: self.config,
            inputs: self.inputs,
            nodes: self.nodes,
            disposed: false,
        }
    }

    /// Starts the query from a checkpoint, or fresh when `checkpoint` is
    /// `None`.
    pub fn restore<R: Read>(self, checkpoint: Option<R>) -> Result<QueryProcess, CheckpointError> {
        let Some(mut reader) = checkpoint else {
            return Ok(self.start());
        };
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        self.restore_bytes(&data)
    }

    /// Starts the query from the latest checkpoint of `query` in `store`.
    pub fn restore_from_store(self, store: &dyn CheckpointStore, query: &str) -> Result<QueryProcess, CheckpointError> {
        let data = store.load_latest(query)?;
        self.restore_bytes(&data)
    }

    fn restore_bytes(mut self, data: &[u8]) -> Result<QueryProcess, CheckpointError> {
        let checkpoint: QueryCheckpoint = codec::decode(data)?;
        checkpoint.check_version()?;
        if checkpoint.inputs.len() != self.inputs.len() {
            return Err(CheckpointError::ShapeMismatch(format!(
                "query has {} inputs, checkpoint has {}",
                self.inputs.len(),
                checkpoint.inputs.len()
            )));
        }
        if checkpoint.nodes.len() != self.nodes.len() {
            return Err(CheckpointError::ShapeMismatch(format!(
                "query has {} nodes, checkpoint has {}",
                self.nodes.len(),
                checkpoint.nodes.len()
            )));
        }
        for (slot, saved) in self.inputs.iter_mut().zip(checkpoint.inputs) {
            slot.load(saved)?;
        }
        for (slot, saved) in self.nodes.iter_mut().zip(checkpoint.nodes) {
            slot.load(saved)?;
        }
        info!(container = self.id, bytes = data.len(), "query restored from checkpoint");
        Ok(self.start())
    }
}

// =============================================================================
// Running queries
// =============================================================================

/// A running query.
pub struct QueryProcess {
    id: u64,
    config: EngineConfig,
    inputs: Vec<Box<dyn InputSlot>>,
    nodes: Vec<Box<dyn NodeSlot>>,
    disposed: bool,
}

impl QueryProcess {
    fn ensure_live(&self) -> Result<(), EngineError> {
        if self.disposed {
            Err(EngineError::Disposed)
        } else {
            Ok(())
        }
    }

    fn input<P: Payload>(&mut self, handle: &InputHandle<P>) -> Result<&mut TypedInput<P>, EngineError> {
        self.ensure_live()?;
        if handle.container != self.id {
            return Err(EngineError::UnknownHandle);
        }
        self.inputs
            .get_mut(handle.input)
            .and_then(|slot| slot.as_any_mut().downcast_mut::<TypedInput<P>>())
            .ok_or(EngineError::UnknownHandle)
    }

    /// Delivers everything the last push left in node-bound pipelines.
    fn route(&mut self) -> Result<(), EngineError> {
        for node in 0..self.nodes.len() {
            let mut arrivals = Vec::new();
            for slot in &mut self.inputs {
                arrivals.extend(slot.take_routed(node));
            }
            for slot in &mut self.nodes[..node] {
                arrivals.extend(slot.take_routed(node));
            }
            for (port, events) in arrivals {
                self.nodes[node].deliver(port, events)?;
            }
        }
        Ok(())
    }

    /// Pushes one event through the input and every pipeline behind it.
    pub fn push<P: Payload>(&mut self, handle: &InputHandle<P>, event: StreamEvent<P>) -> Result<(), EngineError> {
        self.input(handle)?.push(event)?;
        self.route()
    }

    pub fn push_all<P, E>(&mut self, handle: &InputHandle<P>, events: E) -> Result<(), EngineError>
    where
        P: Payload,
        E: IntoIterator<Item = StreamEvent<P>>,
    {
        for event in events {
            self.push(handle, event)?;
        }
        Ok(())
    }

    /// Completes the input according to its completion policy.
    pub fn complete<P: Payload>(&mut self, handle: &InputHandle<P>) -> Result<(), EngineError> {
        self.input(handle)?.complete()?;
        self.route()
    }

    /// Takes every result produced on `output` so far.
    pub fn drain<O: Payload>(&mut self, output: &OutputHandle<O>) -> Result<Vec<StreamEvent<O>>, EngineError> {
        self.ensure_live()?;
        if output.container != self.id {
            return Err(EngineError::UnknownHandle);
        }
        let buffer = match output.source {
            SourceId::Input(input) => self.inputs.get_mut(input).and_then(|slot| slot.output_buffer(output.output)),
            SourceId::Node(node) => self.nodes.get_mut(node).and_then(|slot| slot.output_buffer(output.output)),
        }
        .and_then(|any| any.downcast_mut::<Vec<StreamEvent<O>>>())
        .ok_or(EngineError::UnknownHandle)?;
        Ok(std::mem::take(buffer))
    }

    pub fn input_stats<P: Payload>(&mut self, handle: &InputHandle<P>) -> Result<IngressStats, EngineError> {
        Ok(self.input(handle)?.stats())
    }

    fn snapshot(&self) -> Result<QueryCheckpoint, CheckpointError> {
        let mut inputs = Vec::with_capacity(self.inputs.len());
        for slot in &self.inputs {
            inputs.push(slot.save()?);
        }
        let mut nodes = Vec::with_capacity(self.nodes.len());
        for slot in &self.nodes {
            nodes.push(slot.save()?);
        }
        Ok(QueryCheckpoint::new(inputs, nodes))
    }

    fn encode(&self) -> Result<Vec<u8>, EngineError> {
        self.ensure_live()?;
        let data = codec::encode(&self.snapshot()?, self.config.checkpoint.format)?;
        Ok(data)
    }

    /// Writes the complete query state. Undrained output is not included.
    pub fn checkpoint<W: Write>(&self, mut writer: W) -> Result<(), EngineError> {
        let data = self.encode()?;
        writer.write_all(&data).map_err(CheckpointError::from)?;
        writer.flush().map_err(CheckpointError::from)?;
        info!(container = self.id, bytes = data.len(), "checkpoint written");
        Ok(())
    }

    /// Saves a checkpoint under `query` and prunes old ones down to the
    /// configured retention. Returns the checkpoint's sequence number.
    pub fn checkpoint_to_store(&self, store: &dyn CheckpointStore, query: &str) -> Result<u64, EngineError> {
        let data = self.encode()?;
        let id = store.save(query, &data)?;
        let retention = self.config.checkpoint.retention;
        if retention > 0 {
            let pruned = store.prune(query, retention)?;
            if pruned > 0 {
                debug!(query, pruned, "pruned old checkpoints");
            }
        }
        info!(query, id, bytes = data.len(), "checkpoint saved");
        Ok(id)
    }

    /// Releases all query state.
    ///
    /// Fails if the process was already disposed, or while any output
    /// still holds undrained results.
    pub fn dispose(&mut self) -> Result<(), EngineError> {
        if self.disposed {
            return Err(EngineError::AlreadyDisposed);
        }
        let undrained = self
            .inputs
            .iter()
            .flat_map(|slot| slot.pending())
            .chain(self.nodes.iter().flat_map(|slot| slot.pending()));
        for (output, pending) in undrained {
            if pending > 0 {
                return Err(EngineError::UndrainedOutput { output, pending });
            }
        }
        self.inputs.clear();
        self.nodes.clear();
        self.disposed = true;
        info!(container = self.id, "query disposed");
        Ok(())
    }
}

// =============================================================================
// Egress helpers
// =============================================================================

/// Pairs each End-edge with its Start-edge into one Interval.
///
/// Intervals take the position of their Start-edge. Unmatched edges are
/// kept as they are; punctuations are dropped.
pub fn coalesce_edges<P: Payload + PartialEq>(events: Vec<StreamEvent<P>>) -> Vec<StreamEvent<P>> {
    let mut result: Vec<StreamEvent<P>> = Vec::with_capacity(events.len());
    let mut open: FxHashMap<Timestamp, Vec<usize>> = FxHashMap::default();
    for event in events {
        match event.kind {
            EventKind::Punctuation => {}
            EventKind::Start => {
                open.entry(event.sync_time).or_default().push(result.len());
                result.push(event);
            }
            EventKind::End => {
                let start = event.other_time;
                let matched = open.get_mut(&start).and_then(|slots| {
                    let pos = slots
                        .iter()
                        .position(|&i| result[i].payload.is_some() && result[i].payload == event.payload)?;
                    Some(slots.remove(pos))
                });
                match (matched, event.payload) {
                    (Some(index), Some(payload)) => {
                        result[index] = StreamEvent::interval(start, event.sync_time, payload);
                    }
                    (_, payload) => result.push(StreamEvent {
                        kind: EventKind::End,
                        sync_time: event.sync_time,
                        other_time: start,
                        payload,
                    }),
                }
            }
            EventKind::Interval | EventKind::Point => result.push(event),
        }
    }
    result
}
