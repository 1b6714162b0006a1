//! Handles and the type-erased slots behind a running query.
//!
//! A query is a graph of sources. Inputs are sources fed by `push`; nodes
//! (joins, unions, multicasts) are sources fed by the pipelines of earlier
//! sources. Every source fans its events out to the pipelines attached to
//! it, and every pipeline ends either in a registered output or in a node.

use crate::error::EngineError;
use crate::ingress::{Ingress, IngressCheckpoint, IngressStats, PartitionedIngress, PartitionedIngressCheckpoint};
use crate::operator::{BoxedBinaryOperator, BoxedOperator};
use crate::partition::PartitionKey;
use crate::persistence::{state_from_value, state_to_value, CheckpointError, PipelineCheckpoint, SourceCheckpoint};
use serde_json::Value;
use std::any::Any;
use std::marker::PhantomData;
use tempora_core::{Payload, StreamEvent};

/// Where a pipeline reads its events from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SourceId {
    Input(usize),
    Node(usize),
}

/// Which input of a two-input node a pipeline feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Port {
    Left,
    Right,
}

/// Where a pipeline delivers its results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Target {
    Output(usize),
    Node { node: usize, port: Port },
}

impl Target {
    fn output(self) -> Option<usize> {
        match self {
            Target::Output(output) => Some(output),
            Target::Node { .. } => None,
        }
    }
}

/// Push side of a registered input.
#[derive(Debug)]
pub struct InputHandle<P> {
    pub(crate) container: u64,
    pub(crate) input: usize,
    name: String,
    _marker: PhantomData<fn(P)>,
}

impl<P> InputHandle<P> {
    pub(crate) fn new(container: u64, input: usize, name: String) -> Self {
        Self {
            container,
            input,
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<P> Clone for InputHandle<P> {
    fn clone(&self) -> Self {
        Self::new(self.container, self.input, self.name.clone())
    }
}

/// Drain side of a registered output.
#[derive(Debug)]
pub struct OutputHandle<O> {
    pub(crate) container: u64,
    pub(crate) source: SourceId,
    pub(crate) output: usize,
    _marker: PhantomData<fn() -> O>,
}

impl<O> OutputHandle<O> {
    pub(crate) fn new(container: u64, source: SourceId, output: usize) -> Self {
        Self {
            container,
            source,
            output,
            _marker: PhantomData,
        }
    }

    /// Registration index of this output within its query.
    pub fn id(&self) -> usize {
        self.output
    }
}

impl<O> Clone for OutputHandle<O> {
    fn clone(&self) -> Self {
        Self::new(self.container, self.source, self.output)
    }
}

// =============================================================================
// Admission
// =============================================================================

/// The ingress stage of an input, whatever its ordering model.
pub(crate) trait Admission<P>: Send {
    fn admit(&mut self, event: StreamEvent<P>, out: &mut Vec<StreamEvent<P>>) -> Result<(), EngineError>;
    fn complete(&mut self, out: &mut Vec<StreamEvent<P>>) -> Result<(), EngineError>;
    fn stats(&self) -> IngressStats;
    fn save(&self) -> Result<Value, CheckpointError>;
    fn load(&mut self, state: Value) -> Result<(), CheckpointError>;
}

impl<P: Payload> Admission<P> for Ingress<P> {
    fn admit(&mut self, event: StreamEvent<P>, out: &mut Vec<StreamEvent<P>>) -> Result<(), EngineError> {
        Ingress::admit(self, event, out)
    }

    fn complete(&mut self, out: &mut Vec<StreamEvent<P>>) -> Result<(), EngineError> {
        Ingress::complete(self, out)
    }

    fn stats(&self) -> IngressStats {
        Ingress::stats(self)
    }

    fn save(&self) -> Result<Value, CheckpointError> {
        state_to_value(&self.checkpoint())
    }

    fn load(&mut self, state: Value) -> Result<(), CheckpointError> {
        let cp: IngressCheckpoint<P> = state_from_value(state)?;
        self.restore(cp);
        Ok(())
    }
}

impl<P: Payload, K: PartitionKey> Admission<P> for PartitionedIngress<P, K> {
    fn admit(&mut self, event: StreamEvent<P>, out: &mut Vec<StreamEvent<P>>) -> Result<(), EngineError> {
        PartitionedIngress::admit(self, event, out)
    }

    fn complete(&mut self, out: &mut Vec<StreamEvent<P>>) -> Result<(), EngineError> {
        PartitionedIngress::complete(self, out)
    }

    fn stats(&self) -> IngressStats {
        PartitionedIngress::stats(self)
    }

    fn save(&self) -> Result<Value, CheckpointError> {
        state_to_value(&self.checkpoint())
    }

    fn load(&mut self, state: Value) -> Result<(), CheckpointError> {
        let cp: PartitionedIngressCheckpoint<K> = state_from_value(state)?;
        self.restore(cp);
        Ok(())
    }
}

// =============================================================================
// Pipelines
// =============================================================================

/// One operator chain and its undelivered results.
pub(crate) trait PipelineSlot<P>: Send {
    fn target(&self) -> Target;
    fn process(&mut self, events: &[StreamEvent<P>]) -> Result<(), EngineError>;
    fn pending(&self) -> usize;
    /// The result buffer, a `Vec<StreamEvent<O>>`.
    fn buffer_any(&mut self) -> &mut dyn Any;
    /// Takes the result buffer as a boxed `Vec<StreamEvent<O>>`.
    fn take_buffer(&mut self) -> Box<dyn Any + Send>;
    fn save(&self) -> Result<Value, CheckpointError>;
    fn load(&mut self, state: Value) -> Result<(), CheckpointError>;
}

pub(crate) struct TypedPipeline<P, O> {
    target: Target,
    op: BoxedOperator<P, O>,
    buffer: Vec<StreamEvent<O>>,
}

impl<P, O> TypedPipeline<P, O> {
    pub(crate) fn new(target: Target, op: BoxedOperator<P, O>) -> Self {
        Self {
            target,
            op,
            buffer: Vec::new(),
        }
    }
}

impl<P: Payload, O: Payload> PipelineSlot<P> for TypedPipeline<P, O> {
    fn target(&self) -> Target {
        self.target
    }

    fn process(&mut self, events: &[StreamEvent<P>]) -> Result<(), EngineError> {
        for event in events {
            self.op.on_event(event.clone(), &mut self.buffer)?;
        }
        Ok(())
    }

    fn pending(&self) -> usize {
        self.buffer.len()
    }

    fn buffer_any(&mut self) -> &mut dyn Any {
        &mut self.buffer
    }

    fn take_buffer(&mut self) -> Box<dyn Any + Send> {
        Box::new(std::mem::take(&mut self.buffer))
    }

    fn save(&self) -> Result<Value, CheckpointError> {
        self.op.serialize_state()
    }

    fn load(&mut self, state: Value) -> Result<(), CheckpointError> {
        self.op.deserialize_state(state)
    }
}

/// The pipelines attached to one source.
pub(crate) struct Fanout<P> {
    pipelines: Vec<Box<dyn PipelineSlot<P>>>,
}

impl<P: Payload> Fanout<P> {
    fn new() -> Self {
        Self { pipelines: Vec::new() }
    }

    pub(crate) fn attach(&mut self, pipeline: Box<dyn PipelineSlot<P>>) {
        self.pipelines.push(pipeline);
    }

    fn process(&mut self, events: &[StreamEvent<P>]) -> Result<(), EngineError> {
        if events.is_empty() {
            return Ok(());
        }
        for pipeline in &mut self.pipelines {
            pipeline.process(events)?;
        }
        Ok(())
    }

    fn output_buffer(&mut self, output: usize) -> Option<&mut dyn Any> {
        self.pipelines
            .iter_mut()
            .find(|p| p.target() == Target::Output(output))
            .map(|p| p.buffer_any())
    }

    fn pending(&self) -> Vec<(usize, usize)> {
        self.pipelines
            .iter()
            .filter_map(|p| p.target().output().map(|output| (output, p.pending())))
            .collect()
    }

    fn take_routed(&mut self, node: usize) -> Vec<(Port, Box<dyn Any + Send>)> {
        let mut routed = Vec::new();
        for pipeline in &mut self.pipelines {
            if let Target::Node { node: n, port } = pipeline.target() {
                if n == node && pipeline.pending() > 0 {
                    routed.push((port, pipeline.take_buffer()));
                }
            }
        }
        routed
    }

    fn save(&self) -> Result<Vec<PipelineCheckpoint>, CheckpointError> {
        let mut saved = Vec::with_capacity(self.pipelines.len());
        for pipeline in &self.pipelines {
            saved.push(PipelineCheckpoint {
                output: pipeline.target().output(),
                state: pipeline.save()?,
            });
        }
        Ok(saved)
    }

    fn load(&mut self, owner: &str, saved: Vec<PipelineCheckpoint>) -> Result<(), CheckpointError> {
        if saved.len() != self.pipelines.len() {
            return Err(CheckpointError::ShapeMismatch(format!(
                "'{}' feeds {} pipelines, checkpoint has {}",
                owner,
                self.pipelines.len(),
                saved.len()
            )));
        }
        for (pipeline, saved) in self.pipelines.iter_mut().zip(saved) {
            if pipeline.target().output() != saved.output {
                return Err(CheckpointError::ShapeMismatch(format!(
                    "pipeline on '{}' targets {:?}, checkpoint has output {:?}",
                    owner,
                    pipeline.target(),
                    saved.output
                )));
            }
            pipeline.load(saved.state)?;
        }
        Ok(())
    }
}

// =============================================================================
// Sources
// =============================================================================

/// A registered input with everything attached to it, payload type erased.
pub(crate) trait InputSlot: Send {
    fn name(&self) -> &str;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    /// The input's `Fanout<P>`.
    fn fanout_any(&mut self) -> &mut dyn Any;
    fn output_buffer(&mut self, output: usize) -> Option<&mut dyn Any>;
    /// `(output, undrained events)` for every attached output.
    fn pending(&self) -> Vec<(usize, usize)>;
    fn take_routed(&mut self, node: usize) -> Vec<(Port, Box<dyn Any + Send>)>;
    fn stats(&self) -> IngressStats;
    fn save(&self) -> Result<SourceCheckpoint, CheckpointError>;
    fn load(&mut self, checkpoint: SourceCheckpoint) -> Result<(), CheckpointError>;
}

pub(crate) struct TypedInput<P> {
    name: String,
    ingress: Box<dyn Admission<P>>,
    fanout: Fanout<P>,
    admitted: Vec<StreamEvent<P>>,
}

impl<P: Payload> TypedInput<P> {
    pub(crate) fn new(name: String, ingress: Box<dyn Admission<P>>) -> Self {
        Self {
            name,
            ingress,
            fanout: Fanout::new(),
            admitted: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, event: StreamEvent<P>) -> Result<(), EngineError> {
        self.admitted.clear();
        self.ingress.admit(event, &mut self.admitted)?;
        self.fanout.process(&self.admitted)
    }

    pub(crate) fn complete(&mut self) -> Result<(), EngineError> {
        self.admitted.clear();
        self.ingress.complete(&mut self.admitted)?;
        self.fanout.process(&self.admitted)
    }
}

fn check_name(expected: &str, checkpoint: &SourceCheckpoint) -> Result<(), CheckpointError> {
    if checkpoint.name != expected {
        return Err(CheckpointError::ShapeMismatch(format!(
            "expected source '{}', found '{}'",
            expected, checkpoint.name
        )));
    }
    Ok(())
}

impl<P: Payload> InputSlot for TypedInput<P> {
    fn name(&self) -> &str {
        &self.name
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn fanout_any(&mut self) -> &mut dyn Any {
        &mut self.fanout
    }

    fn output_buffer(&mut self, output: usize) -> Option<&mut dyn Any> {
        self.fanout.output_buffer(output)
    }

    fn pending(&self) -> Vec<(usize, usize)> {
        self.fanout.pending()
    }

    fn take_routed(&mut self, node: usize) -> Vec<(Port, Box<dyn Any + Send>)> {
        self.fanout.take_routed(node)
    }

    fn stats(&self) -> IngressStats {
        self.ingress.stats()
    }

    fn save(&self) -> Result<SourceCheckpoint, CheckpointError> {
        Ok(SourceCheckpoint {
            name: self.name.clone(),
            state: self.ingress.save()?,
            pipelines: self.fanout.save()?,
        })
    }

    fn load(&mut self, checkpoint: SourceCheckpoint) -> Result<(), CheckpointError> {
        check_name(&self.name, &checkpoint)?;
        self.fanout.load(&self.name, checkpoint.pipelines)?;
        self.ingress.load(checkpoint.state)
    }
}

/// A join, union or multicast node, payload types erased.
pub(crate) trait NodeSlot: Send {
    fn fanout_any(&mut self) -> &mut dyn Any;
    /// Runs a batch of upstream results, a boxed `Vec<StreamEvent<_>>` of
    /// the port's payload type, through the node.
    fn deliver(&mut self, port: Port, events: Box<dyn Any + Send>) -> Result<(), EngineError>;
    fn output_buffer(&mut self, output: usize) -> Option<&mut dyn Any>;
    fn pending(&self) -> Vec<(usize, usize)>;
    fn take_routed(&mut self, node: usize) -> Vec<(Port, Box<dyn Any + Send>)>;
    fn save(&self) -> Result<SourceCheckpoint, CheckpointError>;
    fn load(&mut self, checkpoint: SourceCheckpoint) -> Result<(), CheckpointError>;
}

pub(crate) struct TypedNode<L, R, O> {
    name: String,
    op: BoxedBinaryOperator<L, R, O>,
    fanout: Fanout<O>,
    produced: Vec<StreamEvent<O>>,
}

impl<L, R, O: Payload> TypedNode<L, R, O> {
    pub(crate) fn new(name: String, op: BoxedBinaryOperator<L, R, O>) -> Self {
        Self {
            name,
            op,
            fanout: Fanout::new(),
            produced: Vec::new(),
        }
    }
}

impl<L: Payload, R: Payload, O: Payload> NodeSlot for TypedNode<L, R, O> {
    fn fanout_any(&mut self) -> &mut dyn Any {
        &mut self.fanout
    }

    fn deliver(&mut self, port: Port, events: Box<dyn Any + Send>) -> Result<(), EngineError> {
        self.produced.clear();
        match port {
            Port::Left => {
                let events = events
                    .downcast::<Vec<StreamEvent<L>>>()
                    .map_err(|_| EngineError::UnknownHandle)?;
                for event in *events {
                    self.op.on_left(event, &mut self.produced)?;
                }
            }
            Port::Right => {
                let events = events
                    .downcast::<Vec<StreamEvent<R>>>()
                    .map_err(|_| EngineError::UnknownHandle)?;
                for event in *events {
                    self.op.on_right(event, &mut self.produced)?;
                }
            }
        }
        self.fanout.process(&self.produced)
    }

    fn output_buffer(&mut self, output: usize) -> Option<&mut dyn Any> {
        self.fanout.output_buffer(output)
    }

    fn pending(&self) -> Vec<(usize, usize)> {
        self.fanout.pending()
    }

    fn take_routed(&mut self, node: usize) -> Vec<(Port, Box<dyn Any + Send>)> {
        self.fanout.take_routed(node)
    }

    fn save(&self) -> Result<SourceCheckpoint, CheckpointError> {
        Ok(SourceCheckpoint {
            name: self.name.clone(),
            state: self.op.serialize_state()?,
            pipelines: self.fanout.save()?,
        })
    }

    fn load(&mut self, checkpoint: SourceCheckpoint) -> Result<(), CheckpointError> {
        check_name(&self.name, &checkpoint)?;
        self.fanout.load(&self.name, checkpoint.pipelines)?;
        self.op.deserialize_state(checkpoint.state)
    }
}
