//! The push-based operator contract and the stateless operators.
//!
//! An operator consumes one event at a time and appends whatever it
//! produces to an output buffer. Operators are chained into pipelines; each
//! event runs through the whole chain before the next one is admitted.
//!
//! Every operator keeps two promises:
//! - its output is non-decreasing in sync time;
//! - after forwarding a punctuation at `q` it never emits anything earlier
//!   than `q`.

use crate::error::EngineError;
use crate::persistence::{state_from_value, CheckpointError};
use serde_json::Value;
use std::marker::PhantomData;
use tempora_core::{Payload, StreamEvent, Timestamp};

/// A streaming operator from payload `I` to payload `O`.
pub trait Operator<I, O>: Send {
    /// Processes one event.
    fn on_event(&mut self, event: StreamEvent<I>, out: &mut Vec<StreamEvent<O>>) -> Result<(), EngineError>;

    /// True when the operator holds nothing that could still produce output.
    fn is_idle(&self) -> bool {
        true
    }

    /// Serializes all internal state.
    fn serialize_state(&self) -> Result<Value, CheckpointError> {
        Ok(Value::Null)
    }

    /// Replaces internal state with a previously serialized one.
    fn deserialize_state(&mut self, _state: Value) -> Result<(), CheckpointError> {
        Ok(())
    }
}

pub type BoxedOperator<I, O> = Box<dyn Operator<I, O>>;

/// A streaming operator over two inputs, left payload `L` and right payload
/// `R`. Each input arrives in its own sync-time order; the operator owns the
/// alignment between them.
pub trait BinaryOperator<L, R, O>: Send {
    fn on_left(&mut self, event: StreamEvent<L>, out: &mut Vec<StreamEvent<O>>) -> Result<(), EngineError>;

    fn on_right(&mut self, event: StreamEvent<R>, out: &mut Vec<StreamEvent<O>>) -> Result<(), EngineError>;

    fn serialize_state(&self) -> Result<Value, CheckpointError> {
        Ok(Value::Null)
    }

    fn deserialize_state(&mut self, _state: Value) -> Result<(), CheckpointError> {
        Ok(())
    }
}

pub type BoxedBinaryOperator<L, R, O> = Box<dyn BinaryOperator<L, R, O>>;

impl<I, O> Operator<I, O> for BoxedOperator<I, O> {
    fn on_event(&mut self, event: StreamEvent<I>, out: &mut Vec<StreamEvent<O>>) -> Result<(), EngineError> {
        (**self).on_event(event, out)
    }

    fn is_idle(&self) -> bool {
        (**self).is_idle()
    }

    fn serialize_state(&self) -> Result<Value, CheckpointError> {
        (**self).serialize_state()
    }

    fn deserialize_state(&mut self, state: Value) -> Result<(), CheckpointError> {
        (**self).deserialize_state(state)
    }
}

// =============================================================================
// Composition
// =============================================================================

/// Passes every event through unchanged.
pub struct Identity<P>(PhantomData<fn(P) -> P>);

impl<P> Identity<P> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<P> Default for Identity<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Payload> Operator<P, P> for Identity<P> {
    fn on_event(&mut self, event: StreamEvent<P>, out: &mut Vec<StreamEvent<P>>) -> Result<(), EngineError> {
        out.push(event);
        Ok(())
    }
}

/// Two operators run back to back.
pub struct Chain<I, M, O> {
    first: BoxedOperator<I, M>,
    second: BoxedOperator<M, O>,
    scratch: Vec<StreamEvent<M>>,
}

impl<I, M, O> Chain<I, M, O> {
    pub fn new(first: BoxedOperator<I, M>, second: BoxedOperator<M, O>) -> Self {
        Self {
            first,
            second,
            scratch: Vec::new(),
        }
    }
}

impl<I: Payload, M: Payload, O: Payload> Operator<I, O> for Chain<I, M, O> {
    fn on_event(&mut self, event: StreamEvent<I>, out: &mut Vec<StreamEvent<O>>) -> Result<(), EngineError> {
        self.first.on_event(event, &mut self.scratch)?;
        for mid in self.scratch.drain(..) {
            self.second.on_event(mid, out)?;
        }
        Ok(())
    }

    fn is_idle(&self) -> bool {
        self.first.is_idle() && self.second.is_idle()
    }

    fn serialize_state(&self) -> Result<Value, CheckpointError> {
        Ok(Value::Array(vec![
            self.first.serialize_state()?,
            self.second.serialize_state()?,
        ]))
    }

    fn deserialize_state(&mut self, state: Value) -> Result<(), CheckpointError> {
        let [first, second]: [Value; 2] = state_from_value(state)?;
        self.first.deserialize_state(first)?;
        self.second.deserialize_state(second)
    }
}

// =============================================================================
// Stateless operators
// =============================================================================

/// Keeps data events whose payload satisfies the predicate.
pub struct Filter<P, F> {
    predicate: F,
    _marker: PhantomData<fn(P)>,
}

impl<P, F> Filter<P, F>
where
    F: Fn(&P) -> bool,
{
    pub fn new(predicate: F) -> Self {
        Self {
            predicate,
            _marker: PhantomData,
        }
    }
}

impl<P: Payload, F> Operator<P, P> for Filter<P, F>
where
    F: Fn(&P) -> bool + Send,
{
    fn on_event(&mut self, event: StreamEvent<P>, out: &mut Vec<StreamEvent<P>>) -> Result<(), EngineError> {
        let keep = match event.payload() {
            Some(p) => (self.predicate)(p),
            None => true,
        };
        if keep {
            out.push(event);
        }
        Ok(())
    }
}

/// Rewrites payloads. The selector sees the event's start time.
pub struct Select<I, O, F> {
    selector: F,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O, F> Select<I, O, F>
where
    F: Fn(Timestamp, &I) -> O,
{
    pub fn new(selector: F) -> Self {
        Self {
            selector,
            _marker: PhantomData,
        }
    }
}

impl<I: Payload, O: Payload, F> Operator<I, O> for Select<I, O, F>
where
    F: Fn(Timestamp, &I) -> O + Send,
{
    fn on_event(&mut self, event: StreamEvent<I>, out: &mut Vec<StreamEvent<O>>) -> Result<(), EngineError> {
        let start = event.start_time();
        let selector = &self.selector;
        out.push(StreamEvent {
            kind: event.kind,
            sync_time: event.sync_time,
            other_time: event.other_time,
            payload: event.payload.as_ref().map(|p| selector(start, p)),
        });
        Ok(())
    }
}
