//! Query construction: typed streams and the operators they chain.
//!
//! A [`Streamable<I, P>`] is a pipeline under construction. It consumes
//! events of the registered input's payload type `I` and currently produces
//! payload `P`. Each combinator appends one operator and returns a new
//! stream, so a query reads top to bottom:
//!
//! ```rust
//! use tempora_runtime::aggregation::Sum;
//! use tempora_runtime::engine::QueryContainer;
//! use tempora_runtime::ingress::{DisorderPolicy, PunctuationPolicy};
//! use tempora_core::StreamEvent;
//!
//! let mut container = QueryContainer::new();
//! let (input, stream) = container
//!     .register_input::<i64>("readings", DisorderPolicy::drop(), PunctuationPolicy::None)
//!     .unwrap();
//! let totals = stream
//!     .filter(|v| *v > 0)
//!     .tumbling_window_lifetime(10, 0)
//!     .unwrap()
//!     .aggregate(Sum::new(|v: &i64| *v));
//! let output = container.register_output(totals).unwrap();
//!
//! let mut process = container.start();
//! process.push(&input, StreamEvent::point(1, 5)).unwrap();
//! process.push(&input, StreamEvent::point(4, 7)).unwrap();
//! process.push(&input, StreamEvent::punctuation(10)).unwrap();
//! let results = process.drain(&output).unwrap();
//! assert_eq!(results[0], StreamEvent::interval(0, 10, 12));
//! ```
//!
//! Streams built inside `group_apply` and `partition_by` sub-queries are
//! detached: they are instantiated once per key and never registered
//! themselves.
//!
//! Streams are combined through the container:
//! [`QueryContainer::join`](crate::engine::QueryContainer::join),
//! [`union`](crate::engine::QueryContainer::union) and
//! [`multicast`](crate::engine::QueryContainer::multicast) each consume
//! their input streams and return new attached ones.

use crate::afa::{AfaMatcher, CompiledAfa, PatternMatch};
use crate::aggregation::Aggregate;
use crate::engine::SourceId;
use crate::error::QueryError;
use crate::incremental::{RetractionMode, SnapshotAggregate, WindowAggregate};
use crate::lifetime::{AlterLifetime, EndMap, EndRewrite, LifetimeMap};
use crate::operator::{BoxedOperator, Chain, Filter, Identity, Operator, Select};
use crate::partition::{GroupApply, KeyFn, PartitionKey, PipelineFactory, ResultFn, TimeSource};
use crate::window::{HoppingExpand, SessionWindow, WindowShape};
use std::sync::Arc;
use tempora_core::{Payload, Timestamp};

/// Where a stream's events come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Origin {
    pub(crate) container: u64,
    pub(crate) source: SourceId,
}

/// A pipeline from input payload `I` to payload `P`.
pub struct Streamable<I, P> {
    origin: Option<Origin>,
    op: BoxedOperator<I, P>,
}

fn positive(param: &'static str, value: i64) -> Result<i64, QueryError> {
    if value > 0 {
        Ok(value)
    } else {
        Err(QueryError::NonPositive { param, value })
    }
}

impl<P: Payload> Streamable<P, P> {
    /// A stream not attached to any input, used to build sub-queries.
    pub fn detached() -> Self {
        Self {
            origin: None,
            op: Box::new(Identity::new()),
        }
    }

    pub(crate) fn attached(origin: Origin) -> Self {
        Self {
            origin: Some(origin),
            op: Box::new(Identity::new()),
        }
    }
}

impl<I: Payload, P: Payload> Streamable<I, P> {
    pub(crate) fn origin(&self) -> Option<Origin> {
        self.origin
    }

    pub(crate) fn into_operator(self) -> BoxedOperator<I, P> {
        self.op
    }

    /// Appends an arbitrary operator.
    pub fn then<Q, Op>(self, op: Op) -> Streamable<I, Q>
    where
        Q: Payload,
        Op: Operator<P, Q> + 'static,
    {
        Streamable {
            origin: self.origin,
            op: Box::new(Chain::new(self.op, Box::new(op))),
        }
    }

    // =========================================================================
    // Stateless
    // =========================================================================

    /// Keeps events whose payload satisfies `predicate`.
    pub fn filter<F>(self, predicate: F) -> Self
    where
        F: Fn(&P) -> bool + Send + 'static,
    {
        self.then(Filter::new(predicate))
    }

    pub fn select<Q, F>(self, selector: F) -> Streamable<I, Q>
    where
        Q: Payload,
        F: Fn(&P) -> Q + Send + 'static,
    {
        self.then(Select::new(move |_: Timestamp, payload: &P| selector(payload)))
    }

    /// Like [`select`](Self::select), but the selector also sees each
    /// event's start time.
    pub fn select_with_start<Q, F>(self, selector: F) -> Streamable<I, Q>
    where
        Q: Payload,
        F: Fn(Timestamp, &P) -> Q + Send + 'static,
    {
        self.then(Select::new(selector))
    }

    // =========================================================================
    // Lifetimes
    // =========================================================================

    /// Every lifetime becomes `[start, start + duration)`.
    pub fn alter_event_duration(self, duration: i64) -> Result<Self, QueryError> {
        let duration = positive("duration", duration)?;
        Ok(self.then(AlterLifetime::new(LifetimeMap::Duration(duration))))
    }

    /// Moves every lifetime by `delta` ticks. Edges stay edges.
    pub fn shift_event_lifetime(self, delta: i64) -> Self {
        self.then(AlterLifetime::new(LifetimeMap::Shift(delta)))
    }

    // =========================================================================
    // Windows
    // =========================================================================

    pub fn window(self, shape: WindowShape) -> WindowedStreamable<I, P> {
        WindowedStreamable { stream: self, shape }
    }

    /// Snaps every lifetime to the tumbling grid cell containing its start.
    pub fn tumbling_window_lifetime(self, size: i64, offset: i64) -> Result<WindowedStreamable<I, P>, QueryError> {
        Ok(self.window(WindowShape::tumbling(size, offset)?))
    }

    pub fn hopping_window_lifetime(
        self,
        size: i64,
        hop: i64,
        offset: i64,
    ) -> Result<WindowedStreamable<I, P>, QueryError> {
        Ok(self.window(WindowShape::hopping(size, hop, offset)?))
    }

    pub fn sliding_window_lifetime(self, size: i64) -> Result<WindowedStreamable<I, P>, QueryError> {
        Ok(self.window(WindowShape::sliding(size)?))
    }

    pub fn session_timeout_window(self, gap: i64) -> Result<WindowedStreamable<I, P>, QueryError> {
        Ok(self.window(WindowShape::session(gap)?))
    }

    /// Session window whose sessions also close `max_duration` after they open.
    pub fn session_timeout_window_capped(
        self,
        gap: i64,
        max_duration: i64,
    ) -> Result<WindowedStreamable<I, P>, QueryError> {
        Ok(self.window(WindowShape::capped_session(gap, max_duration)?))
    }

    // =========================================================================
    // Aggregation and grouping
    // =========================================================================

    /// Ongoing aggregate over every live event, emitted as edges whenever
    /// the result changes.
    pub fn aggregate<A>(self, aggregate: A) -> Streamable<I, A::Output>
    where
        A: Aggregate<P>,
    {
        self.then(SnapshotAggregate::new(aggregate, RetractionMode::Deaccumulate))
    }

    /// Runs `sub_query` once per key and merges the results, re-tagged by
    /// `result_fn`. Time reaches idle keys as each new event arrives.
    pub fn group_apply<K, O, R, KF, SQ, RF>(self, key_fn: KF, sub_query: SQ, result_fn: RF) -> Streamable<I, R>
    where
        K: PartitionKey,
        O: Payload,
        R: Payload,
        KF: Fn(&P) -> K + Send + Sync + 'static,
        SQ: Fn(Streamable<P, P>) -> Streamable<P, O> + Send + Sync + 'static,
        RF: Fn(&K, O) -> R + Send + Sync + 'static,
    {
        self.partition_by(key_fn, 0).group_apply(sub_query, result_fn)
    }

    /// Splits the stream by key. Each key sees the parent's time held back
    /// by `punctuation_lag` ticks.
    pub fn partition_by<K, KF>(self, key_fn: KF, punctuation_lag: i64) -> PartitionedStreamable<I, P, K>
    where
        K: PartitionKey,
        KF: Fn(&P) -> K + Send + Sync + 'static,
    {
        PartitionedStreamable {
            stream: self,
            key_fn: Arc::new(key_fn),
            time: TimeSource::Ordered {
                lag: punctuation_lag.max(0),
            },
        }
    }

    // =========================================================================
    // Patterns
    // =========================================================================

    /// Emits the register of every match of `afa`.
    pub fn detect<R: Payload>(self, afa: Arc<CompiledAfa<P, R>>) -> Streamable<I, R> {
        self.then(AfaMatcher::registers(afa))
    }

    /// Emits every match together with the events that formed it.
    pub fn detect_with_events<R: Payload>(self, afa: Arc<CompiledAfa<P, R>>) -> Streamable<I, PatternMatch<P, R>> {
        self.then(AfaMatcher::with_events(afa))
    }
}

impl<I: Payload, P: Payload + PartialEq> Streamable<I, P> {
    /// Caps every lifetime at `max` ticks.
    pub fn clip_event_duration(self, max: i64) -> Result<Self, QueryError> {
        let max = positive("maximum duration", max)?;
        Ok(self.then(EndRewrite::new(EndMap::Clip(max))))
    }

    /// Lengthens every lifetime by `extra` ticks.
    pub fn extend_lifetime(self, extra: i64) -> Result<Self, QueryError> {
        let extra = positive("extension", extra)?;
        Ok(self.then(EndRewrite::new(EndMap::Extend(extra))))
    }
}

// =============================================================================
// Windowed streams
// =============================================================================

/// A stream with a window shape attached, waiting for an aggregate.
pub struct WindowedStreamable<I, P> {
    stream: Streamable<I, P>,
    shape: WindowShape,
}

impl<I: Payload, P: Payload> WindowedStreamable<I, P> {
    pub fn shape(&self) -> WindowShape {
        self.shape
    }

    /// Aggregates each window.
    ///
    /// Tumbling and hopping windows run as one fused operator and emit one
    /// Interval per non-empty window. Sliding and session windows rewrite
    /// lifetimes first and report the ongoing aggregate as edges.
    pub fn aggregate<A>(self, aggregate: A) -> Streamable<I, A::Output>
    where
        A: Aggregate<P>,
    {
        match self.shape {
            WindowShape::Tumbling { size, offset } => {
                self.stream.then(WindowAggregate::tumbling(aggregate, size, offset))
            }
            WindowShape::Hopping { size, hop, offset } => {
                self.stream.then(WindowAggregate::hopping(aggregate, size, hop, offset))
            }
            WindowShape::Sliding { size } => self
                .stream
                .then(AlterLifetime::new(LifetimeMap::Duration(size)))
                .then(SnapshotAggregate::new(aggregate, RetractionMode::Difference)),
            WindowShape::Session { gap, max_duration } => self
                .stream
                .then(SessionWindow::new(gap).with_max_duration(max_duration))
                .then(SnapshotAggregate::new(aggregate, RetractionMode::Deaccumulate)),
        }
    }
}

impl<I: Payload, P: Payload + PartialEq> WindowedStreamable<I, P> {
    /// The rewritten events themselves, one per window membership.
    pub fn into_stream(self) -> Streamable<I, P> {
        match self.shape {
            WindowShape::Tumbling { size, offset } => self
                .stream
                .then(AlterLifetime::new(LifetimeMap::Tumbling { size, offset })),
            WindowShape::Hopping { size, hop, offset } => self.stream.then(HoppingExpand::new(size, hop, offset)),
            WindowShape::Sliding { size } => self.stream.then(AlterLifetime::new(LifetimeMap::Duration(size))),
            WindowShape::Session { gap, max_duration } => self
                .stream
                .then(SessionWindow::new(gap).with_max_duration(max_duration)),
        }
    }
}

// =============================================================================
// Partitioned streams
// =============================================================================

/// A stream split by key, waiting for the per-key sub-query.
pub struct PartitionedStreamable<I, P, K> {
    stream: Streamable<I, P>,
    key_fn: KeyFn<P, K>,
    time: TimeSource,
}

impl<I: Payload, P: Payload, K: PartitionKey> PartitionedStreamable<I, P, K> {
    pub(crate) fn punctuated(stream: Streamable<I, P>, key_fn: KeyFn<P, K>) -> Self {
        Self {
            stream,
            key_fn,
            time: TimeSource::Punctuated,
        }
    }

    fn apply<O, R>(self, factory: PipelineFactory<P, O>, result_fn: ResultFn<K, O, R>) -> Streamable<I, R>
    where
        O: Payload,
        R: Payload,
    {
        self.stream
            .then(GroupApply::new(self.key_fn, factory, result_fn, self.time))
    }

    /// Runs a fresh copy of `sub_query` per key.
    pub fn group_apply<O, R, SQ, RF>(self, sub_query: SQ, result_fn: RF) -> Streamable<I, R>
    where
        O: Payload,
        R: Payload,
        SQ: Fn(Streamable<P, P>) -> Streamable<P, O> + Send + Sync + 'static,
        RF: Fn(&K, O) -> R + Send + Sync + 'static,
    {
        let factory: PipelineFactory<P, O> = Arc::new(move || sub_query(Streamable::detached()).into_operator());
        self.apply(factory, Arc::new(result_fn))
    }

    /// Ongoing aggregate per key, tagged `(key, value)`.
    pub fn aggregate<A>(self, aggregate: A) -> Streamable<I, (K, A::Output)>
    where
        A: Aggregate<P> + Clone + Sync,
    {
        let factory: PipelineFactory<P, A::Output> = Arc::new(move || {
            Box::new(SnapshotAggregate::new(
                aggregate.clone(),
                RetractionMode::Deaccumulate,
            ))
        });
        self.apply(factory, Arc::new(|key: &K, value| (key.clone(), value)))
    }

    /// Runs `afa` independently per key, tagging each match register with
    /// its key.
    pub fn detect<R: Payload>(self, afa: Arc<CompiledAfa<P, R>>) -> Streamable<I, (K, R)> {
        let factory: PipelineFactory<P, R> = Arc::new(move || Box::new(AfaMatcher::registers(Arc::clone(&afa))));
        self.apply(factory, Arc::new(|key: &K, register| (key.clone(), register)))
    }

    pub fn detect_with_events<R: Payload>(
        self,
        afa: Arc<CompiledAfa<P, R>>,
    ) -> Streamable<I, (K, PatternMatch<P, R>)> {
        let factory: PipelineFactory<P, PatternMatch<P, R>> =
            Arc::new(move || Box::new(AfaMatcher::with_events(Arc::clone(&afa))));
        self.apply(factory, Arc::new(|key: &K, found| (key.clone(), found)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::{Count, Sum};
    use crate::pattern::Regex;
    use tempora_core::StreamEvent;

    fn run<O: Payload>(stream: Streamable<i64, O>, events: Vec<StreamEvent<i64>>) -> Vec<StreamEvent<O>> {
        let mut op = stream.into_operator();
        let mut out = Vec::new();
        for e in events {
            op.on_event(e, &mut out).unwrap();
        }
        out
    }

    #[test]
    fn test_filter_then_select() {
        let stream = Streamable::detached().filter(|v: &i64| v % 2 == 1).select(|v| v * 10);
        let out = run(stream, vec![StreamEvent::point(1, 1), StreamEvent::point(2, 2), StreamEvent::point(3, 3)]);
        assert_eq!(out, vec![StreamEvent::point(1, 10), StreamEvent::point(3, 30)]);
    }

    #[test]
    fn test_invalid_lifetime_parameters() {
        assert!(matches!(
            Streamable::<i64, i64>::detached().alter_event_duration(0),
            Err(QueryError::NonPositive { param: "duration", value: 0 })
        ));
        assert!(Streamable::<i64, i64>::detached().extend_lifetime(-1).is_err());
        assert!(matches!(
            Streamable::<i64, i64>::detached().tumbling_window_lifetime(0, 0),
            Err(QueryError::Window(_))
        ));
    }

    #[test]
    fn test_tumbling_into_stream_snaps_lifetimes() {
        let stream = Streamable::detached()
            .tumbling_window_lifetime(10, 0)
            .unwrap()
            .into_stream();
        let out = run(stream, vec![StreamEvent::point(3, 1), StreamEvent::punctuation(12)]);
        assert_eq!(out, vec![StreamEvent::interval(0, 10, 1), StreamEvent::punctuation(10)]);
    }

    #[test]
    fn test_tumbling_aggregate_emits_window_intervals() {
        let stream = Streamable::detached()
            .tumbling_window_lifetime(10, 0)
            .unwrap()
            .aggregate(Sum::new(|v: &i64| *v));
        let out = run(
            stream,
            vec![
                StreamEvent::point(1, 5),
                StreamEvent::point(4, 7),
                StreamEvent::point(13, 1),
                StreamEvent::punctuation(20),
            ],
        );
        let data: Vec<_> = out.into_iter().filter(|e| e.is_data()).collect();
        assert_eq!(data, vec![StreamEvent::interval(0, 10, 12), StreamEvent::interval(10, 20, 1)]);
    }

    #[test]
    fn test_group_apply_counts_per_key() {
        let stream = Streamable::detached().group_apply(
            |v: &i64| v % 2,
            |s| s.aggregate(Count::new()),
            |k: &i64, n: u64| (*k, n),
        );
        let out = run(
            stream,
            vec![StreamEvent::point(1, 1), StreamEvent::point(1, 3), StreamEvent::point(2, 2), StreamEvent::punctuation(5)],
        );
        let starts: Vec<_> = out
            .iter()
            .filter(|e| e.kind == tempora_core::EventKind::Start)
            .filter_map(|e| e.payload().copied())
            .collect();
        assert!(starts.contains(&(1, 2)));
        assert!(starts.contains(&(0, 1)));
    }

    #[test]
    fn test_partitioned_detect_tags_keys() {
        let afa = Regex::single(|v: &i64| *v > 10)
            .concat(Regex::single(|v: &i64| *v > 10))
            .compile(0i64)
            .compile()
            .unwrap();
        let stream = Streamable::detached().partition_by(|v: &i64| v % 2, 0).detect(afa);
        let out = run(
            stream,
            vec![
                StreamEvent::point(1, 11),
                StreamEvent::point(2, 12),
                StreamEvent::point(3, 13),
                StreamEvent::punctuation(10),
            ],
        );
        let matches: Vec<_> = out.iter().filter_map(|e| e.payload().copied()).collect();
        assert_eq!(matches, vec![(1, 0)]);
    }
}
