//! Joins, unions and multicasts through running queries.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempora_core::{StreamEvent, INFINITY};
use tempora_runtime::aggregation::{Count, Sum};
use tempora_runtime::engine::{InputHandle, OutputHandle, QueryContainer};
use tempora_runtime::ingress::{DisorderPolicy, PunctuationPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct Session {
    id: i32,
    kind: i32,
}

fn session(start: i64, id: i32, kind: i32) -> StreamEvent<Session> {
    StreamEvent::interval(start, 10, Session { id, kind })
}

fn first_sessions() -> Vec<StreamEvent<Session>> {
    vec![
        session(1, 1, 11),
        session(1, 2, 12),
        session(3, 3, 13),
        session(3, 1, 14),
        session(5, 2, 15),
        session(5, 3, 11),
        session(7, 1, 12),
        session(7, 2, 13),
        session(9, 3, 14),
    ]
}

fn second_sessions() -> Vec<StreamEvent<Session>> {
    vec![
        session(2, 1, 21),
        session(4, 2, 22),
        session(6, 3, 23),
        session(8, 4, 24),
    ]
}

type Joined = (i32, i32, i32);

fn join_query() -> (
    QueryContainer,
    InputHandle<Session>,
    InputHandle<Session>,
    OutputHandle<Joined>,
) {
    let mut container = QueryContainer::new();
    let (left, left_stream) = container
        .register_input::<Session>("first", DisorderPolicy::throw(), PunctuationPolicy::None)
        .unwrap();
    let (right, right_stream) = container
        .register_input::<Session>("second", DisorderPolicy::throw(), PunctuationPolicy::None)
        .unwrap();
    let joined = container
        .join(
            left_stream,
            right_stream,
            |s: &Session| s.id,
            |s: &Session| s.id,
            |l: &Session, r: &Session| (l.id, l.kind, r.kind),
        )
        .unwrap();
    let output = container.register_output(joined).unwrap();
    (container, left, right, output)
}

// =============================================================================
// Joins
// =============================================================================

#[test]
fn equi_join_intersects_matching_sessions() {
    let (container, left, right, output) = join_query();
    let mut process = container.start();
    process.push_all(&left, first_sessions()).unwrap();
    process.push_all(&right, second_sessions()).unwrap();
    process.complete(&left).unwrap();
    process.complete(&right).unwrap();

    assert_eq!(
        process.drain(&output).unwrap(),
        vec![
            StreamEvent::interval(2, 10, (1, 11, 21)),
            StreamEvent::interval(3, 10, (1, 14, 21)),
            StreamEvent::interval(4, 10, (2, 12, 22)),
            StreamEvent::interval(5, 10, (2, 15, 22)),
            StreamEvent::interval(6, 10, (3, 13, 23)),
            StreamEvent::interval(6, 10, (3, 11, 23)),
            StreamEvent::interval(7, 10, (1, 12, 21)),
            StreamEvent::interval(7, 10, (2, 13, 22)),
            StreamEvent::interval(9, 10, (3, 14, 23)),
            StreamEvent::punctuation(INFINITY),
        ]
    );
}

#[test]
fn cross_join_pairs_every_overlap() {
    let mut container = QueryContainer::new();
    let (left, left_stream) = container
        .register_input::<Session>("first", DisorderPolicy::throw(), PunctuationPolicy::None)
        .unwrap();
    let (right, right_stream) = container
        .register_input::<Session>("second", DisorderPolicy::throw(), PunctuationPolicy::None)
        .unwrap();
    let pairs = container
        .cross_join(left_stream, right_stream, |l: &Session, r: &Session| (l.id, r.id))
        .unwrap();
    let output = container.register_output(pairs).unwrap();

    let mut process = container.start();
    process.push_all(&right, second_sessions()).unwrap();
    process.push_all(&left, first_sessions()).unwrap();
    process.complete(&right).unwrap();
    process.complete(&left).unwrap();

    let results: Vec<_> = process.drain(&output).unwrap().into_iter().filter(|e| e.is_data()).collect();
    assert_eq!(results.len(), 36);
    assert!(results.iter().all(|e| e.other_time == 10));
    assert!(results.windows(2).all(|w| w[0].sync_time <= w[1].sync_time));
}

#[test]
fn join_results_feed_windowed_aggregates() {
    let mut container = QueryContainer::new();
    let (left, left_stream) = container
        .register_input::<Session>("first", DisorderPolicy::throw(), PunctuationPolicy::None)
        .unwrap();
    let (right, right_stream) = container
        .register_input::<Session>("second", DisorderPolicy::throw(), PunctuationPolicy::None)
        .unwrap();
    let joined = container
        .join(
            left_stream,
            right_stream,
            |s: &Session| s.id,
            |s: &Session| s.id,
            |l: &Session, r: &Session| (l.kind, r.kind),
        )
        .unwrap();
    let counts = joined
        .tumbling_window_lifetime(10, 0)
        .unwrap()
        .aggregate(Count::new());
    let output = container.register_output(counts).unwrap();

    let mut process = container.start();
    process.push_all(&left, first_sessions()).unwrap();
    process.push_all(&right, second_sessions()).unwrap();
    process.complete(&left).unwrap();
    process.complete(&right).unwrap();

    let results: Vec<_> = process.drain(&output).unwrap().into_iter().filter(|e| e.is_data()).collect();
    assert_eq!(results, vec![StreamEvent::interval(0, 10, 9u64)]);
}

#[test]
fn join_resumes_from_checkpoint() {
    let (container, left, right, output) = join_query();
    let mut process = container.start();
    process.push_all(&left, first_sessions()).unwrap();
    process.push_all(&right, second_sessions()).unwrap();
    process.complete(&left).unwrap();
    process.complete(&right).unwrap();
    let expected = process.drain(&output).unwrap();

    let (container, left, right, output) = join_query();
    let mut process = container.start();
    process.push_all(&left, first_sessions()).unwrap();
    process.push_all(&right, second_sessions().into_iter().take(2)).unwrap();
    let mut results = process.drain(&output).unwrap();
    let mut blob = Vec::new();
    process.checkpoint(&mut blob).unwrap();
    drop(process);

    let (container, left, right, output) = join_query();
    let mut process = container.restore(Some(blob.as_slice())).unwrap();
    process.push_all(&right, second_sessions().into_iter().skip(2)).unwrap();
    process.complete(&left).unwrap();
    process.complete(&right).unwrap();
    results.extend(process.drain(&output).unwrap());

    assert_eq!(results, expected);
}

// =============================================================================
// Union and multicast
// =============================================================================

#[test]
fn union_merges_inputs_in_time_order() {
    let mut container = QueryContainer::new();
    let (a, a_stream) = container
        .register_input::<i64>("a", DisorderPolicy::throw(), PunctuationPolicy::None)
        .unwrap();
    let (b, b_stream) = container
        .register_input::<i64>("b", DisorderPolicy::throw(), PunctuationPolicy::None)
        .unwrap();
    let merged = container.union(a_stream, b_stream.select(|v| v * 10)).unwrap();
    let all = container.register_output(merged).unwrap();

    let mut process = container.start();
    process
        .push_all(&a, vec![StreamEvent::point(1, 1), StreamEvent::point(12, 2)])
        .unwrap();
    process
        .push_all(&b, vec![StreamEvent::point(5, 1), StreamEvent::point(15, 2)])
        .unwrap();
    process.complete(&a).unwrap();
    process.complete(&b).unwrap();

    assert_eq!(
        process.drain(&all).unwrap(),
        vec![
            StreamEvent::point(1, 1),
            StreamEvent::point(5, 10),
            StreamEvent::point(12, 2),
            StreamEvent::point(15, 20),
            StreamEvent::punctuation(INFINITY),
        ]
    );
}

#[test]
fn union_output_aggregates_both_inputs() {
    let mut container = QueryContainer::new();
    let (a, a_stream) = container
        .register_input::<i64>("a", DisorderPolicy::throw(), PunctuationPolicy::None)
        .unwrap();
    let (b, b_stream) = container
        .register_input::<i64>("b", DisorderPolicy::throw(), PunctuationPolicy::None)
        .unwrap();
    let sums = container
        .union(a_stream, b_stream)
        .unwrap()
        .tumbling_window_lifetime(10, 0)
        .unwrap()
        .aggregate(Sum::new(|v: &i64| *v));
    let output = container.register_output(sums).unwrap();

    let mut process = container.start();
    process
        .push_all(&a, vec![StreamEvent::point(1, 1), StreamEvent::point(12, 2)])
        .unwrap();
    process
        .push_all(&b, vec![StreamEvent::point(5, 10), StreamEvent::point(15, 20)])
        .unwrap();
    process.complete(&a).unwrap();
    process.complete(&b).unwrap();

    let results: Vec<_> = process.drain(&output).unwrap().into_iter().filter(|e| e.is_data()).collect();
    assert_eq!(
        results,
        vec![StreamEvent::interval(0, 10, 11), StreamEvent::interval(10, 20, 22)]
    );
}

#[test]
fn multicast_runs_shared_prefix_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);

    let mut container = QueryContainer::new();
    let (input, stream) = container
        .register_input::<i64>("values", DisorderPolicy::throw(), PunctuationPolicy::None)
        .unwrap();
    let doubled = stream.select(move |v| {
        seen.fetch_add(1, Ordering::Relaxed);
        v * 2
    });
    let mut copies = container.multicast(doubled, 2).unwrap().into_iter();
    let (Some(raw), Some(summed)) = (copies.next(), copies.next()) else {
        panic!("expected two copies");
    };
    let raw = container.register_output(raw.filter(|v| *v > 2)).unwrap();
    let summed = container
        .register_output(summed.tumbling_window_lifetime(10, 0).unwrap().aggregate(Sum::new(|v: &i64| *v)))
        .unwrap();

    let mut process = container.start();
    process
        .push_all(
            &input,
            vec![StreamEvent::point(1, 1), StreamEvent::point(2, 2), StreamEvent::point(3, 3)],
        )
        .unwrap();
    process.complete(&input).unwrap();

    assert_eq!(calls.load(Ordering::Relaxed), 3);
    assert_eq!(
        process.drain(&raw).unwrap(),
        vec![
            StreamEvent::point(2, 4),
            StreamEvent::point(3, 6),
            StreamEvent::punctuation(INFINITY),
        ]
    );
    let sums: Vec<_> = process.drain(&summed).unwrap().into_iter().filter(|e| e.is_data()).collect();
    assert_eq!(sums, vec![StreamEvent::interval(0, 10, 12)]);
}
