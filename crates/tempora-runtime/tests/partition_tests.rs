//! Keyed queries: group-apply over ordered inputs and partitioned inputs
//! that are only ordered per key.

use tempora_core::{StreamEvent, INFINITY};
use tempora_runtime::aggregation::{Count, Sum};
use tempora_runtime::engine::QueryContainer;
use tempora_runtime::error::EngineError;
use tempora_runtime::ingress::{DisorderPolicy, PunctuationPolicy};

type Reading = (u8, i64);

fn payloads<T: Ord + Clone>(events: &[StreamEvent<T>]) -> Vec<T> {
    let mut values: Vec<T> = events.iter().filter_map(|e| e.payload().cloned()).collect();
    values.sort();
    values
}

#[test]
fn partitioned_input_accepts_cross_key_disorder() {
    let mut container = QueryContainer::new();
    let (input, stream) = container
        .register_partitioned_input("readings", |r: &Reading| r.0, DisorderPolicy::throw(), 10)
        .unwrap();
    let counts = stream.group_apply(
        |s| s.tumbling_window_lifetime(100, 0).unwrap().aggregate(Count::new()),
        |key: &u8, n: u64| (*key, n),
    );
    let output = container.register_output(counts).unwrap();
    let mut process = container.start();

    // Key 0 arrives first in full; key 1 trails it across keys.
    for (t, r) in [(1, (0, 1)), (3, (0, 3)), (2, (1, 2))] {
        process.push(&input, StreamEvent::point(t, r)).unwrap();
    }
    process.complete(&input).unwrap();

    let results = process.drain(&output).unwrap();
    assert_eq!(payloads(&results), vec![(0, 2), (1, 1)]);
    assert!(results
        .iter()
        .filter(|e| e.is_data())
        .all(|e| *e == StreamEvent::interval(0, 100, e.payload().cloned().unwrap())));
    assert_eq!(results.last(), Some(&StreamEvent::punctuation(INFINITY)));
}

#[test]
fn partitioned_input_rejects_per_key_disorder() {
    let mut container = QueryContainer::new();
    let (input, stream) = container
        .register_partitioned_input("readings", |r: &Reading| r.0, DisorderPolicy::throw(), 10)
        .unwrap();
    let output = container
        .register_output(stream.aggregate(Sum::new(|r: &Reading| r.1)))
        .unwrap();
    let mut process = container.start();

    process.push(&input, StreamEvent::point(5, (0, 1))).unwrap();
    let err = process.push(&input, StreamEvent::point(3, (0, 1))).unwrap_err();
    assert!(matches!(err, EngineError::OutOfOrder { sync_time: 3, watermark: 5, .. }));
    assert!(process.drain(&output).is_ok());
}

#[test]
fn partitioned_input_lag_bounds_cross_key_disorder() {
    let mut container = QueryContainer::new();
    let (input, stream) = container
        .register_partitioned_input("readings", |r: &Reading| r.0, DisorderPolicy::drop(), 10)
        .unwrap();
    let output = container
        .register_output(stream.aggregate(Count::new()))
        .unwrap();
    let mut process = container.start();

    process.push(&input, StreamEvent::point(50, (0, 1))).unwrap();
    process.push(&input, StreamEvent::point(45, (1, 1))).unwrap();
    process.push(&input, StreamEvent::point(30, (2, 1))).unwrap();
    process.complete(&input).unwrap();

    let stats = process.input_stats(&input).unwrap();
    assert_eq!(stats.admitted, 2);
    assert_eq!(stats.dropped, 1);
    let keys: Vec<u8> = payloads(&process.drain(&output).unwrap())
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    assert!(keys.contains(&0) && keys.contains(&1) && !keys.contains(&2));
}

#[test]
fn group_apply_sums_per_key_on_ordered_input() {
    let mut container = QueryContainer::new();
    let (input, stream) = container
        .register_input::<Reading>("readings", DisorderPolicy::throw(), PunctuationPolicy::None)
        .unwrap();
    let sums = stream.group_apply(
        |r: &Reading| r.0,
        |s| {
            s.tumbling_window_lifetime(10, 0)
                .unwrap()
                .aggregate(Sum::new(|r: &Reading| r.1))
        },
        |key: &u8, sum: i64| (*key, sum),
    );
    let output = container.register_output(sums).unwrap();
    let mut process = container.start();

    for (t, r) in [(1, (0, 5)), (2, (1, 1)), (4, (0, 6)), (12, (1, 2)), (15, (0, 3))] {
        process.push(&input, StreamEvent::point(t, r)).unwrap();
    }
    process.complete(&input).unwrap();

    let mut windows: Vec<_> = process
        .drain(&output)
        .unwrap()
        .into_iter()
        .filter(|e| e.is_data())
        .map(|e| (e.sync_time, e.other_time, e.payload.unwrap_or_default()))
        .collect();
    windows.sort();
    assert_eq!(
        windows,
        vec![(0, 10, (0, 11)), (0, 10, (1, 1)), (10, 20, (0, 3)), (10, 20, (1, 2))]
    );
}
