//! Unit tests for query containers and processes

use super::*;
use crate::aggregation::Count;
use crate::config::IngressConfig;
use crate::ingress::DisorderMode;
use tempora_core::INFINITY;

fn filtered_query() -> (QueryContainer, InputHandle<i64>, OutputHandle<i64>) {
    let mut container = QueryContainer::new();
    let (input, stream) = container
        .register_input::<i64>("numbers", DisorderPolicy::throw(), PunctuationPolicy::None)
        .unwrap();
    let output = container.register_output(stream.filter(|v| *v > 1)).unwrap();
    (container, input, output)
}

fn counting_query() -> (QueryContainer, InputHandle<i64>, OutputHandle<u64>) {
    let mut container = QueryContainer::new();
    let (input, stream) = container
        .register_input::<i64>("numbers", DisorderPolicy::throw(), PunctuationPolicy::None)
        .unwrap();
    let output = container.register_output(stream.aggregate(Count::new())).unwrap();
    (container, input, output)
}

#[test]
fn test_push_and_drain() {
    let (container, input, output) = filtered_query();
    let mut process = container.start();
    process.push(&input, StreamEvent::point(1, 1)).unwrap();
    process.push(&input, StreamEvent::point(2, 2)).unwrap();

    assert_eq!(process.drain(&output).unwrap(), vec![StreamEvent::point(2, 2)]);
    assert!(process.drain(&output).unwrap().is_empty());
}

#[test]
fn test_complete_ends_stream() {
    let (container, input, output) = filtered_query();
    let mut process = container.start();
    process.push(&input, StreamEvent::point(1, 5)).unwrap();
    process.complete(&input).unwrap();

    assert_eq!(
        process.drain(&output).unwrap(),
        vec![StreamEvent::point(1, 5), StreamEvent::punctuation(INFINITY)]
    );
    let err = process.push(&input, StreamEvent::point(2, 5)).unwrap_err();
    assert!(matches!(err, EngineError::InputCompleted { .. }));
}

#[test]
fn test_duplicate_input_name() {
    let mut container = QueryContainer::new();
    container
        .register_input::<i64>("a", DisorderPolicy::drop(), PunctuationPolicy::None)
        .unwrap();
    let err = container
        .register_input::<String>("a", DisorderPolicy::drop(), PunctuationPolicy::None)
        .err().unwrap();
    assert!(matches!(err, QueryError::DuplicateInput(name) if name == "a"));
}

#[test]
fn test_detached_and_foreign_streams_rejected() {
    let mut container = QueryContainer::new();
    let err = container
        .register_output(Streamable::<i64, i64>::detached())
        .unwrap_err();
    assert!(matches!(err, QueryError::Detached));

    let mut other = QueryContainer::new();
    let (_, stream) = other
        .register_input::<i64>("x", DisorderPolicy::drop(), PunctuationPolicy::None)
        .unwrap();
    let err = container.register_output(stream).unwrap_err();
    assert!(matches!(err, QueryError::ForeignStream));
}

#[test]
fn test_handle_from_other_process_is_unknown() {
    let (first, input, _) = filtered_query();
    let (second, _, output) = filtered_query();
    let _first = first.start();
    let mut second = second.start();

    let err = second.push(&input, StreamEvent::point(1, 1)).unwrap_err();
    assert!(matches!(err, EngineError::UnknownHandle));
    assert!(second.drain(&output).is_ok());
}

#[test]
fn test_dispose_rules() {
    let (container, input, output) = filtered_query();
    let mut process = container.start();
    process.push(&input, StreamEvent::point(1, 9)).unwrap();

    let err = process.dispose().unwrap_err();
    assert!(matches!(err, EngineError::UndrainedOutput { output: 0, pending: 1 }));

    process.drain(&output).unwrap();
    process.dispose().unwrap();
    assert!(matches!(process.dispose(), Err(EngineError::AlreadyDisposed)));
    assert!(matches!(
        process.push(&input, StreamEvent::point(2, 9)),
        Err(EngineError::Disposed)
    ));
}

#[test]
fn test_configured_input_uses_defaults() {
    let config = EngineConfig {
        ingress: IngressConfig {
            disorder: DisorderMode::Drop,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut container = QueryContainer::with_config(config);
    let (input, stream) = container.register_configured_input::<i64>("late").unwrap();
    let output = container.register_output(stream).unwrap();
    let mut process = container.start();

    process.push(&input, StreamEvent::point(10, 1)).unwrap();
    process.push(&input, StreamEvent::point(5, 2)).unwrap();

    let stats = process.input_stats(&input).unwrap();
    assert_eq!(stats.admitted, 1);
    assert_eq!(stats.dropped, 1);
    assert_eq!(process.drain(&output).unwrap(), vec![StreamEvent::point(10, 1)]);
}

#[test]
fn test_checkpoint_resume_matches_uninterrupted_run() {
    let (container, input, output) = counting_query();
    let mut original = container.start();
    original
        .push_all(
            &input,
            vec![
                StreamEvent::interval(0, 10, 1),
                StreamEvent::interval(2, 10, 2),
                StreamEvent::punctuation(5),
            ],
        )
        .unwrap();
    original.drain(&output).unwrap();

    let mut blob = Vec::new();
    original.checkpoint(&mut blob).unwrap();

    let (container, resumed_input, resumed_output) = counting_query();
    let mut resumed = container.restore(Some(blob.as_slice())).unwrap();

    original.push(&input, StreamEvent::punctuation(20)).unwrap();
    resumed.push(&resumed_input, StreamEvent::punctuation(20)).unwrap();

    let expected = original.drain(&output).unwrap();
    assert!(!expected.is_empty());
    assert_eq!(resumed.drain(&resumed_output).unwrap(), expected);
}

#[test]
fn test_restore_none_starts_fresh() {
    let (container, input, output) = filtered_query();
    let mut process = container.restore(None::<&[u8]>).unwrap();
    process.push(&input, StreamEvent::point(1, 3)).unwrap();
    assert_eq!(process.drain(&output).unwrap().len(), 1);
}

#[test]
fn test_restore_into_different_shape_is_recoverable() {
    let (container, _, _) = filtered_query();
    let process = container.start();
    let mut blob = Vec::new();
    process.checkpoint(&mut blob).unwrap();

    let (mut container, _, _) = filtered_query();
    container
        .register_input::<i64>("extra", DisorderPolicy::drop(), PunctuationPolicy::None)
        .unwrap();
    let err = container.restore(Some(blob.as_slice())).err().unwrap();
    assert!(matches!(err, CheckpointError::ShapeMismatch(_)));
    assert!(err.is_recoverable());
}

#[test]
fn test_coalesce_edges() {
    let events = vec![
        StreamEvent::start(1, 'a'),
        StreamEvent::punctuation(2),
        StreamEvent::point(3, 'p'),
        StreamEvent::start(3, 'b'),
        StreamEvent::end(5, 1, 'a'),
        StreamEvent::end(6, 4, 'z'),
    ];
    assert_eq!(
        coalesce_edges(events),
        vec![
            StreamEvent::interval(1, 5, 'a'),
            StreamEvent::point(3, 'p'),
            StreamEvent::start(3, 'b'),
            StreamEvent::end(6, 4, 'z'),
        ]
    );
}

#[test]
fn test_multicast_needs_a_copy() {
    let mut container = QueryContainer::new();
    let (_, stream) = container
        .register_input::<i64>("numbers", DisorderPolicy::throw(), PunctuationPolicy::None)
        .unwrap();
    let err = container.multicast(stream, 0).err().unwrap();
    assert!(matches!(err, QueryError::NonPositive { param: "copies", .. }));
}

#[test]
fn test_union_rejects_foreign_stream() {
    let mut other = QueryContainer::new();
    let (_, foreign) = other
        .register_input::<i64>("numbers", DisorderPolicy::throw(), PunctuationPolicy::None)
        .unwrap();
    let mut container = QueryContainer::new();
    let (_, local) = container
        .register_input::<i64>("numbers", DisorderPolicy::throw(), PunctuationPolicy::None)
        .unwrap();
    let err = container.union(local, foreign).err().unwrap();
    assert!(matches!(err, QueryError::ForeignStream));

    // Nothing was attached on the rejected attempt.
    let process = container.start();
    let mut blob = Vec::new();
    process.checkpoint(&mut blob).unwrap();
    let checkpoint: QueryCheckpoint = codec::decode(&blob).unwrap();
    assert!(checkpoint.inputs[0].pipelines.is_empty());
    assert!(checkpoint.nodes.is_empty());
}

#[test]
fn test_dispose_sees_undrained_node_output() {
    let mut container = QueryContainer::new();
    let (input, stream) = container
        .register_input::<i64>("numbers", DisorderPolicy::throw(), PunctuationPolicy::None)
        .unwrap();
    let mut copies = container.multicast(stream, 2).unwrap().into_iter();
    let first = container.register_output(copies.next().unwrap()).unwrap();
    let second = container.register_output(copies.next().unwrap()).unwrap();

    let mut process = container.start();
    process.push(&input, StreamEvent::point(1, 4)).unwrap();
    assert_eq!(process.drain(&first).unwrap(), vec![StreamEvent::point(1, 4)]);
    let err = process.dispose().unwrap_err();
    assert!(matches!(err, EngineError::UndrainedOutput { output: 1, pending: 1 }));
    assert_eq!(process.drain(&second).unwrap().len(), 1);
    process.dispose().unwrap();
}
