//! Benchmarks for automaton-based pattern detection
//!
//! Run with: cargo bench -p tempora-runtime --bench afa_benchmark
//!
//! Benchmark groups:
//! - afa_sequence: A -> B* -> C over streams of growing length
//! - afa_pruning: Kleene-heavy input with and without SubsumeOlder pruning
//! - afa_partitioned: the same pattern run per key through group-apply

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use tempora_core::StreamEvent;
use tempora_runtime::afa::{AfaMatcher, CompiledAfa, PruningPolicy};
use tempora_runtime::engine::QueryContainer;
use tempora_runtime::ingress::{DisorderPolicy, PunctuationPolicy};
use tempora_runtime::operator::Operator;
use tempora_runtime::pattern::Regex;

type Tick = (u32, char, i64);

// =============================================================================
// Event generators
// =============================================================================

/// `A B...B C` runs with `b_per_run` Bs each
fn generate_sequence_events(count: usize, b_per_run: usize) -> Vec<StreamEvent<Tick>> {
    (0..count)
        .map(|i| {
            let position = i % (b_per_run + 2);
            let tag = if position == 0 {
                'A'
            } else if position == b_per_run + 1 {
                'C'
            } else {
                'B'
            };
            StreamEvent::point(i as i64, ((i % 16) as u32, tag, i as i64))
        })
        .collect()
}

// =============================================================================
// Patterns
// =============================================================================

fn tagged(tag: char) -> Regex<Tick, i64> {
    Regex::single(move |e: &Tick| e.1 == tag)
}

fn sequence_afa(pruning: PruningPolicy) -> Arc<CompiledAfa<Tick, i64>> {
    tagged('A')
        .concat(
            Regex::single_with(|_, e: &Tick, _| e.1 == 'B', |_, e: &Tick, sum: &i64| sum + e.2).kleene_star(),
        )
        .concat(tagged('C'))
        .compile(0)
        .with_pruning(pruning)
        .compile()
        .expect("pattern has an accepting path")
}

fn any_then_c(pruning: PruningPolicy) -> Arc<CompiledAfa<Tick, i64>> {
    Regex::<Tick, i64>::any()
        .kleene_star()
        .concat(tagged('C'))
        .compile(0)
        .with_pruning(pruning)
        .compile()
        .expect("pattern has an accepting path")
}

// =============================================================================
// Benchmarks
// =============================================================================

fn bench_sequence(c: &mut Criterion) {
    let mut group = c.benchmark_group("afa_sequence");
    let afa = sequence_afa(PruningPolicy::None);

    for count in [1_000usize, 10_000, 50_000] {
        let events = generate_sequence_events(count, 5);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &events, |b, events| {
            b.iter(|| {
                let mut matcher = AfaMatcher::registers(Arc::clone(&afa));
                let mut out = Vec::new();
                for e in events {
                    matcher.on_event(e.clone(), &mut out).unwrap();
                }
                black_box(out.len())
            });
        });
    }
    group.finish();
}

fn bench_pruning(c: &mut Criterion) {
    let mut group = c.benchmark_group("afa_pruning");
    let events = generate_sequence_events(2_000, 50);
    group.throughput(Throughput::Elements(events.len() as u64));

    for (name, policy) in [("none", PruningPolicy::None), ("subsume_older", PruningPolicy::SubsumeOlder)] {
        let afa = any_then_c(policy);
        group.bench_function(name, |b| {
            b.iter(|| {
                let mut matcher = AfaMatcher::registers(Arc::clone(&afa));
                let mut out = Vec::new();
                for e in &events {
                    matcher.on_event(e.clone(), &mut out).unwrap();
                }
                black_box(out.len())
            });
        });
    }
    group.finish();
}

fn bench_partitioned(c: &mut Criterion) {
    let mut group = c.benchmark_group("afa_partitioned");
    let events = generate_sequence_events(20_000, 5);
    group.throughput(Throughput::Elements(events.len() as u64));
    let afa = sequence_afa(PruningPolicy::SubsumeOlder);

    group.bench_function("group_apply_16_keys", |b| {
        b.iter(|| {
            let mut container = QueryContainer::new();
            let (input, stream) = container
                .register_input::<Tick>("ticks", DisorderPolicy::throw(), PunctuationPolicy::None)
                .unwrap();
            let matches = stream.partition_by(|e: &Tick| e.0, 0).detect(Arc::clone(&afa));
            let output = container.register_output(matches).unwrap();
            let mut process = container.start();
            process.push_all(&input, events.iter().cloned()).unwrap();
            process.complete(&input).unwrap();
            black_box(process.drain(&output).unwrap().len())
        });
    });
    group.finish();
}

criterion_group!(benches, bench_sequence, bench_pruning, bench_partitioned);
criterion_main!(benches);
