//! Benchmarks to measure the overhead the instrumented allocator adds to each allocation.
//!
//! Each iteration allocates and frees one small vector. With instrumentation off, only the
//! gate check is added; with instrumentation on, two events are recorded per iteration.

#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;
use std::time::{Duration, Instant};

use criterion::{Criterion, criterion_group, criterion_main};
use memstats::{Allocator, Report, ThreadInstrumentation};

#[global_allocator]
static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();

// The event log grows with every recorded iteration; it is drained (outside the measured
// time) after this many iterations.
const ITERATIONS_PER_DRAIN: u64 = 100_000;

criterion_group!(benches, entrypoint);
criterion_main!(benches);

fn allocate_small() {
    let data: Vec<u8> = Vec::with_capacity(64);
    black_box(data);
}

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("memstats_interceptor");

    memstats::disable_instrumentation();

    group.bench_function("instrumentation_off", |b| {
        b.iter(allocate_small);
    });

    group.bench_function("thread_off", |b| {
        memstats::enable_instrumentation();
        let _thread = ThreadInstrumentation::disabled();

        b.iter(allocate_small);

        memstats::disable_instrumentation();
    });

    group.bench_function("recording", |b| {
        b.iter_custom(|iters| {
            let mut elapsed = Duration::ZERO;
            let mut remaining = iters;

            while remaining > 0 {
                let batch = remaining.min(ITERATIONS_PER_DRAIN);

                {
                    memstats::enable_instrumentation();
                    let _thread = ThreadInstrumentation::enabled();

                    let start = Instant::now();
                    for _ in 0..batch {
                        allocate_small();
                    }
                    elapsed += start.elapsed();

                    memstats::disable_instrumentation();
                }

                drop(Report::collect("bench"));
                remaining -= batch;
            }

            elapsed
        });
    });

    group.finish();
}
