//! Instrumenting selected phases of a program and reporting each one separately.
//!
//! Three phases allocate vectors whose lengths follow a bell curve around 100, 200 and 300
//! elements. Each phase is reported under its own label. A fourth phase runs without
//! instrumentation and therefore shows up in no report.
//!
//! Run with: `cargo run --example memstats_phases`.
//! Try `MEMSTATS_HISTOGRAM_REPRESENTATION=number` or `MEMSTATS_BINS=30` to change the output.

use std::hint::black_box;

use memstats::Allocator;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[global_allocator]
static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();

const VECTORS_PER_PHASE: usize = 10_000;

fn main() {
    let mut rng = StdRng::seed_from_u64(0x5eed);

    // Every thread is recorded only if it is instrumented itself; this demo uses one thread.
    memstats::enable_thread_instrumentation();

    for phase in 1..=3_u32 {
        // Only instrument a part of the code.
        memstats::enable_instrumentation();
        allocate_vectors(&mut rng, f64::from(phase) * 100.0, 50.0);
        memstats::disable_instrumentation();

        memstats::report(&format!("report {phase}"));
    }

    // This part is not instrumented.
    allocate_vectors(&mut rng, 200.0, 65.0);
}

fn allocate_vectors(rng: &mut StdRng, mean: f64, std_dev: f64) {
    for _ in 0..VECTORS_PER_PHASE {
        let len = approximately_normal(rng, mean, std_dev).abs();

        #[expect(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            reason = "the length is non-negative and far below usize::MAX; truncation is intended"
        )]
        let data = vec![0.0_f64; len as usize];

        black_box(data);
    }
}

/// Sum of twelve uniform samples, shifted and scaled: close enough to a normal distribution
/// to give the histograms their bell shape.
fn approximately_normal(rng: &mut StdRng, mean: f64, std_dev: f64) -> f64 {
    let sum: f64 = (0..12).map(|_| rng.random::<f64>()).sum();
    mean + std_dev * (sum - 6.0)
}
