//! Instrumenting worker threads individually.
//!
//! Three threads allocate vectors of different typical lengths. Instrumentation is enabled
//! process-wide from the start but only the worker threads opt in, so the final report printed
//! at process exit contains one bucket per worker.
//!
//! Run with: `cargo run --example memstats_threads`.

use std::hint::black_box;
use std::thread;

use memstats::Allocator;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[global_allocator]
static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();

const VECTORS_PER_THREAD: usize = 10_000;

fn main() {
    memstats::enable_instrumentation();

    let workers: Vec<_> = (1..=3_u32)
        .map(|worker| thread::spawn(move || allocate_on_worker(worker)))
        .collect();

    for worker in workers {
        worker.join().expect("worker threads do not panic");
    }

    // The report is printed at exit, labeled "default".
}

fn allocate_on_worker(worker: u32) {
    let mut rng = StdRng::seed_from_u64(u64::from(worker));
    let mean = f64::from(worker) * 100.0;

    // Instrument a part of the code.
    memstats::enable_thread_instrumentation();

    for _ in 0..VECTORS_PER_THREAD {
        let sum: f64 = (0..12).map(|_| rng.random::<f64>()).sum();
        let len = (mean + 50.0 * (sum - 6.0)).abs();

        #[expect(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            reason = "the length is non-negative and far below usize::MAX; truncation is intended"
        )]
        let data = vec![0_u64; len as usize];

        black_box(data);
    }

    memstats::disable_thread_instrumentation();
}
