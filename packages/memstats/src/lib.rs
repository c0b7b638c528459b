//! Process-wide heap allocation statistics.
//!
//! This package intercepts every allocation of the process through a [`global_allocator`]
//! wrapper and, while instrumentation is enabled, records the size, thread and (optionally)
//! call stack of each one. Recorded events are aggregated on demand into reports that show,
//! per thread and per call site, how many allocations were made, how large they were and how
//! their sizes were distributed.
//!
//! The core functionality includes:
//! - [`Allocator`] - The global allocator wrapper that observes allocations
//! - [`report()`] - Drains the recorded events and prints them as a labeled report
//! - [`enable_instrumentation()`] / [`disable_instrumentation()`] - The process-wide switch
//! - [`enable_thread_instrumentation()`] / [`disable_thread_instrumentation()`] - The
//!   per-thread switch; an allocation is recorded only if both switches are on
//! - [`Report`] - The aggregated statistics, for programmatic inspection
//!
//! This package is a development tool. Recording an event takes a lock and, with stack capture
//! enabled, walks the stack, which is far more expensive than the allocation itself.
//!
//! # Simple usage
//!
//! ```
//! use memstats::Allocator;
//!
//! #[global_allocator]
//! static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();
//!
//! fn main() {
//!     memstats::enable_instrumentation();
//!     memstats::enable_thread_instrumentation();
//!
//!     let numbers: Vec<u64> = (0..1000).collect();
//!     std::hint::black_box(numbers);
//!
//!     memstats::disable_thread_instrumentation();
//!     memstats::disable_instrumentation();
//!
//!     // Prints the statistics of everything recorded above.
//!     memstats::report("collect numbers");
//! }
//! ```
//!
//! # Output
//!
//! Each report starts with a header naming its label, followed by one line per non-empty
//! bucket:
//!
//! ```text
//! ------------------- MemStats collect numbers -------------------
//! [              █]7kB    |    7kB(1    ) | Total
//! [              █]7kB    |    7kB(1    ) | Thread 1
//! ```
//!
//! The bracketed histogram distributes the bucket's allocations over equally wide size ranges
//! from 1 byte to the largest allocation; the glyph of each range shows its count relative to
//! the fullest range. It is followed by the largest allocation, the accumulated size and the
//! number of allocations. With the `stacktrace` feature, buckets per call stack and per stack
//! frame follow the per-thread buckets.
//!
//! After the last report, when the process exits, a legend explaining the columns and glyphs
//! is printed.
//!
//! # Configuration
//!
//! The behavior is configured via environment variables, read once when the process first
//! allocates. See [`Config`] for the list.
//!
//! With the default configuration nothing is recorded until the program enables
//! instrumentation, and a report labeled `default` with everything recorded since the last
//! report is printed at exit.
//!
//! # Miri compatibility
//!
//! Miri replaces the global allocator with its own logic, so you cannot execute code that uses
//! this package under Miri.
//!
//! [`global_allocator`]: https://doc.rust-lang.org/std/alloc/index.html#the-global_allocator-attribute

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

mod allocator;
mod bookkeeping;
mod config;
mod error;
mod event;
mod event_log;
mod format;
mod gate;
mod lifecycle;
mod palette;
mod report;
mod stats;

pub use allocator::Allocator;
pub use config::Config;
pub use error::Error;
pub(crate) use error::Result;
pub use event::{AllocationEvent, MAX_STACK_DEPTH, StackSnapshot, ThreadKey};
pub use gate::ThreadInstrumentation;
pub use palette::Palette;
pub use report::Report;
pub use stats::{Histogram, StatBucket};

/// Drains all events recorded since the previous report and prints them to stdout under
/// `label`.
///
/// Prints nothing if no event was recorded. Concurrent calls are serialized, each printing a
/// complete report. Allocations made by the calling thread while the report is produced are
/// never recorded.
///
/// If a quantity in the report is too large to render, a diagnostic is printed to stderr
/// instead and the drained events are discarded.
pub fn report(label: &str) {
    lifecycle::context().report(label);
}

/// Enables recording process-wide. Threads record only if their own instrumentation is
/// enabled too.
///
/// Returns whether process-wide instrumentation was enabled before the call.
#[allow(
    clippy::must_use_candidate,
    reason = "the previous state is only needed to restore it later"
)]
pub fn enable_instrumentation() -> bool {
    lifecycle::context().gate().set_global(true)
}

/// Disables recording process-wide, regardless of the per-thread setting.
///
/// Returns whether process-wide instrumentation was enabled before the call.
#[allow(
    clippy::must_use_candidate,
    reason = "the previous state is only needed to restore it later"
)]
pub fn disable_instrumentation() -> bool {
    lifecycle::context().gate().set_global(false)
}

/// Enables recording for the calling thread, as long as process-wide instrumentation is
/// enabled.
///
/// Returns whether the calling thread was instrumented before the call. See
/// [`ThreadInstrumentation`] for a guard that restores the previous setting.
#[allow(
    clippy::must_use_candidate,
    reason = "the previous state is only needed to restore it later"
)]
pub fn enable_thread_instrumentation() -> bool {
    lifecycle::context().gate().set_current_thread(true)
}

/// Disables recording for the calling thread.
///
/// Returns whether the calling thread was instrumented before the call.
#[allow(
    clippy::must_use_candidate,
    reason = "the previous state is only needed to restore it later"
)]
pub fn disable_thread_instrumentation() -> bool {
    lifecycle::context().gate().set_current_thread(false)
}

/// Whether process-wide instrumentation is currently enabled.
#[must_use]
pub fn is_instrumentation_enabled() -> bool {
    lifecycle::context().gate().is_global_enabled()
}

/// Whether instrumentation is currently enabled for the calling thread.
#[must_use]
pub fn is_thread_instrumentation_enabled() -> bool {
    lifecycle::context().gate().is_current_thread_enabled()
}
