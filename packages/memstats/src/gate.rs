//! Decides whether an allocation is recorded.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{self, AtomicBool};

thread_local! {
    // `None` until the thread is first observed, at which point the configured default is
    // applied. Const-initialized without a destructor, so it stays accessible from the global
    // allocator for the entire life of the thread.
    static THREAD_ENABLED: Cell<Option<bool>> = const { Cell::new(None) };
}

/// The combination of the process-wide and the per-thread instrumentation flags.
///
/// An allocation is recorded only if both flags are set. The per-thread flag is exclusively
/// owned by its thread and needs no synchronization.
#[derive(Debug)]
pub(crate) struct Gate {
    global: AtomicBool,

    // Value assigned to a thread's flag the first time the thread is observed.
    thread_default: AtomicBool,
}

impl Gate {
    pub(crate) const fn new() -> Self {
        Self {
            global: AtomicBool::new(false),
            thread_default: AtomicBool::new(false),
        }
    }

    /// Sets the value a thread's flag starts out with.
    ///
    /// Only meaningful before threads are observed, i.e. during initialization.
    pub(crate) fn set_thread_default(&self, enabled: bool) {
        self.thread_default
            .store(enabled, atomic::Ordering::Relaxed);
    }

    /// Sets the process-wide flag, returning its previous value.
    pub(crate) fn set_global(&self, enabled: bool) -> bool {
        self.global.swap(enabled, atomic::Ordering::AcqRel)
    }

    pub(crate) fn is_global_enabled(&self) -> bool {
        self.global.load(atomic::Ordering::Acquire)
    }

    /// Sets the flag of the current thread, returning its previous value.
    ///
    /// Returns `false` without effect if the thread is already tearing down its
    /// thread-local storage.
    pub(crate) fn set_current_thread(&self, enabled: bool) -> bool {
        THREAD_ENABLED
            .try_with(|cell| {
                let previous = self.resolve(cell);
                cell.set(Some(enabled));
                previous
            })
            .unwrap_or(false)
    }

    pub(crate) fn is_current_thread_enabled(&self) -> bool {
        THREAD_ENABLED
            .try_with(|cell| self.resolve(cell))
            .unwrap_or(false)
    }

    /// Whether an allocation on the current thread is to be recorded right now.
    #[inline]
    pub(crate) fn should_record(&self) -> bool {
        // The global flag is checked first: it is off most of the time, which keeps the
        // thread-local lookup off the hot path.
        self.is_global_enabled() && self.is_current_thread_enabled()
    }

    /// Disables the current thread's flag until the returned guard is dropped.
    pub(crate) fn suppress_current_thread(&self) -> Suppressed<'_> {
        Suppressed {
            gate: self,
            previous: self.set_current_thread(false),
        }
    }

    fn resolve(&self, cell: &Cell<Option<bool>>) -> bool {
        if let Some(enabled) = cell.get() {
            return enabled;
        }

        let enabled = self.thread_default.load(atomic::Ordering::Relaxed);
        cell.set(Some(enabled));
        enabled
    }
}

/// Keeps our own work (aggregating, rendering, printing) out of the event log.
#[derive(Debug)]
pub(crate) struct Suppressed<'a> {
    gate: &'a Gate,
    previous: bool,
}

impl Drop for Suppressed<'_> {
    fn drop(&mut self) {
        self.gate.set_current_thread(self.previous);
    }
}

/// Sets the instrumentation flag of the current thread for as long as the guard lives,
/// restoring the previous value when dropped.
///
/// The process-wide flag must also be enabled for anything to be recorded.
///
/// # Examples
///
/// ```
/// use memstats::{Allocator, ThreadInstrumentation};
///
/// #[global_allocator]
/// static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();
///
/// memstats::enable_instrumentation();
/// {
///     let _instrumented = ThreadInstrumentation::enabled();
///     let data = vec![1_u8; 128]; // Recorded.
///     std::hint::black_box(data);
/// }
/// let data = vec![1_u8; 128]; // Not recorded, unless the thread was enabled before.
/// std::hint::black_box(data);
///
/// memstats::disable_instrumentation();
/// memstats::report("example");
/// ```
#[derive(Debug)]
#[must_use = "the previous state is restored when the guard is dropped"]
pub struct ThreadInstrumentation {
    previous: bool,

    // The guard modifies thread-local state, so it must be dropped on the same thread.
    _single_threaded: PhantomData<*const ()>,
}

impl ThreadInstrumentation {
    /// Enables instrumentation of the current thread until the guard is dropped.
    pub fn enabled() -> Self {
        Self::set(true)
    }

    /// Disables instrumentation of the current thread until the guard is dropped.
    pub fn disabled() -> Self {
        Self::set(false)
    }

    fn set(enabled: bool) -> Self {
        let previous = crate::lifecycle::context()
            .gate()
            .set_current_thread(enabled);

        Self {
            previous,
            _single_threaded: PhantomData,
        }
    }

    /// Whether the current thread was instrumented when the guard was created.
    #[must_use]
    pub fn previous(&self) -> bool {
        self.previous
    }
}

impl Drop for ThreadInstrumentation {
    fn drop(&mut self) {
        crate::lifecycle::context()
            .gate()
            .set_current_thread(self.previous);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::thread;

    use super::*;

    static_assertions::assert_impl_all!(Gate: Send, Sync);
    static_assertions::assert_not_impl_any!(ThreadInstrumentation: Send, Sync);

    // Every test runs its assertions on a fresh thread so that the thread-local flag
    // starts out unobserved, regardless of how the test harness schedules tests.
    fn on_fresh_thread<R: Send + 'static>(f: impl FnOnce() -> R + Send + 'static) -> R {
        thread::spawn(f).join().unwrap()
    }

    #[test]
    fn new_gate_records_nothing() {
        on_fresh_thread(|| {
            let gate = Gate::new();

            assert!(!gate.is_global_enabled());
            assert!(!gate.is_current_thread_enabled());
            assert!(!gate.should_record());
        });
    }

    #[test]
    fn records_only_when_both_flags_set() {
        on_fresh_thread(|| {
            let gate = Gate::new();

            for (global, thread) in [(false, false), (false, true), (true, false), (true, true)] {
                gate.set_global(global);
                gate.set_current_thread(thread);

                assert_eq!(gate.should_record(), global && thread);
            }
        });
    }

    #[test]
    fn setters_return_previous_value() {
        on_fresh_thread(|| {
            let gate = Gate::new();

            assert!(!gate.set_global(true));
            assert!(gate.set_global(true));
            assert!(gate.set_global(false));

            assert!(!gate.set_current_thread(true));
            assert!(gate.set_current_thread(false));
            assert!(!gate.set_current_thread(false));
        });
    }

    #[test]
    fn thread_default_applies_on_first_observation() {
        let gate = std::sync::Arc::new(Gate::new());
        gate.set_thread_default(true);

        let observed = on_fresh_thread({
            let gate = std::sync::Arc::clone(&gate);
            move || gate.is_current_thread_enabled()
        });
        assert!(observed);

        let previous = on_fresh_thread({
            let gate = std::sync::Arc::clone(&gate);
            move || gate.set_current_thread(false)
        });
        assert!(previous);
    }

    #[test]
    fn suppression_restores_previous_flag() {
        on_fresh_thread(|| {
            let gate = Gate::new();
            gate.set_global(true);
            gate.set_current_thread(true);

            {
                let _suppressed = gate.suppress_current_thread();
                assert!(!gate.should_record());
            }

            assert!(gate.should_record());
        });
    }

    #[test]
    fn thread_flag_does_not_leak_to_other_threads() {
        on_fresh_thread(|| {
            let gate = std::sync::Arc::new(Gate::new());
            gate.set_global(true);
            gate.set_current_thread(true);

            let other = {
                let gate = std::sync::Arc::clone(&gate);
                thread::spawn(move || gate.should_record()).join().unwrap()
            };

            assert!(gate.should_record());
            assert!(!other);
        });
    }
}
