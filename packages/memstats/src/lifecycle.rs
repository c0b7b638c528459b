//! Process-wide instrumentation state: one-time initialization, report serialization and the
//! final report at process exit.

use std::cell::Cell;
use std::io::{self, Write};
use std::sync::atomic::{self, AtomicBool, AtomicU8};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::{hint, thread};

use crate::error::write_diagnostic;
use crate::event_log::EventLog;
use crate::gate::Gate;
use crate::report::write_legend;
use crate::{AllocationEvent, Config, Report};

/// Label of the report printed when the process exits.
pub(crate) const EXIT_REPORT_LABEL: &str = "default";

const UNINIT: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;

static CONTEXT: Context = Context::new();

thread_local! {
    // Set while the current thread is recording an event. Anything allocated in that window
    // (e.g. by the stack walker) is forwarded without being recorded.
    static RECORDING: Cell<bool> = const { Cell::new(false) };
}

/// Everything the interceptor and the public API share.
///
/// Built entirely in a `const` context so that it exists before the first allocation. The
/// parts that depend on the environment are filled in by the first allocation or API call,
/// whichever comes first.
#[derive(Debug)]
pub(crate) struct Context {
    state: AtomicU8,
    config: OnceLock<Config>,
    gate: Gate,
    log: EventLog,

    // Serializes report collection, so concurrent reports never interleave their output.
    report_lock: Mutex<()>,

    // Set once any report has been printed. The legend is printed at exit if so.
    legend_requested: AtomicBool,

    shut_down: AtomicBool,
}

/// Returns the process-wide context, initializing it first if necessary.
///
/// Blocks while another thread is initializing it. Never call this from the allocation path;
/// see [`record()`] instead.
pub(crate) fn context() -> &'static Context {
    CONTEXT.ensure_ready();
    &CONTEXT
}

/// Records an allocation (or a deallocation, if `size` is zero) performed by the current
/// thread, if instrumentation is enabled for it.
///
/// Called by the interceptor after the wrapped allocator has succeeded. Stack capture starts
/// below the frame of this function and the interceptor method that called it.
#[inline(never)]
pub(crate) fn record(size: usize) {
    CONTEXT.record(size);

    // Not a tail call, so this frame is on the stack during the capture.
    hint::black_box(size);
}

extern "C" fn on_process_exit() {
    CONTEXT.shutdown();
}

impl Context {
    const fn new() -> Self {
        Self {
            state: AtomicU8::new(UNINIT),
            config: OnceLock::new(),
            gate: Gate::new(),
            log: EventLog::new(),
            report_lock: Mutex::new(()),
            legend_requested: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        }
    }

    pub(crate) fn config(&self) -> &Config {
        self.config.get_or_init(Config::from_env)
    }

    pub(crate) fn gate(&self) -> &Gate {
        &self.gate
    }

    /// Initializes the context if nobody has started doing so yet.
    ///
    /// Returns `true` once the context is ready. Returns `false` without waiting while
    /// initialization is in progress, which includes allocations made by the initializing
    /// thread itself.
    #[inline]
    fn try_ready(&self) -> bool {
        match self.state.load(atomic::Ordering::Acquire) {
            READY => true,
            UNINIT => self.try_initialize(),
            _ => false,
        }
    }

    /// Waits until the context is ready, initializing it if nobody has started doing so.
    fn ensure_ready(&self) {
        while !self.try_ready() {
            thread::yield_now();
        }
    }

    fn try_initialize(&self) -> bool {
        if self
            .state
            .compare_exchange(
                UNINIT,
                INITIALIZING,
                atomic::Ordering::AcqRel,
                atomic::Ordering::Acquire,
            )
            .is_err()
        {
            return self.state.load(atomic::Ordering::Acquire) == READY;
        }

        let config = *self.config();

        self.gate
            .set_thread_default(config.thread_instrumentation_init());

        // SAFETY: `on_process_exit` is an `extern "C"` function without arguments that does
        // not unwind, which is all `atexit()` requires.
        if unsafe { libc::atexit(on_process_exit) } != 0 {
            write_diagnostic(
                &mut io::stderr(),
                &"memstats: cannot register the exit hook, no report will be printed at exit",
            );
        }

        self.gate.set_global(config.enable_instrumentation());

        self.state.store(READY, atomic::Ordering::Release);
        true
    }

    #[inline]
    fn record(&self, size: usize) {
        if !self.try_ready() || !self.gate.should_record() {
            return;
        }

        // Thread-local storage may already be gone; we cannot guard against reentrancy then,
        // so we do not record.
        _ = RECORDING.try_with(|recording| {
            if recording.replace(true) {
                return;
            }

            self.log.append(AllocationEvent::now(size));

            recording.set(false);
        });
    }

    /// Drains the log into a report, unless it is empty.
    pub(crate) fn collect(&self, label: &str) -> Option<Report> {
        let _serialized = self.report_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let _suppressed = self.gate.suppress_current_thread();

        self.drain_into_report(label)
    }

    /// Drains the log and prints a report to stdout, unless the log is empty.
    #[cfg_attr(test, mutants::skip)] // Only redirects to stdout, which tests cannot observe.
    pub(crate) fn report(&self, label: &str) {
        // Acquiring stdout may allocate its buffer.
        let _suppressed = self.gate.suppress_current_thread();
        self.report_to(label, &mut io::stdout().lock());
    }

    fn report_to(&self, label: &str, output: &mut impl Write) {
        let _serialized = self.report_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let _suppressed = self.gate.suppress_current_thread();

        let Some(report) = self.drain_into_report(label) else {
            return;
        };

        match report.render() {
            Ok(text) => {
                // There is nobody to tell if stdout is gone.
                _ = output.write_all(text.as_bytes());
                _ = output.flush();

                self.legend_requested
                    .store(true, atomic::Ordering::Release);
            }
            Err(e) => write_diagnostic(
                &mut io::stderr(),
                &format_args!("memstats: cannot render report '{label}': {e}"),
            ),
        }
    }

    fn drain_into_report(&self, label: &str) -> Option<Report> {
        if self.log.is_empty() {
            return None;
        }

        let events = self.log.drain();
        Some(Report::from_events(label, events, self.config()))
    }

    /// Stops instrumentation for good and prints the final report and the legend.
    ///
    /// Only the first call has any effect.
    #[cfg_attr(test, mutants::skip)] // Only redirects to stdout, which tests cannot observe.
    pub(crate) fn shutdown(&self) {
        let _suppressed = self.gate.suppress_current_thread();
        self.shutdown_to(&mut io::stdout().lock());
    }

    fn shutdown_to(&self, output: &mut impl Write) {
        if self.shut_down.swap(true, atomic::Ordering::AcqRel) {
            return;
        }

        self.gate.set_global(false);

        if self.config().report_at_exit() {
            self.report_to(EXIT_REPORT_LABEL, output);
        }

        if self.legend_requested.load(atomic::Ordering::Acquire) {
            let _suppressed = self.gate.suppress_current_thread();

            let mut legend = String::new();
            if write_legend(&mut legend, self.config().palette()).is_ok() {
                _ = output.write_all(legend.as_bytes());
                _ = output.flush();
            }
        }
    }
}
