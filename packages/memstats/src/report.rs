//! Aggregation of drained events into buckets and their text rendering.

use std::fmt::{self, Display, Write};
use std::num::NonZero;
use std::time::{Duration, Instant};

use foldhash::{HashMap, HashMapExt};

use crate::format::{bytes_to_string, count_to_string};
use crate::{AllocationEvent, Config, Palette, Result, StackSnapshot, StatBucket, ThreadKey};

/// Statistics of all allocations recorded since the previous report.
///
/// Collecting a report drains the event log, so every recorded event is part of exactly one
/// report. For human-readable output, use the `Display` trait implementation or
/// [`render()`](Self::render). For machine-readable output, inspect the buckets via the
/// provided methods.
///
/// # Examples
///
/// ```
/// use memstats::{Allocator, Report};
///
/// #[global_allocator]
/// static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();
///
/// memstats::enable_instrumentation();
/// memstats::enable_thread_instrumentation();
///
/// let data = vec![0_u8; 1024];
/// std::hint::black_box(data);
///
/// memstats::disable_thread_instrumentation();
/// memstats::disable_instrumentation();
///
/// if let Some(report) = Report::collect("vector") {
///     assert!(report.total().count() >= 1);
///     println!("{report}");
/// }
/// ```
#[derive(Debug)]
pub struct Report {
    label: String,
    palette: Palette,
    bins: NonZero<u16>,

    total: StatBucket,

    // Ascending by thread key.
    threads: Box<[(ThreadKey, StatBucket)]>,

    // Descending by accumulated size.
    stacks: Box<[(StackSnapshot, StatBucket)]>,

    // Descending by accumulated size. Keyed by instruction pointer.
    frames: Box<[(usize, StatBucket)]>,

    deallocations: u64,
    window: Duration,
}

impl Report {
    /// Drains all recorded events and aggregates them into a report, without printing it.
    ///
    /// Returns `None` if nothing was recorded since the previous report.
    ///
    /// Disable instrumentation (see [`disable_instrumentation()`][crate::disable_instrumentation])
    /// before collecting if the report must include every event of the measured section:
    /// events recorded by other threads while the report is being collected may land in this
    /// report or in the next one.
    #[must_use]
    pub fn collect(label: &str) -> Option<Self> {
        crate::lifecycle::context().collect(label)
    }

    /// Aggregates events into buckets.
    pub(crate) fn from_events(
        label: &str,
        events: impl IntoIterator<Item = AllocationEvent>,
        config: &Config,
    ) -> Self {
        let mut total = StatBucket::new();
        let mut threads: HashMap<ThreadKey, StatBucket> = HashMap::new();
        let mut stacks: HashMap<StackSnapshot, StatBucket> = HashMap::new();
        let mut frames: HashMap<usize, StatBucket> = HashMap::new();

        let mut deallocations: u64 = 0;
        let mut first: Option<Instant> = None;
        let mut last: Option<Instant> = None;

        for event in events {
            let timestamp = event.timestamp();
            first = Some(first.map_or(timestamp, |first| first.min(timestamp)));
            last = Some(last.map_or(timestamp, |last| last.max(timestamp)));

            if event.is_deallocation() {
                deallocations = deallocations.saturating_add(1);
                continue;
            }

            let size = event.size();

            total.register(size);
            threads
                .entry(event.thread())
                .or_insert_with(StatBucket::new)
                .register(size);

            if let Some(stack) = event.stack() {
                stacks
                    .entry(*stack)
                    .or_insert_with(StatBucket::new)
                    .register(size);

                for &frame in stack.frames() {
                    frames
                        .entry(frame)
                        .or_insert_with(StatBucket::new)
                        .register(size);
                }
            }
        }

        let mut threads: Vec<_> = threads.into_iter().collect();
        threads.sort_unstable_by_key(|(thread, _)| *thread);

        let mut stacks: Vec<_> = stacks.into_iter().collect();
        stacks.sort_by(|(a_stack, a), (b_stack, b)| {
            b.total_size()
                .cmp(&a.total_size())
                .then_with(|| a_stack.frames().cmp(b_stack.frames()))
        });

        let mut frames: Vec<_> = frames.into_iter().collect();
        frames.sort_by(|(a_ip, a), (b_ip, b)| {
            b.total_size()
                .cmp(&a.total_size())
                .then_with(|| a_ip.cmp(b_ip))
        });

        let window = match (first, last) {
            (Some(first), Some(last)) => last.saturating_duration_since(first),
            _ => Duration::ZERO,
        };

        Self {
            label: label.to_owned(),
            palette: config.palette(),
            bins: config.bins(),
            total,
            threads: threads.into_boxed_slice(),
            stacks: stacks.into_boxed_slice(),
            frames: frames.into_boxed_slice(),
            deallocations,
            window,
        }
    }

    /// The label the report was collected with.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// All allocations, regardless of thread or call site.
    #[must_use]
    pub fn total(&self) -> &StatBucket {
        &self.total
    }

    /// Allocations per thread, in ascending order of thread key.
    ///
    /// Threads that only deallocated memory have no bucket.
    pub fn threads(&self) -> impl Iterator<Item = (ThreadKey, &StatBucket)> {
        self.threads.iter().map(|(thread, bucket)| (*thread, bucket))
    }

    /// Allocations per distinct call stack, largest accumulated size first.
    ///
    /// Always empty unless the `stacktrace` feature is enabled.
    pub fn stacks(&self) -> impl Iterator<Item = (&StackSnapshot, &StatBucket)> {
        self.stacks.iter().map(|(stack, bucket)| (stack, bucket))
    }

    /// Allocations per stack frame (instruction pointer), largest accumulated size first.
    ///
    /// An allocation counts towards every frame of its call stack. Always empty unless the
    /// `stacktrace` feature is enabled.
    pub fn frames(&self) -> impl Iterator<Item = (usize, &StatBucket)> {
        self.frames.iter().map(|(frame, bucket)| (*frame, bucket))
    }

    /// Number of recorded deallocations. These are not part of any bucket.
    #[must_use]
    pub fn deallocations(&self) -> u64 {
        self.deallocations
    }

    /// Time between the first and the last recorded event.
    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Renders the report as text, one line per non-empty bucket.
    ///
    /// ```text
    /// ------------------- MemStats phase 1 -------------------
    /// [██ ██ ██ ██ ██ ]10 B   |   55 B(10   ) | Total
    /// [██ ██ ██ ██ ██ ]10 B   |   55 B(10   ) | Thread 1
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`Error::MagnitudeOverflow`][crate::Error::MagnitudeOverflow] if a quantity is
    /// too large to be rendered.
    pub fn render(&self) -> Result<String> {
        let mut output = format!(
            "\n------------------- MemStats {} -------------------\n",
            self.label
        );

        output.push_str(&self.bucket_line(&self.total, "Total")?);

        for (thread, bucket) in self.threads() {
            if !bucket.is_empty() {
                output.push_str(&self.bucket_line(bucket, &format!("Thread {thread}"))?);
            }
        }

        for (stack, bucket) in self.stacks() {
            if !bucket.is_empty() {
                output.push_str(&self.bucket_line(bucket, &describe_stack(stack))?);
            }
        }

        for (frame, bucket) in self.frames() {
            if !bucket.is_empty() {
                output.push_str(&self.bucket_line(bucket, &describe_frame(frame))?);
            }
        }

        Ok(output)
    }

    fn bucket_line(&self, bucket: &StatBucket, label: &str) -> Result<String> {
        let histogram = bucket.histogram(self.bins);
        let largest = histogram.largest();

        let glyphs: String = histogram
            .counts()
            .iter()
            .map(|&count| self.palette.glyph(count, largest))
            .collect();

        let max = bytes_to_string(bucket.max_size() as u128)?;
        let accum = bytes_to_string(bucket.total_size())?;
        let count = count_to_string(u128::from(bucket.count()))?;

        Ok(format!("[{glyphs}]{max:<6} | {accum:>6}({count:<5}) | {label}\n"))
    }
}

impl Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render().map_err(|_| fmt::Error)?)
    }
}

/// Writes the explanation of the report layout and of the glyphs of `palette`.
pub(crate) fn write_legend(output: &mut impl Write, palette: Palette) -> fmt::Result {
    writeln!(output, "\nMemStats Legend:\n")?;
    writeln!(output, "  [{{hist}}]{{max}} | {{accum}}({{count}}) | {{pos}}\n")?;
    writeln!(
        output,
        "• hist:   Distribution of number of allocations for a given number of bytes"
    )?;
    writeln!(output, "• max:    Maximum allocation requested")?;
    writeln!(output, "• accum:  Accumulated number of bytes requested")?;
    writeln!(output, "• count:  Number of total allocation requests")?;
    writeln!(output, "• pos:    Position of the measurement")?;
    writeln!(output, "\nMemStats Histogram Legend:\n")?;
    palette.write_legend(output)
}

fn describe_stack(stack: &StackSnapshot) -> String {
    match stack.frames().split_first() {
        Some((leaf, [])) => format!("Stack {}", describe_frame(*leaf)),
        Some((leaf, rest)) => format!(
            "Stack {} (+{} frames)",
            describe_frame(*leaf),
            rest.len()
        ),
        None => "Stack <empty>".to_owned(),
    }
}

/// Describes a frame by its symbol and source location, if they can be resolved.
#[cfg(feature = "stacktrace")]
fn describe_frame(ip: usize) -> String {
    let mut description = None;

    backtrace::resolve(ip as *mut std::ffi::c_void, |symbol| {
        if description.is_some() {
            return;
        }

        let Some(name) = symbol.name() else {
            return;
        };

        description = Some(match (symbol.filename(), symbol.lineno()) {
            (Some(file), Some(line)) => format!("{name:#} at {}:{line}", file.display()),
            _ => format!("{name:#} ({ip:#x})"),
        });
    });

    description.unwrap_or_else(|| format!("{ip:#x}"))
}

#[cfg(not(feature = "stacktrace"))]
fn describe_frame(ip: usize) -> String {
    format!("{ip:#x}")
}
