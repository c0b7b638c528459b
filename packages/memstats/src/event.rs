//! Immutable records of observed allocations and deallocations.

use std::cell::Cell;
use std::fmt::{self, Display};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{self, AtomicU64};
use std::time::Instant;

/// Maximum number of frames kept in a [`StackSnapshot`]. Deeper stacks are truncated,
/// keeping the innermost frames.
pub const MAX_STACK_DEPTH: usize = 32;

/// Process-unique identity of a thread that recorded at least one event.
///
/// Threads are numbered in the order in which they first record an event, starting from 1.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ThreadKey(u64);

static NEXT_THREAD_KEY: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // Zero means "not yet assigned". A const-initialized Cell has no destructor and never
    // allocates, so it is safe to touch from inside the global allocator, even during
    // thread teardown.
    static CURRENT_THREAD_KEY: Cell<u64> = const { Cell::new(0) };
}

impl ThreadKey {
    /// Returns the key of the current thread, assigning one if the thread has none yet.
    pub(crate) fn current() -> Self {
        CURRENT_THREAD_KEY
            .try_with(|key| {
                if key.get() == 0 {
                    key.set(NEXT_THREAD_KEY.fetch_add(1, atomic::Ordering::Relaxed));
                }

                Self(key.get())
            })
            // Thread-local storage is already gone, so this thread can no longer be told apart
            // from any other such thread.
            .unwrap_or(Self(0))
    }

    #[cfg(test)]
    pub(crate) const fn fake(value: u64) -> Self {
        Self(value)
    }

    /// The numeric value of the key.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Instruction pointers of the call stack that performed an allocation, innermost first.
///
/// The frames are stored inline so that capturing a snapshot never allocates.
#[derive(Clone, Copy)]
pub struct StackSnapshot {
    frames: [usize; MAX_STACK_DEPTH],
    len: usize,
}

impl StackSnapshot {
    /// Creates a snapshot from instruction pointers, innermost first.
    ///
    /// Frames beyond [`MAX_STACK_DEPTH`] are dropped.
    #[must_use]
    pub fn from_frames(frames: &[usize]) -> Self {
        let mut snapshot = Self::empty();
        for &frame in frames {
            if !snapshot.push(frame) {
                break;
            }
        }
        snapshot
    }

    const fn empty() -> Self {
        Self {
            frames: [0; MAX_STACK_DEPTH],
            len: 0,
        }
    }

    /// Appends a frame, returning `false` if the snapshot is full.
    fn push(&mut self, frame: usize) -> bool {
        match self.frames.get_mut(self.len) {
            Some(slot) => {
                *slot = frame;
                self.len = self.len.wrapping_add(1);
                true
            }
            None => false,
        }
    }

    /// The captured frames, innermost first.
    #[must_use]
    pub fn frames(&self) -> &[usize] {
        self.frames.get(..self.len).unwrap_or_default()
    }

    /// Captures the call stack below the function starting at address `entry`.
    ///
    /// The frames of `entry` itself, of everything it called and of its immediate caller are
    /// left out, so the snapshot starts at the caller of the caller. If no frame belongs to
    /// `entry`, the innermost frames are kept.
    #[cfg(feature = "stacktrace")]
    #[inline(never)]
    pub(crate) fn capture_below(entry: usize) -> Self {
        let mut walked = [0_usize; MAX_STACK_DEPTH + ENTRY_SEARCH_DEPTH];
        let mut walked_len = 0_usize;
        let mut first_kept = None;

        // `trace()` walks the stack without allocating on the Rust heap; symbol resolution
        // is deferred to report time.
        backtrace::trace(|frame| {
            let Some(slot) = walked.get_mut(walked_len) else {
                return false;
            };

            *slot = frame.ip() as usize;
            walked_len = walked_len.wrapping_add(1);

            if first_kept.is_none() && frame.symbol_address() as usize == entry {
                // Skip the caller of `entry` as well.
                first_kept = Some(walked_len.wrapping_add(1));
            }

            match first_kept {
                Some(first) => walked_len < first.saturating_add(MAX_STACK_DEPTH),
                None => true,
            }
        });

        let walked = walked.get(..walked_len).unwrap_or_default();

        Self::from_frames(match first_kept {
            Some(first) => walked.get(first..).unwrap_or_default(),
            None => walked,
        })
    }
}

impl fmt::Debug for StackSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.frames().iter().map(|ip| format!("{ip:#x}")))
            .finish()
    }
}

impl PartialEq for StackSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.frames() == other.frames()
    }
}

impl Eq for StackSnapshot {}

impl Hash for StackSnapshot {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.frames().hash(state);
    }
}

/// One allocation or deallocation observed by the [`Allocator`](crate::Allocator).
///
/// A `size` of zero marks a deallocation.
#[derive(Clone, Copy, Debug)]
pub struct AllocationEvent {
    size: usize,
    timestamp: Instant,
    thread: ThreadKey,
    #[cfg(feature = "stacktrace")]
    stack: StackSnapshot,
}

impl AllocationEvent {
    /// Records the current thread and time for an allocation of `size` bytes, or for a
    /// deallocation if `size` is zero.
    pub(crate) fn now(size: usize) -> Self {
        Self {
            size,
            timestamp: Instant::now(),
            thread: ThreadKey::current(),
            #[cfg(feature = "stacktrace")]
            stack: StackSnapshot::capture_below(RECORD_ENTRY as usize),
        }
    }

    #[cfg(test)]
    pub(crate) fn fake(size: usize, thread: ThreadKey) -> Self {
        Self {
            size,
            timestamp: Instant::now(),
            thread,
            #[cfg(feature = "stacktrace")]
            stack: StackSnapshot::empty(),
        }
    }

    #[cfg(all(test, feature = "stacktrace"))]
    pub(crate) fn fake_with_stack(size: usize, thread: ThreadKey, frames: &[usize]) -> Self {
        Self {
            stack: StackSnapshot::from_frames(frames),
            ..Self::fake(size, thread)
        }
    }

    /// Number of bytes allocated, zero for a deallocation.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether this event records a deallocation.
    #[must_use]
    pub fn is_deallocation(&self) -> bool {
        self.size == 0
    }

    /// When the event was recorded.
    #[must_use]
    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    /// The thread that performed the allocation or deallocation.
    #[must_use]
    pub fn thread(&self) -> ThreadKey {
        self.thread
    }

    /// The call stack at the time of the event.
    ///
    /// Always `None` unless the `stacktrace` feature is enabled.
    #[must_use]
    pub fn stack(&self) -> Option<&StackSnapshot> {
        #[cfg(feature = "stacktrace")]
        {
            Some(&self.stack)
        }

        #[cfg(not(feature = "stacktrace"))]
        {
            None
        }
    }
}

// The interceptor hook; stacks are captured below it.
#[cfg(feature = "stacktrace")]
const RECORD_ENTRY: fn(usize) = crate::lifecycle::record;

// Frames walked beyond the snapshot capacity while looking for the entry point.
#[cfg(feature = "stacktrace")]
const ENTRY_SEARCH_DEPTH: usize = 16;

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::thread;

    use super::*;

    static_assertions::assert_impl_all!(AllocationEvent: Send, Sync, Copy);

    #[test]
    fn thread_key_is_stable_within_thread() {
        assert_eq!(ThreadKey::current(), ThreadKey::current());
    }

    #[test]
    fn thread_keys_differ_between_threads() {
        let here = ThreadKey::current();
        let there = thread::spawn(ThreadKey::current).join().unwrap();

        assert_ne!(here, there);
        assert_ne!(there.get(), 0);
    }

    #[test]
    fn snapshot_keeps_innermost_frames_up_to_capacity() {
        let frames: Vec<usize> = (1..=MAX_STACK_DEPTH + 8).collect();
        let snapshot = StackSnapshot::from_frames(&frames);

        assert_eq!(snapshot.frames().len(), MAX_STACK_DEPTH);
        assert_eq!(snapshot.frames().first(), Some(&1));
        assert_eq!(snapshot.frames().last(), Some(&MAX_STACK_DEPTH));
    }

    #[test]
    fn snapshots_compare_by_used_frames_only() {
        let a = StackSnapshot::from_frames(&[0x10, 0x20]);
        let b = StackSnapshot::from_frames(&[0x10, 0x20]);
        let c = StackSnapshot::from_frames(&[0x10, 0x20, 0x30]);

        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut set = foldhash::HashSet::default();
        set.insert(a);
        assert!(set.contains(&b));
        assert!(!set.contains(&c));
    }

    #[test]
    fn zero_size_is_deallocation() {
        let thread = ThreadKey::fake(7);

        assert!(AllocationEvent::fake(0, thread).is_deallocation());
        assert!(!AllocationEvent::fake(1, thread).is_deallocation());
        assert_eq!(AllocationEvent::fake(1, thread).thread(), thread);
    }

    #[test]
    fn now_captures_current_thread() {
        let event = AllocationEvent::now(64);

        assert_eq!(event.size(), 64);
        assert_eq!(event.thread(), ThreadKey::current());
        assert!(event.timestamp() <= Instant::now());
    }

    #[cfg(feature = "stacktrace")]
    #[inline(never)]
    fn capture_below_self() -> StackSnapshot {
        let entry: fn() -> StackSnapshot = capture_below_self;
        let snapshot = StackSnapshot::capture_below(entry as usize);

        // Not a tail call, so this frame is on the stack during the capture.
        std::hint::black_box(snapshot)
    }

    #[cfg(feature = "stacktrace")]
    #[inline(never)]
    fn calls_capture_below_self() -> StackSnapshot {
        std::hint::black_box(capture_below_self())
    }

    #[cfg(feature = "stacktrace")]
    fn symbol_names(snapshot: &StackSnapshot) -> Vec<String> {
        let mut names = Vec::new();

        for &ip in snapshot.frames() {
            backtrace::resolve(ip as *mut std::ffi::c_void, |symbol| {
                if let Some(name) = symbol.name() {
                    names.push(format!("{name:#}"));
                }
            });
        }

        names
    }

    #[cfg(feature = "stacktrace")]
    #[test]
    fn capture_skips_entry_and_its_caller() {
        let snapshot = calls_capture_below_self();
        assert!(!snapshot.frames().is_empty());

        for name in symbol_names(&snapshot) {
            assert!(!name.contains("capture_below"), "unexpected frame {name}");
        }
    }

    #[cfg(feature = "stacktrace")]
    #[test]
    fn capture_without_entry_keeps_innermost_frames() {
        let snapshot = StackSnapshot::capture_below(0);
        assert!(!snapshot.frames().is_empty());

        assert!(
            symbol_names(&snapshot)
                .iter()
                .any(|name| name.contains("StackSnapshot::capture_below"))
        );

        assert!(AllocationEvent::now(8).stack().is_some());
    }

    #[cfg(not(feature = "stacktrace"))]
    #[test]
    fn no_stack_without_stacktrace_feature() {
        assert!(AllocationEvent::now(8).stack().is_none());
    }
}
