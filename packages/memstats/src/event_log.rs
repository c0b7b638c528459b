//! Append-only log of recorded events, stored outside the instrumented heap.

use std::mem::MaybeUninit;
use std::ptr::{self, NonNull};
use std::sync::{Mutex, PoisonError};

use crate::{AllocationEvent, bookkeeping};

/// Number of events stored per chunk. The log grows one chunk at a time.
const CHUNK_CAPACITY: usize = 512;

struct Chunk {
    events: [MaybeUninit<AllocationEvent>; CHUNK_CAPACITY],

    // Number of initialized entries at the start of `events`.
    len: usize,

    next: Option<NonNull<Chunk>>,
}

impl Chunk {
    /// Allocates an empty chunk from the bookkeeping channel.
    ///
    /// The chunk is initialized in place because a chunk is far too big to build on the stack.
    fn allocate() -> NonNull<Self> {
        let chunk = bookkeeping::allocate::<Self>().cast::<Self>();

        // SAFETY: The storage is valid for writes of a whole `Chunk`. The event slots are
        // `MaybeUninit` and need no initialization; we initialize the remaining fields here.
        unsafe {
            ptr::addr_of_mut!((*chunk.as_ptr()).len).write(0);
        }
        // SAFETY: As above.
        unsafe {
            ptr::addr_of_mut!((*chunk.as_ptr()).next).write(None);
        }

        chunk
    }
}

/// Singly linked list of chunks, oldest first. Events are appended to the tail chunk.
#[derive(Debug)]
struct ChunkList {
    head: Option<NonNull<Chunk>>,
    tail: Option<NonNull<Chunk>>,
    len: usize,
}

// SAFETY: The list exclusively owns its chunks and the events in them are plain `Copy` data,
// so moving the list to another thread is sound.
unsafe impl Send for ChunkList {}

impl ChunkList {
    const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    fn push(&mut self, event: AllocationEvent) {
        let tail = match self.tail {
            // SAFETY: The tail is a live chunk owned by this list and we hold `&mut self`.
            Some(tail) if unsafe { tail.as_ref() }.len < CHUNK_CAPACITY => tail,
            _ => self.grow(),
        };

        // SAFETY: The tail is a live chunk owned by this list and we hold `&mut self`,
        // so nobody else references it.
        let chunk = unsafe { &mut *tail.as_ptr() };

        let slot = chunk
            .events
            .get_mut(chunk.len)
            .expect("grow() guarantees the tail chunk has a free slot");
        slot.write(event);

        chunk.len = chunk.len.wrapping_add(1);
        self.len = self.len.wrapping_add(1);
    }

    fn grow(&mut self) -> NonNull<Chunk> {
        let chunk = Chunk::allocate();

        match self.tail {
            // SAFETY: The tail is a live chunk owned by this list and we hold `&mut self`.
            Some(tail) => unsafe { (*tail.as_ptr()).next = Some(chunk) },
            None => self.head = Some(chunk),
        }

        self.tail = Some(chunk);
        chunk
    }
}

/// Concurrency-safe, unbounded, insertion-ordered collection of recorded events.
///
/// Growing the log never goes through the global allocator, so appending an event can never
/// cause another event to be recorded. The mutex does not need to be reentrant for the same
/// reason.
///
/// The log only guarantees its own consistency. A [`drain()`](Self::drain) that runs while
/// other threads are still appending may or may not include events appended concurrently.
#[derive(Debug)]
pub(crate) struct EventLog {
    chunks: Mutex<ChunkList>,
}

impl EventLog {
    pub(crate) const fn new() -> Self {
        Self {
            chunks: Mutex::new(ChunkList::new()),
        }
    }

    pub(crate) fn append(&self, event: AllocationEvent) {
        // A panic while holding the lock cannot leave the list inconsistent (the only
        // fallible step is allocation, which diverges before any mutation), so a poisoned
        // lock is still usable. We must not panic here: we are inside the global allocator.
        self.chunks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    pub(crate) fn len(&self) -> usize {
        self.chunks.lock().unwrap_or_else(PoisonError::into_inner).len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Takes all events out of the log, leaving it empty.
    ///
    /// The lock is only held while detaching the chunks, so appending can continue while
    /// the caller consumes the returned iterator.
    pub(crate) fn drain(&self) -> Drain {
        let list = {
            let mut chunks = self.chunks.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *chunks, ChunkList::new())
        };

        Drain {
            current: list.head,
            index: 0,
            remaining: list.len,
        }
    }
}

impl Drop for EventLog {
    fn drop(&mut self) {
        let list = std::mem::replace(
            self.chunks.get_mut().unwrap_or_else(PoisonError::into_inner),
            ChunkList::new(),
        );

        drop(Drain {
            current: list.head,
            index: 0,
            remaining: list.len,
        });
    }
}

/// Iterator over drained events, in insertion order.
///
/// Consumed chunks are returned to the system allocator as the iterator advances, and any
/// unconsumed chunks when it is dropped.
#[derive(Debug)]
pub(crate) struct Drain {
    current: Option<NonNull<Chunk>>,
    index: usize,
    remaining: usize,
}

impl Drain {
    /// Releases the current chunk and moves on to the next one.
    fn advance_chunk(&mut self) {
        if let Some(chunk) = self.current {
            // SAFETY: The drain exclusively owns every chunk from `current` onwards.
            self.current = unsafe { chunk.as_ref() }.next;
            self.index = 0;

            // SAFETY: The chunk came from `bookkeeping::allocate()` via `Chunk::allocate()`
            // and we no longer reference it. Events are `Copy`, so nothing needs dropping.
            unsafe {
                bookkeeping::free(chunk);
            }
        }
    }
}

impl Iterator for Drain {
    type Item = AllocationEvent;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let chunk = self.current?;

            // SAFETY: The drain exclusively owns every chunk from `current` onwards.
            let chunk_ref = unsafe { chunk.as_ref() };

            if self.index < chunk_ref.len {
                let slot = chunk_ref
                    .events
                    .get(self.index)
                    .expect("index is below the chunk length, which never exceeds its capacity");

                // SAFETY: Slots below `len` were initialized by `ChunkList::push()`.
                let event = unsafe { slot.assume_init() };

                self.index = self.index.wrapping_add(1);
                self.remaining = self.remaining.saturating_sub(1);
                return Some(event);
            }

            self.advance_chunk();
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for Drain {}

impl Drop for Drain {
    fn drop(&mut self) {
        while self.current.is_some() {
            self.advance_chunk();
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::ThreadKey;

    static_assertions::assert_impl_all!(EventLog: Send, Sync);

    fn event(size: usize) -> AllocationEvent {
        AllocationEvent::fake(size, ThreadKey::fake(1))
    }

    #[test]
    fn new_log_is_empty() {
        let log = EventLog::new();

        assert!(log.is_empty());
        assert_eq!(log.drain().count(), 0);
    }

    #[test]
    fn drain_returns_events_in_insertion_order_across_chunks() {
        let log = EventLog::new();
        let count = CHUNK_CAPACITY * 2 + 17;

        for size in 1..=count {
            log.append(event(size));
        }

        assert_eq!(log.len(), count);

        let drained = log.drain();
        assert_eq!(drained.len(), count);

        let sizes: Vec<_> = drained.map(|event| event.size()).collect();
        assert_eq!(sizes, (1..=count).collect::<Vec<_>>());
    }

    #[test]
    fn drain_leaves_log_empty() {
        let log = EventLog::new();
        log.append(event(8));
        log.append(event(0));

        assert_eq!(log.drain().count(), 2);
        assert!(log.is_empty());
        assert_eq!(log.drain().count(), 0);
    }

    #[test]
    fn log_is_reusable_after_drain() {
        let log = EventLog::new();
        log.append(event(1));
        drop(log.drain());

        log.append(event(2));
        let sizes: Vec<_> = log.drain().map(|event| event.size()).collect();
        assert_eq!(sizes, vec![2]);
    }

    #[test]
    fn partially_consumed_drain_releases_remaining_events() {
        let log = EventLog::new();
        for size in 1..=CHUNK_CAPACITY * 3 {
            log.append(event(size));
        }

        let mut drain = log.drain();
        assert_eq!(drain.next().map(|event| event.size()), Some(1));
        drop(drain);

        assert!(log.is_empty());
    }

    #[test]
    fn concurrent_appends_are_not_lost() {
        const THREADS: usize = 8;
        const EVENTS_PER_THREAD: usize = 1000;

        let log = Arc::new(EventLog::new());

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let log = Arc::clone(&log);
                thread::spawn(move || {
                    for size in 1..=EVENTS_PER_THREAD {
                        log.append(AllocationEvent::now(size));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let events: Vec<_> = log.drain().collect();
        assert_eq!(events.len(), THREADS * EVENTS_PER_THREAD);

        let total: usize = events.iter().map(AllocationEvent::size).sum();
        assert_eq!(total, THREADS * EVENTS_PER_THREAD * (EVENTS_PER_THREAD + 1) / 2);
    }
}
