//! Monotonic clock and timed-event queue (C1).
//!
//! Scheduling the same `(tag, id)` pair while one is pending replaces the
//! deadline rather than inserting a second entry — the cloud manager
//! relies on this to reschedule its own retry without first cancelling.

use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use ocf_async::sync::spin::Mutex;

/// Opaque identity for a scheduled callback: `(tag, id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag(pub u64, pub u32);

/// What a fired callback tells the queue to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Remove the event; it will not fire again.
    Done,
    /// Re-queue at the same interval it was scheduled with.
    Continue,
}

struct Entry {
    deadline: Instant,
    tag: Tag,
    interval: Duration,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed: BinaryHeap is a max-heap, we want earliest deadline first.
        other.deadline.cmp(&self.deadline)
    }
}

struct Inner {
    heap: BinaryHeap<Entry>,
    /// side index so a duplicate `schedule` of a pending tag can be treated
    /// as a deadline replacement instead of a second heap entry.
    pending: HashMap<Tag, Instant>,
}

/// Monotonic time source plus a millisecond-resolution delayed-callback
/// queue. Callbacks are *polled*, not invoked from within `schedule` — the
/// event loop (C8) calls [`Clock::poll`] once per iteration and runs
/// whatever came due.
pub struct Clock {
    start: Instant,
    next_id: AtomicU64,
    inner: Mutex<Inner>,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            next_id: AtomicU64::new(1),
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                pending: HashMap::new(),
            }),
        }
    }

    /// Monotonic milliseconds since this clock was created.
    pub fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Allocates a fresh tag suitable for a new timed event.
    pub fn new_tag(&self) -> Tag {
        Tag(self.next_id.fetch_add(1, Ordering::Relaxed) as u64, 0)
    }

    /// Schedules `tag` to fire after `delay_ms`. A pending schedule for the
    /// same tag has its deadline replaced rather than gaining a duplicate.
    pub fn schedule(&self, tag: Tag, delay_ms: u64) {
        let deadline = Instant::now() + Duration::from_millis(delay_ms);
        let mut inner = self.inner.lock();
        inner.pending.insert(tag, deadline);
        inner.heap.push(Entry {
            deadline,
            tag,
            interval: Duration::from_millis(delay_ms),
        });
    }

    /// Removes a pending event. A no-op if it already fired or never existed.
    pub fn cancel(&self, tag: Tag) {
        self.inner.lock().pending.remove(&tag);
    }

    /// Returns every tag whose deadline has passed, removing stale heap
    /// entries left behind by `cancel`/replacement along the way. Returns the
    /// number of milliseconds until the next deadline, or `0` if the queue is
    /// empty.
    pub fn poll(&self, due: &mut Vec<Tag>) -> u64 {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        loop {
            let Some(top) = inner.heap.peek() else {
                return 0;
            };
            // Stale entry: the pending map's deadline for this tag moved on.
            if inner.pending.get(&top.tag) != Some(&top.deadline) {
                inner.heap.pop();
                continue;
            }
            if top.deadline > now {
                return (top.deadline - now).as_millis() as u64;
            }
            let entry = inner.heap.pop().expect("peeked entry vanished");
            inner.pending.remove(&entry.tag);
            due.push(entry.tag);
        }
    }

    /// Re-arms a `Continue` callback at the same interval it last ran with.
    pub fn rearm(&self, tag: Tag, interval_ms: u64) {
        self.schedule(tag, interval_ms);
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_keeps_single_entry() {
        let clock = Clock::new();
        let tag = clock.new_tag();
        clock.schedule(tag, 1000);
        clock.schedule(tag, 5); // replaces the 1000ms deadline

        std::thread::sleep(Duration::from_millis(20));
        let mut due = Vec::new();
        clock.poll(&mut due);
        assert_eq!(due, vec![tag]);

        // second poll finds nothing left over from the replaced entry
        due.clear();
        clock.poll(&mut due);
        assert!(due.is_empty());
    }

    #[test]
    fn cancel_prevents_fire() {
        let clock = Clock::new();
        let tag = clock.new_tag();
        clock.schedule(tag, 5);
        clock.cancel(tag);
        std::thread::sleep(Duration::from_millis(20));
        let mut due = Vec::new();
        clock.poll(&mut due);
        assert!(due.is_empty());
    }
}
