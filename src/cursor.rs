//! Ring cursors arbitrating slot and byte ownership.
//!
//! Every cursor tracks three numbers over a power-of-two ring: `count` units
//! available to take, `head` (next unit to take) and `tail` (next unit to be
//! published). `head` and `tail` move independently; `count` is the only
//! cross-check, so takers and publishers never wait on each other except
//! through its transitions.
//!
//! Publication is ordered: `publish(index)` spins until `tail` reaches
//! `index`, so units become available strictly in ring order even when the
//! threads that filled them finish out of order.

use std::{
    io,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};

use crossbeam_utils::{Backoff, CachePadded};
use parking_lot::{Condvar, Mutex};

/// Spins until `tail` moves from `index` to `next`.
#[inline]
fn advance_tail(tail: &AtomicUsize, index: usize, next: usize) {
    let backoff = Backoff::new();
    while tail
        .compare_exchange_weak(index, next, Ordering::AcqRel, Ordering::Relaxed)
        .is_err()
    {
        backoff.snooze();
    }
}

fn assert_ring_size(size: usize, count: usize) {
    assert!(
        size.is_power_of_two(),
        "ring size must be a non-zero power of two"
    );
    assert!(count <= size, "initial count exceeds ring size");
}

/// Single-unit cursor with a blocking `next`.
///
/// Used as the free-slot pool: producers block in [`SimpleCursor::next`] when
/// every slot is in flight, which is the queue's backpressure point.
pub(crate) struct SimpleCursor {
    mask: usize,
    count: CachePadded<AtomicUsize>,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    lock: Mutex<()>,
    available: Condvar,
}

impl SimpleCursor {
    pub(crate) fn new(size: usize, count: usize, head: usize) -> Self {
        assert_ring_size(size, count);
        let mask = size - 1;
        Self {
            mask,
            count: CachePadded::new(AtomicUsize::new(count)),
            head: CachePadded::new(AtomicUsize::new(head & mask)),
            tail: CachePadded::new(AtomicUsize::new((head + count) & mask)),
            lock: Mutex::new(()),
            available: Condvar::new(),
        }
    }

    /// Makes `index` available to takers once every earlier index has been published.
    pub(crate) fn publish(&self, index: usize) {
        if self.release(index) {
            let _guard = self.lock.lock();
            self.available.notify_all();
        }
    }

    /// Takes the next unit, blocking on the condition variable while none is available.
    ///
    /// Units are handed out in ring order whatever order they were published
    /// in, since a publish only becomes visible once the tail reaches it.
    ///
    /// # Returns
    ///
    /// The ring index now owned by the caller until it is published to the
    /// opposite cursor.
    pub(crate) fn next(&self) -> usize {
        if let Some(index) = self.try_next() {
            return index;
        }

        let mut guard = self.lock.lock();
        loop {
            if let Some(index) = self.try_next() {
                return index;
            }
            self.available.wait(&mut guard);
        }
    }

    /// Takes the next unit if one is available right now.
    pub(crate) fn try_next(&self) -> Option<usize> {
        let mut c = self.count.load(Ordering::Acquire);
        while c > 0 {
            match self.count.compare_exchange_weak(
                c,
                c - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(self.head.fetch_add(1, Ordering::AcqRel) & self.mask),
                Err(n) => c = n,
            }
        }
        None
    }

    pub(crate) fn available(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Advances the tail past `index`; returns `true` if the cursor was empty before.
    #[inline]
    fn release(&self, index: usize) -> bool {
        advance_tail(&self.tail, index, (index + 1) & self.mask);
        self.count.fetch_add(1, Ordering::AcqRel) == 0
    }
}

/// Spawns a consumer for a [`WorkerCursor`].
pub(crate) type Spawner = Box<dyn Fn() -> io::Result<()> + Send + Sync>;

/// [`SimpleCursor`] whose taker is a dedicated thread started on demand.
///
/// The first publish into an empty cursor starts the worker if none is alive.
/// The worker's [`WorkerCursor::next`] waits at most `idle_timeout`; when it
/// times out with nothing to take it marks the worker dead and returns `None`
/// so the thread can exit. Both transitions happen under the same lock, so a
/// publish can never observe a worker that is about to exit as alive.
pub(crate) struct WorkerCursor {
    cursor: SimpleCursor,
    alive: AtomicBool,
    idle_timeout: Duration,
    spawn: Spawner,
}

impl WorkerCursor {
    pub(crate) fn new(size: usize, idle_timeout: Duration, spawn: Spawner) -> Self {
        Self {
            cursor: SimpleCursor::new(size, 0, 0),
            alive: AtomicBool::new(false),
            idle_timeout,
            spawn,
        }
    }

    pub(crate) fn publish(&self, index: usize) {
        let was_empty = self.cursor.release(index);
        if was_empty || !self.alive.load(Ordering::Acquire) {
            let _guard = self.cursor.lock.lock();
            self.cursor.available.notify_all();
            if !self.alive.swap(true, Ordering::AcqRel) {
                if let Err(err) = (self.spawn)() {
                    self.alive.store(false, Ordering::Release);
                    crate::error::report("failed to start consumer thread", &err);
                }
            }
        }
    }

    /// Takes the next unit, or returns `None` after `idle_timeout` without work.
    pub(crate) fn next(&self) -> Option<usize> {
        if let Some(index) = self.cursor.try_next() {
            return Some(index);
        }

        let mut guard = self.cursor.lock.lock();
        loop {
            if let Some(index) = self.cursor.try_next() {
                return Some(index);
            }
            if self
                .cursor
                .available
                .wait_for(&mut guard, self.idle_timeout)
                .timed_out()
            {
                if let Some(index) = self.cursor.try_next() {
                    return Some(index);
                }
                self.alive.store(false, Ordering::Release);
                return None;
            }
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

/// Cursor over a byte ring where callers take and publish ranges.
///
/// [`BatchCursor::allocate`] grants up to the requested amount, possibly
/// less; callers loop until they have covered what they need. Waiting for
/// capacity is a spin with backoff: the only thread that can free bytes is
/// already running.
pub(crate) struct BatchCursor {
    mask: usize,
    count: CachePadded<AtomicUsize>,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
}

impl BatchCursor {
    pub(crate) fn new(size: usize, count: usize, head: usize) -> Self {
        assert_ring_size(size, count);
        let mask = size - 1;
        Self {
            mask,
            count: CachePadded::new(AtomicUsize::new(count)),
            head: CachePadded::new(AtomicUsize::new(head & mask)),
            tail: CachePadded::new(AtomicUsize::new((head + count) & mask)),
        }
    }

    /// Reserves between 1 and `amount` units, spinning until at least one is free.
    ///
    /// A grant is a count only; the caller turns it into a position with
    /// [`BatchCursor::next`] and must publish exactly that many units back.
    ///
    /// # Panics
    ///
    /// If `amount` is zero.
    ///
    /// # Example
    ///
    /// ```rust, ignore
    /// let mut left = text.len();
    /// while left > 0 {
    ///     let size = free.allocate(left);
    ///     let at = free.next(size);
    ///     copy_into_ring(at, size);
    ///     ready.publish(at, size);
    ///     left -= size;
    /// }
    /// ```
    pub(crate) fn allocate(&self, amount: usize) -> usize {
        assert!(amount > 0, "allocation amount must be positive");

        let backoff = Backoff::new();
        let mut c = self.count.load(Ordering::Acquire);
        loop {
            if c > 0 {
                let granted = c.min(amount);
                match self.count.compare_exchange_weak(
                    c,
                    c - granted,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return granted,
                    Err(n) => c = n,
                }
            } else {
                backoff.snooze();
                c = self.count.load(Ordering::Acquire);
            }
        }
    }

    /// Returns the ring offset of `amount` units previously granted by `allocate`.
    #[inline]
    pub(crate) fn next(&self, amount: usize) -> usize {
        self.head.fetch_add(amount, Ordering::AcqRel) & self.mask
    }

    /// Publishes `[index, index + amount)` once every earlier range has been published.
    pub(crate) fn publish(&self, index: usize, amount: usize) {
        advance_tail(&self.tail, index, (index + amount) & self.mask);
        self.count.fetch_add(amount, Ordering::AcqRel);
    }

    pub(crate) fn available(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    };
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_simple_cursor_hands_out_in_ring_order() {
        let cursor = SimpleCursor::new(4, 4, 0);
        let taken: Vec<usize> = (0..4).map(|_| cursor.next()).collect();
        assert_eq!(taken, vec![0, 1, 2, 3]);
        assert_eq!(cursor.try_next(), None);

        cursor.publish(0);
        cursor.publish(1);
        assert_eq!(cursor.next(), 0);
        assert_eq!(cursor.next(), 1);
        assert_eq!(cursor.available(), 0);
    }

    #[test]
    fn test_simple_cursor_blocks_until_published() {
        let cursor = Arc::new(SimpleCursor::new(2, 0, 0));
        let taken = Arc::new(AtomicBool::new(false));

        let taker = {
            let cursor = cursor.clone();
            let taken = taken.clone();
            thread::spawn(move || {
                let index = cursor.next();
                taken.store(true, Ordering::Release);
                index
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!taken.load(Ordering::Acquire));

        cursor.publish(0);
        assert_eq!(taker.join().unwrap(), 0);
        assert!(taken.load(Ordering::Acquire));
    }

    #[test]
    fn test_publish_waits_for_earlier_index() {
        let cursor = Arc::new(SimpleCursor::new(4, 0, 0));
        let published = Arc::new(AtomicBool::new(false));

        let late = {
            let cursor = cursor.clone();
            let published = published.clone();
            thread::spawn(move || {
                cursor.publish(1);
                published.store(true, Ordering::Release);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!published.load(Ordering::Acquire));
        assert_eq!(cursor.available(), 0);

        cursor.publish(0);
        late.join().unwrap();
        assert_eq!(cursor.next(), 0);
        assert_eq!(cursor.next(), 1);
    }

    #[test]
    fn test_worker_cursor_spawns_and_retires() {
        let spawned = Arc::new(AtomicUsize::new(0));
        let cursor = Arc::new_cyclic(|weak: &std::sync::Weak<WorkerCursor>| {
            let weak = weak.clone();
            let spawned = spawned.clone();
            WorkerCursor::new(
                4,
                Duration::from_millis(50),
                Box::new(move || {
                    spawned.fetch_add(1, Ordering::AcqRel);
                    let Some(cursor) = weak.upgrade() else {
                        return Ok(());
                    };
                    thread::spawn(move || while cursor.next().is_some() {});
                    Ok(())
                }),
            )
        });

        cursor.publish(0);
        assert!(cursor.is_alive());
        assert_eq!(spawned.load(Ordering::Acquire), 1);

        let start = Instant::now();
        while cursor.is_alive() {
            assert!(start.elapsed() < Duration::from_secs(5), "worker never retired");
            thread::sleep(Duration::from_millis(10));
        }

        cursor.publish(1);
        assert_eq!(spawned.load(Ordering::Acquire), 2);
    }

    #[test]
    fn test_batch_cursor_grants_partial_amounts() {
        let cursor = BatchCursor::new(8, 8, 0);
        assert_eq!(cursor.allocate(5), 5);
        assert_eq!(cursor.next(5), 0);
        assert_eq!(cursor.allocate(5), 3);
        assert_eq!(cursor.next(3), 5);
        assert_eq!(cursor.available(), 0);

        cursor.publish(0, 5);
        assert_eq!(cursor.available(), 5);
        assert_eq!(cursor.allocate(2), 2);
        assert_eq!(cursor.next(2), 0);
    }

    #[test]
    fn test_batch_cursor_wraps() {
        let free = BatchCursor::new(4, 4, 0);
        let used = BatchCursor::new(4, 0, 0);

        let n = free.allocate(3);
        let p = free.next(n);
        used.publish(p, n);
        let n = used.allocate(3);
        free.publish(used.next(n), n);

        // three bytes consumed, the next three straddle the end of the ring
        assert_eq!(free.allocate(3), 3);
        assert_eq!(free.next(3), 3);
    }

    #[test]
    #[should_panic(expected = "allocation amount must be positive")]
    fn test_batch_cursor_rejects_empty_allocation() {
        BatchCursor::new(4, 4, 0).allocate(0);
    }

    #[test]
    #[should_panic(expected = "ring size must be a non-zero power of two")]
    fn test_ring_size_assertion() {
        let _ = SimpleCursor::new(6, 0, 0);
    }
}
