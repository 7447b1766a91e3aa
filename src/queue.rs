//! Multi-producer, single-consumer record queue.
//!
//! ```text
//! [Producer Threads] → publish → [Slot Ring + Text Ring] → drain → [Sink]
//!        ↓                              ↓                      ↓
//!   take free slot,              metadata in slots,      one lazily started
//!   wait for fill turn,          text in a shared        consumer thread,
//!   copy text bytes              byte ring               retired when idle
//! ```
//!
//! Metadata and text are split: slots are fixed-size and reused, while text is
//! carved from one byte ring sized independently of the slot count. Producers
//! take slot indices from the free cursor in ring order and must copy their
//! text in that same order, so each producer waits for the fill turn to reach
//! its slot index before touching the text ring. The consumer therefore reads
//! text strictly in slot order without any lock spanning the publish path.

use std::{
    cell::UnsafeCell,
    ptr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Weak,
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_utils::{Backoff, CachePadded};
use parking_lot::Mutex;

use crate::cursor::{BatchCursor, SimpleCursor, WorkerCursor};
use crate::error::report;
use crate::record::LogRecord;
use crate::sink::Sink;

/// Default number of slots, i.e. records in flight before producers block.
pub const DEFAULT_SLOTS: usize = 512;

/// Default text ring size in bytes.
pub const DEFAULT_TEXT_CAPACITY: usize = 64 * 1024;

/// Default time a consumer thread waits for work before retiring.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(1);

const THREAD_PREFIX: &str = "log-publisher-";

static THREAD_SEQ: AtomicUsize = AtomicUsize::new(1);

/// Sizing of a [`LogQueue`]. Both capacities must be non-zero powers of two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub slots: usize,
    pub text_capacity: usize,
    pub idle_timeout: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            slots: DEFAULT_SLOTS,
            text_capacity: DEFAULT_TEXT_CAPACITY,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// Metadata cell owned by whichever thread holds its index.
#[derive(Default)]
struct Slot {
    record: LogRecord,
    text_len: usize,
}

/// The queue engine.
///
/// Any number of threads may call [`LogQueue::publish`]; records reach the
/// sink on a single consumer thread in exactly the order their slots were
/// assigned.
pub struct LogQueue<S> {
    slots: Box<[UnsafeCell<Slot>]>,
    text: Box<[UnsafeCell<u8>]>,
    slot_mask: usize,
    /// Slots available to producers.
    free: SimpleCursor,
    /// Filled slots waiting for the consumer.
    ready: WorkerCursor,
    /// Slot index whose producer may copy text next.
    fill_turn: CachePadded<AtomicUsize>,
    /// Text ring bytes available to producers.
    text_free: BatchCursor,
    /// Text ring bytes written and waiting for the consumer.
    text_ready: BatchCursor,
    /// Records accepted by `publish` and not yet fully handed to the sink.
    in_flight: CachePadded<AtomicUsize>,
    sink: Mutex<S>,
}

// SAFETY: slot and text cells are only touched by the thread that currently
// owns them under the cursor protocol: a producer between `free.next()` and
// `ready.publish()` (slot) or between `text_free.allocate()` and
// `text_ready.publish()` (bytes); the consumer between `ready.next()` and
// `free.publish()` (slot) or between `text_ready.allocate()` and
// `text_free.publish()` (bytes). Every hand-off goes through an AcqRel RMW.
unsafe impl<S: Send> Sync for LogQueue<S> {}

impl<S: Sink + Send + 'static> LogQueue<S> {
    /// Creates a queue draining into `sink`.
    ///
    /// No thread is started here; the consumer is spawned by the first
    /// `publish` and retires again after `idle_timeout` without records.
    ///
    /// # Parameters
    ///
    /// * `sink` - Receives every record on the consumer thread, header first
    ///   and then the text in one or more chunks.
    /// * `options` - Ring sizes and consumer idle timeout.
    ///
    /// # Panics
    ///
    /// If `options.slots` or `options.text_capacity` is not a power of two.
    ///
    /// # Example
    ///
    /// ```rust, ignore
    /// let queue = LogQueue::new(
    ///     StreamSink::new(std::io::stderr()),
    ///     QueueOptions { slots: 64, ..QueueOptions::default() },
    /// );
    /// queue.publish(LogRecord::new(now, Level::Info), "ready");
    /// ```
    pub fn new(sink: S, options: QueueOptions) -> Arc<Self> {
        let QueueOptions {
            slots,
            text_capacity,
            idle_timeout,
        } = options;

        Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            Self {
                slots: (0..slots).map(|_| UnsafeCell::new(Slot::default())).collect(),
                text: (0..text_capacity).map(|_| UnsafeCell::new(0)).collect(),
                slot_mask: slots.wrapping_sub(1),
                free: SimpleCursor::new(slots, slots, 0),
                ready: WorkerCursor::new(
                    slots,
                    idle_timeout,
                    Box::new(move || spawn_consumer(&weak)),
                ),
                fill_turn: CachePadded::new(AtomicUsize::new(0)),
                text_free: BatchCursor::new(text_capacity, text_capacity, 0),
                text_ready: BatchCursor::new(text_capacity, 0, 0),
                in_flight: CachePadded::new(AtomicUsize::new(0)),
                sink: Mutex::new(sink),
            }
        })
    }

    /// Hands a record and its text to the consumer.
    ///
    /// Records reach the sink in the order their slots were claimed, so two
    /// publishes ordered by a happens-before edge are delivered in that order.
    /// Text longer than the text ring is streamed through it in pieces.
    ///
    /// # Backpressure
    ///
    /// Blocks on a condition variable while every slot is in flight, and spins
    /// with backoff while earlier producers are still copying their text or
    /// the text ring is full.
    ///
    /// # Performance
    ///
    /// - **Fast path** (free slot, room in the text ring): a handful of atomic
    ///   RMWs and one copy of `text`
    /// - **Slow path**: bounded by how fast the sink drains
    ///
    /// # Example
    ///
    /// ```rust, ignore
    /// let record = LogRecord::new(now, Level::Warn).with_thread_name("io");
    /// queue.publish(record, "connection reset");
    /// ```
    pub fn publish(&self, record: LogRecord, text: &str) {
        let bytes = text.as_bytes();
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let index = self.publish_entry(record, bytes.len());

        let backoff = Backoff::new();
        while self.fill_turn.load(Ordering::Acquire) != index {
            backoff.snooze();
        }

        let mut start = 0;
        while start < bytes.len() {
            let size = self.text_free.allocate(bytes.len() - start);
            let p = self.text_free.next(size);
            self.write_text(p, &bytes[start..start + size]);
            self.text_ready.publish(p, size);
            start += size;
        }

        self.fill_turn
            .store((index + 1) & self.slot_mask, Ordering::Release);
    }

    fn publish_entry(&self, record: LogRecord, text_len: usize) -> usize {
        let index = self.free.next();

        // SAFETY: `index` came from the free cursor, so this thread owns the
        // slot until it is published to the consumer below.
        unsafe {
            let slot = &mut *self.slots[index].get();
            slot.record = record;
            slot.text_len = text_len;
        }

        self.ready.publish(index);
        index
    }

    /// Copies `src` into the ring at `p`, wrapping around the end if needed.
    fn write_text(&self, p: usize, src: &[u8]) {
        let first = src.len().min(self.text.len() - p);
        let base = UnsafeCell::raw_get(self.text.as_ptr());
        // SAFETY: `[p, p + src.len())` mod capacity was granted to this
        // producer by `text_free` and is not yet published.
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), base.add(p), first);
            ptr::copy_nonoverlapping(src.as_ptr().add(first), base, src.len() - first);
        }
    }

    /// Consumer loop. Runs until the ready cursor has been idle for the
    /// configured timeout.
    fn drain(&self) {
        while let Some(index) = self.ready.next() {
            // SAFETY: the ready cursor handed this slot to the consumer; it is
            // cleared before being returned to the free pool.
            let (record, text_len) = unsafe {
                let slot = &mut *self.slots[index].get();
                (std::mem::take(&mut slot.record), slot.text_len)
            };

            self.deliver(record, text_len);
            // The slot index doubles as the fill turn, so it is only reused
            // once its producer has finished copying text.
            self.free.publish(index);
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
        }

        if let Err(err) = self.sink.lock().flush() {
            report("sink flush failed", &err);
        }
    }

    fn deliver(&self, record: LogRecord, text_len: usize) {
        let mut sink = self.sink.lock();
        if let Err(err) = sink.on_record_header(text_len, record) {
            report("sink rejected record header", &err);
        }

        let mut remaining = text_len;
        while remaining > 0 {
            let size = self.text_ready.allocate(remaining);
            let p = self.text_ready.next(size);
            let last = size == remaining;
            let (head, tail) = self.read_text(p, size);

            let delivered = if tail.is_empty() {
                sink.on_payload_chunk(last, head)
            } else {
                sink.on_payload_chunk(false, head)
                    .and_then(|_| sink.on_payload_chunk(last, tail))
            };
            if let Err(err) = delivered {
                report("sink rejected payload chunk", &err);
            }

            self.text_free.publish(p, size);
            remaining -= size;
        }
    }

    /// Borrows `[p, p + len)` mod capacity as one or two slices.
    fn read_text(&self, p: usize, len: usize) -> (&[u8], &[u8]) {
        let first = len.min(self.text.len() - p);
        let base = UnsafeCell::raw_get(self.text.as_ptr()) as *const u8;
        // SAFETY: the range was granted to the consumer by `text_ready`; the
        // slices are dropped before the range is published back to producers.
        unsafe {
            (
                std::slice::from_raw_parts(base.add(p), first),
                std::slice::from_raw_parts(base, len - first),
            )
        }
    }

    /// Records accepted by `publish` and not yet fully delivered.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight() == 0
    }

    /// Whether a consumer thread is currently alive.
    pub fn worker_running(&self) -> bool {
        self.ready.is_alive()
    }

    /// Waits until every published record has been delivered.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let backoff = Backoff::new();
        while !self.is_idle() {
            if Instant::now() >= deadline {
                return false;
            }
            if backoff.is_completed() {
                thread::sleep(Duration::from_millis(1));
            } else {
                backoff.snooze();
            }
        }
        true
    }

    /// Waits for in-flight records, then flushes the sink.
    pub fn flush(&self, timeout: Duration) -> bool {
        let idle = self.wait_idle(timeout);
        if let Err(err) = self.sink.lock().flush() {
            report("sink flush failed", &err);
        }
        idle
    }

    /// Runs `f` against the sink while holding the consumer out.
    pub fn with_sink<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        f(&mut self.sink.lock())
    }

    pub fn text_capacity(&self) -> usize {
        self.text.len()
    }

    pub fn slots(&self) -> usize {
        self.slots.len()
    }
}

fn spawn_consumer<S: Sink + Send + 'static>(queue: &Weak<LogQueue<S>>) -> std::io::Result<()> {
    let Some(queue) = queue.upgrade() else {
        return Ok(());
    };
    let name = format!(
        "{}{}",
        THREAD_PREFIX,
        THREAD_SEQ.fetch_add(1, Ordering::Relaxed)
    );
    thread::Builder::new()
        .name(name)
        .spawn(move || queue.drain())
        .map(drop)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::record::Level;

    #[derive(Default)]
    struct Collect {
        headers: Vec<(usize, LogRecord)>,
        text: Vec<u8>,
        chunks: Vec<(bool, usize)>,
    }

    impl Sink for Collect {
        fn on_record_header(&mut self, payload_len: usize, record: LogRecord) -> Result<(), Error> {
            self.headers.push((payload_len, record));
            Ok(())
        }

        fn on_payload_chunk(&mut self, last: bool, chunk: &[u8]) -> Result<(), Error> {
            self.text.extend_from_slice(chunk);
            self.chunks.push((last, chunk.len()));
            Ok(())
        }
    }

    fn options(slots: usize, text_capacity: usize) -> QueueOptions {
        QueueOptions {
            slots,
            text_capacity,
            idle_timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn test_publish_single_record() {
        let queue = LogQueue::new(Collect::default(), options(4, 16));
        queue.publish(LogRecord::new(1000, Level::Info), "hi");
        assert!(queue.wait_idle(Duration::from_secs(5)));

        queue.with_sink(|sink| {
            assert_eq!(sink.headers.len(), 1);
            assert_eq!(sink.headers[0].0, 2);
            assert_eq!(sink.headers[0].1.timestamp_millis, 1000);
            assert_eq!(sink.text, b"hi");
            assert_eq!(sink.chunks, vec![(true, 2)]);
        });
    }

    #[test]
    fn test_text_wraps_around_ring() {
        let queue = LogQueue::new(Collect::default(), options(4, 8));
        queue.publish(LogRecord::new(1, Level::Info), "abcde");
        assert!(queue.wait_idle(Duration::from_secs(5)));
        queue.publish(LogRecord::new(2, Level::Info), "fghij");
        assert!(queue.wait_idle(Duration::from_secs(5)));

        queue.with_sink(|sink| {
            assert_eq!(sink.text, b"abcdefghij");
            // second record starts at offset 5 and wraps after three bytes
            assert_eq!(sink.chunks, vec![(true, 5), (false, 3), (true, 2)]);
        });
    }

    #[test]
    fn test_text_longer_than_ring() {
        let queue = LogQueue::new(Collect::default(), options(4, 8));
        let text = "0123456789abcdefghijklmnopqrstuvwxyz";
        queue.publish(LogRecord::new(1, Level::Debug), text);
        assert!(queue.wait_idle(Duration::from_secs(5)));

        queue.with_sink(|sink| {
            assert_eq!(sink.headers[0].0, text.len());
            assert_eq!(sink.text, text.as_bytes());
            assert_eq!(sink.chunks.iter().filter(|(last, _)| *last).count(), 1);
            assert!(sink.chunks.last().unwrap().0);
        });
    }

    #[test]
    fn test_zero_length_text_does_not_stall_turns() {
        let queue = LogQueue::new(Collect::default(), options(2, 8));
        for i in 0..10 {
            let text = if i % 2 == 0 { "" } else { "x" };
            queue.publish(LogRecord::new(i, Level::Info), text);
        }
        assert!(queue.wait_idle(Duration::from_secs(5)));

        queue.with_sink(|sink| {
            assert_eq!(sink.headers.len(), 10);
            assert_eq!(sink.text, b"xxxxx");
            assert_eq!(sink.chunks.len(), 5);
        });
    }

    #[test]
    fn test_slot_is_cleared_after_consumption() {
        let queue = LogQueue::new(Collect::default(), options(2, 8));
        let name: Arc<str> = Arc::from("worker");
        queue.publish(
            LogRecord::new(1, Level::Info).with_thread_name(name.clone()),
            "",
        );
        assert!(queue.wait_idle(Duration::from_secs(5)));

        // one reference here, one held by the sink; none left in the slot
        assert_eq!(Arc::strong_count(&name), 2);
        queue.with_sink(|sink| sink.headers.clear());
        assert_eq!(Arc::strong_count(&name), 1);
    }
}
