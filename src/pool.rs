//! Message buffers the logger formats into before publishing.
//!
//! Each [`crate::Logger`] owns one pool sized to its queue: at most one
//! buffer per slot is kept, since no more records than that can be between
//! formatting and the text ring at once. A buffer is retained at the average
//! text share of a slot, so a burst of long messages does not pin the
//! allocations it grew.

use crossbeam_queue::ArrayQueue;

/// Lower bound on the retained capacity of a pooled buffer.
const MIN_RETAINED: usize = 256;

#[derive(Debug)]
pub(crate) struct BufferPool {
    free: ArrayQueue<String>,
    retain: usize,
}

impl BufferPool {
    /// A pool for a queue with `slots` slots and `text_capacity` text bytes.
    pub(crate) fn new(slots: usize, text_capacity: usize) -> Self {
        Self {
            free: ArrayQueue::new(slots.max(1)),
            retain: (text_capacity / slots.max(1)).max(MIN_RETAINED),
        }
    }

    /// An empty buffer, recycled if one is free.
    #[inline]
    pub(crate) fn take(&self) -> String {
        self.free
            .pop()
            .unwrap_or_else(|| String::with_capacity(self.retain))
    }

    /// Clears `s` and keeps it unless the pool is already full.
    #[inline]
    pub(crate) fn give_back(&self, mut s: String) {
        s.clear();
        s.shrink_to(self.retain);
        // full pool: the buffer is dropped
        let _ = self.free.push(s);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.free.len()
    }
}
