//! Shared cache of decoded strings.
//!
//! Decoding the same thread names and context keys over and over would
//! otherwise allocate a fresh `Arc<str>` per record. The interner hands out
//! the live instance when one exists. Entries are weak, so a string that no
//! record references any more is reclaimed with its last user; dead slots are
//! pruned lazily whenever their bucket is visited.

use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Default bucket count for [`StringInterner::default`].
pub const DEFAULT_BUCKETS: usize = 4096;

/// Sharded weak-reference string cache.
///
/// Each bucket has its own lock, so decoders on different threads only contend
/// when their strings hash to the same bucket.
pub struct StringInterner {
    buckets: Box<[Mutex<Vec<Weak<str>>>]>,
    mask: usize,
    hasher: RandomState,
}

impl Default for StringInterner {
    fn default() -> Self {
        Self::new(DEFAULT_BUCKETS)
    }
}

impl std::fmt::Debug for StringInterner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StringInterner")
            .field("buckets", &self.buckets.len())
            .finish()
    }
}

impl StringInterner {
    /// # Panics
    ///
    /// If `buckets` is not a non-zero power of two.
    pub fn new(buckets: usize) -> Self {
        assert!(
            buckets.is_power_of_two(),
            "bucket count must be a non-zero power of two"
        );
        Self {
            buckets: (0..buckets).map(|_| Mutex::new(Vec::new())).collect(),
            mask: buckets - 1,
            hasher: RandomState::new(),
        }
    }

    /// Returns the live shared instance equal to `value`, inserting one if needed.
    pub fn intern(&self, value: &str) -> Arc<str> {
        let index = self.hasher.hash_one(value) as usize & self.mask;
        let mut bucket = self.buckets[index].lock();

        let mut found = None;
        bucket.retain(|weak| match weak.upgrade() {
            Some(live) => {
                if found.is_none() && *live == *value {
                    found = Some(live);
                }
                true
            }
            None => false,
        });

        found.unwrap_or_else(|| {
            let fresh: Arc<str> = Arc::from(value);
            bucket.push(Arc::downgrade(&fresh));
            fresh
        })
    }

    /// Drops every dead entry.
    pub fn purge(&self) {
        for bucket in self.buckets.iter() {
            bucket.lock().retain(|weak| weak.strong_count() > 0);
        }
    }

    /// Number of entries that are still referenced somewhere.
    pub fn len(&self) -> usize {
        self.buckets
            .iter()
            .map(|bucket| {
                bucket
                    .lock()
                    .iter()
                    .filter(|weak| weak.strong_count() > 0)
                    .count()
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_returns_shared_instance() {
        let interner = StringInterner::new(8);
        let a = interner.intern("main");
        let b = interner.intern("main");
        let c = interner.intern("worker");

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(interner.len(), 2);
    }

    #[test]
    fn test_dead_entries_are_reclaimed() {
        let interner = StringInterner::new(1);
        let a = interner.intern("short-lived");
        let weak = Arc::downgrade(&a);
        drop(a);
        assert!(weak.upgrade().is_none());
        assert_eq!(interner.len(), 0);

        let b = interner.intern("other");
        // visiting the single bucket pruned the dead entry
        assert_eq!(interner.buckets[0].lock().len(), 1);
        interner.purge();
        assert_eq!(interner.len(), 1);
        drop(b);
        interner.purge();
        assert!(interner.is_empty());
        assert!(interner.buckets[0].lock().is_empty());
    }

    #[test]
    fn test_concurrent_interning_converges() {
        let interner = Arc::new(StringInterner::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let interner = interner.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .map(|i| interner.intern(&format!("key-{}", i % 10)))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let results: Vec<Vec<Arc<str>>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for (x, y) in results[0].iter().zip(results[1].iter()) {
            assert!(Arc::ptr_eq(x, y));
        }
        assert_eq!(interner.len(), 10);
    }
}
