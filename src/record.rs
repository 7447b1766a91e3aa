//! The record shape moved by both the queue engine and the wire codec.
//!
//! A record is split in two: the fixed set of metadata fields carried by
//! [`LogRecord`], and the formatted message text which is always delivered
//! separately, in chunks, after the consumer has been told its exact length.

use std::fmt;
use std::sync::Arc;

/// Log severity, ordered from least to most severe.
///
/// The ordinal is part of the wire format (low three bits of the flags byte),
/// so the variant order must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Level {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl Level {
    const ALL: [Level; 5] = [
        Level::Trace,
        Level::Debug,
        Level::Info,
        Level::Warn,
        Level::Error,
    ];

    #[inline]
    pub const fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        Self::ALL.get(ordinal as usize).copied()
    }

    /// Fixed-width name, padded so that columns line up in stream output.
    pub const fn formatted_name(self) -> &'static str {
        match self {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => "INFO ",
            Level::Warn => "WARN ",
            Level::Error => "ERROR",
        }
    }
}

impl From<log::Level> for Level {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Error => Level::Error,
            log::Level::Warn => Level::Warn,
            log::Level::Info => Level::Info,
            log::Level::Debug => Level::Debug,
            log::Level::Trace => Level::Trace,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.formatted_name().trim_end())
    }
}

/// Insertion-ordered string map snapshotted from the diagnostic context.
///
/// Entries are kept in a vector: contexts hold a handful of keys, and the
/// wire format needs a stable iteration order anyway.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    entries: Vec<(Arc<str>, Arc<str>)>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Inserts or replaces a value. A replaced key keeps its original position.
    pub fn insert(&mut self, key: impl Into<Arc<str>>, value: impl Into<Arc<str>>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Arc<str>> {
        self.entries
            .iter()
            .find(|(k, _)| &**k == key)
            .map(|(_, v)| v)
    }

    pub fn remove(&mut self, key: &str) -> Option<Arc<str>> {
        let pos = self.entries.iter().position(|(k, _)| &**k == key)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = (&Arc<str>, &Arc<str>)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    pub(crate) fn entry(&self, index: usize) -> Option<&(Arc<str>, Arc<str>)> {
        self.entries.get(index)
    }
}

impl<K: Into<Arc<str>>, V: Into<Arc<str>>> FromIterator<(K, V)> for Context {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut context = Context::new();
        for (k, v) in iter {
            context.insert(k, v);
        }
        context
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (k, v)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={}", k, v)?;
        }
        f.write_str("}")
    }
}

/// Metadata of one log event; the message text travels separately.
///
/// `Default` exists so a queue slot can be cleared with [`std::mem::take`],
/// which drops every reference the slot held.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogRecord {
    pub timestamp_millis: i64,
    pub level: Level,
    /// `None` and an empty context are both encoded as a zero entry count.
    pub context: Option<Context>,
    pub thread_name: Option<Arc<str>>,
    /// Pre-rendered error chain or backtrace.
    pub exception_text: Option<Arc<str>>,
}

impl LogRecord {
    pub fn new(timestamp_millis: i64, level: Level) -> Self {
        Self {
            timestamp_millis,
            level,
            ..Self::default()
        }
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.thread_name = Some(name.into());
        self
    }

    pub fn with_exception_text(mut self, text: impl Into<Arc<str>>) -> Self {
        self.exception_text = Some(text.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordinals_are_stable() {
        for (i, level) in Level::ALL.iter().enumerate() {
            assert_eq!(level.ordinal() as usize, i);
            assert_eq!(Level::from_ordinal(i as u8), Some(*level));
        }
        assert_eq!(Level::from_ordinal(5), None);
        assert!(Level::Trace < Level::Error);
    }

    #[test]
    fn test_level_from_log_level() {
        assert_eq!(Level::from(log::Level::Warn), Level::Warn);
        assert_eq!(Level::from(log::Level::Trace), Level::Trace);
        assert_eq!(Level::Info.formatted_name(), "INFO ");
        assert_eq!(Level::Info.to_string(), "INFO");
    }

    #[test]
    fn test_context_keeps_insertion_order() {
        let mut context = Context::new();
        context.insert("b", "1");
        context.insert("a", "2");
        context.insert("b", "3");

        let keys: Vec<&str> = context.iter().map(|(k, _)| &**k).collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert_eq!(context.get("b").map(|v| &**v), Some("3"));
        assert_eq!(context.to_string(), "{b=3, a=2}");

        assert_eq!(context.remove("b").as_deref(), Some("3"));
        assert_eq!(context.len(), 1);
        assert!(context.remove("missing").is_none());
    }
}
