//! `log` facade backend feeding the queue engine.
//!
//! # Architecture
//!
//! ```text
//! [Producer Threads] → [Logger] → [LogQueue] → [consumer thread] → [Sink]
//!       ↓                 ↓            ↓                              ↓
//!   log macros       format args,   slot + text    header, then     stream,
//!                    snapshot MDC   rings          payload chunks   encoder, ...
//! ```
//!
//! The producer does the formatting: message arguments are rendered into a
//! pooled buffer and copied into the text ring, so nothing that borrows from
//! the caller outlives the log call. Timestamps are taken at call time with
//! millisecond resolution, the resolution the wire format carries.

use std::cell::OnceCell;
use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;

use crate::mdc;
use crate::pool::BufferPool;
use crate::queue::LogQueue;
use crate::record::LogRecord;
use crate::sink::Sink;

/// How long [`log::Log::flush`] waits for in-flight records.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

thread_local! {
    /// The thread name never changes once a thread runs, so it is resolved once.
    static THREAD_NAME: OnceCell<Option<Arc<str>>> = const { OnceCell::new() };
}

fn current_thread_name() -> Option<Arc<str>> {
    THREAD_NAME.with(|cell| {
        cell.get_or_init(|| std::thread::current().name().map(Arc::from))
            .clone()
    })
}

/// Epoch milliseconds.
pub(crate) fn now_millis() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Logger installed into the `log` facade by [`crate::LedgerBuilder::build`].
pub struct Logger<S: Sink + Send + 'static> {
    queue: Arc<LogQueue<S>>,
    buffers: BufferPool,

    /// Records above this level are dropped in `enabled()` before any
    /// formatting happens.
    max_level: log::LevelFilter,
}

impl<S: Sink + Send + 'static> Logger<S> {
    pub fn new(queue: Arc<LogQueue<S>>, max_level: log::LevelFilter) -> Self {
        let buffers = BufferPool::new(queue.slots(), queue.text_capacity());
        Self {
            queue,
            buffers,
            max_level,
        }
    }

    pub fn queue(&self) -> &Arc<LogQueue<S>> {
        &self.queue
    }

    /// Publishes a record carrying pre-rendered exception text, e.g. an error
    /// chain or a captured backtrace. The `log` macros have no slot for it.
    pub fn log_exception(&self, level: log::Level, message: &str, exception_text: &str) {
        if level > self.max_level {
            return;
        }
        let record = LogRecord {
            exception_text: Some(Arc::from(exception_text)),
            ..self.record(level)
        };
        self.queue.publish(record, message);
    }

    fn record(&self, level: log::Level) -> LogRecord {
        LogRecord {
            timestamp_millis: now_millis(),
            level: level.into(),
            context: mdc::snapshot(),
            thread_name: current_thread_name(),
            exception_text: None,
        }
    }
}

impl<S: Sink + Send + 'static> log::Log for Logger<S> {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    /// Hot path: format into a pooled buffer, publish, return the buffer.
    ///
    /// Blocks only when every queue slot is in flight.
    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let entry = self.record(record.level());
        if let Some(literal) = record.args().as_str() {
            self.queue.publish(entry, literal);
            return;
        }

        let mut s = self.buffers.take();
        write!(s, "{}", record.args()).ok();
        self.queue.publish(entry, &s);
        self.buffers.give_back(s);
    }

    fn flush(&self) {
        self.queue.flush(FLUSH_TIMEOUT);
    }
}
