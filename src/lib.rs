use std::{io, sync::Arc, time::Duration};

use log::LevelFilter;

mod codec;
mod config;
mod cursor;
mod decoder;
mod encoder;
mod error;
mod intern;
mod logger;
pub mod mdc;
pub(crate) mod pool;
mod queue;
mod record;
mod record_codec;
mod sink;
mod transport;
mod utf8;

pub use codec::{FieldDecoder, FieldEncoder, Frame, Step};
pub use config::{Config, ConfigError, Mode};
pub use decoder::{ByteDecoder, IntDecoder, LongDecoder, MapDecoder, StringDecoder};
pub use encoder::{ByteEncoder, IntEncoder, LongEncoder, MapEncoder, StringEncoder};
pub use error::{CodecError, Error};
pub use intern::StringInterner;
pub use logger::Logger;
pub use queue::{LogQueue, QueueOptions};
pub use record::{Context, Level, LogRecord};
pub use record_codec::{RecordDecoder, RecordEncoder, PAYLOAD_CHUNK_SIZE};
pub use sink::{Sink, StreamSink};
pub use transport::{ChunkWriter, EncodingSink, Receiver, StreamChunks};

/// Upper bound on how long dropping the guard waits for in-flight records.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Sink type behind the globally installed logger.
pub type BoxedSink = Box<dyn Sink + Send>;

/// Keeps the installed logger's queue reachable; dropping it drains and
/// flushes what has been published so far.
pub struct LedgerGuard {
    queue: Arc<LogQueue<BoxedSink>>,
}

impl LedgerGuard {
    pub fn queue(&self) -> &Arc<LogQueue<BoxedSink>> {
        &self.queue
    }

    /// Waits for in-flight records, then flushes the sink.
    pub fn flush(&self) -> bool {
        self.queue.flush(SHUTDOWN_TIMEOUT)
    }
}

impl Drop for LedgerGuard {
    fn drop(&mut self) {
        // the facade keeps the logger alive, so only wait and flush
        self.queue.flush(SHUTDOWN_TIMEOUT);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerBuilderError {
    #[error("no configured sink")]
    NoConfiguredSink,
    #[error("no configured log level")]
    NoConfiguredLogLevel,
    #[error("{what} must be a non-zero power of two, got {value}")]
    InvalidCapacity { what: &'static str, value: usize },
    #[error("{0}")]
    SetLoggerError(#[from] log::SetLoggerError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

pub struct LedgerBuilder {
    sink: Option<BoxedSink>,
    level: Option<LevelFilter>,
    options: QueueOptions,
}

impl Default for LedgerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LedgerBuilder {
    pub fn new() -> Self {
        Self {
            sink: None,
            level: None,
            options: QueueOptions::default(),
        }
    }

    /// Stream sink, level and sizing taken from `config`.
    pub fn from_config(config: &Config) -> Self {
        let sink: BoxedSink = match config.mode {
            Mode::Stdout => Box::new(StreamSink::new(io::BufWriter::new(io::stdout()))),
            Mode::Stderr => Box::new(StreamSink::new(io::stderr())),
        };
        Self {
            sink: Some(sink),
            level: Some(config.level),
            options: QueueOptions {
                slots: config.slots,
                text_capacity: config.text_capacity,
                idle_timeout: config.idle_timeout,
            },
        }
    }

    /// [`LedgerBuilder::from_config`] over [`Config::load`].
    pub fn from_env() -> Result<Self, LedgerBuilderError> {
        Ok(Self::from_config(&Config::load()?))
    }

    pub fn with_sink<S: Sink + Send + 'static>(mut self, sink: S) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn with_writer<W: io::Write + Send + 'static>(self, wr: W) -> Self {
        self.with_sink(StreamSink::new(wr))
    }

    pub fn with_log_level(mut self, level: LevelFilter) -> Self {
        self.level = Some(level);
        self
    }

    pub fn with_slots(mut self, slots: usize) -> Self {
        self.options.slots = slots;
        self
    }

    pub fn with_text_capacity(mut self, bytes: usize) -> Self {
        self.options.text_capacity = bytes;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.options.idle_timeout = timeout;
        self
    }

    /// Installs the logger as the global `log` backend.
    pub fn build(self) -> Result<LedgerGuard, LedgerBuilderError> {
        let sink = self.sink.ok_or(LedgerBuilderError::NoConfiguredSink)?;
        let level = self.level.ok_or(LedgerBuilderError::NoConfiguredLogLevel)?;
        check_capacity("slots", self.options.slots)?;
        check_capacity("text capacity", self.options.text_capacity)?;

        let queue = LogQueue::new(sink, self.options);
        log::set_boxed_logger(Box::new(Logger::new(queue.clone(), level)))?;
        log::set_max_level(level);

        Ok(LedgerGuard { queue })
    }
}

fn check_capacity(what: &'static str, value: usize) -> Result<(), LedgerBuilderError> {
    if value.is_power_of_two() {
        Ok(())
    } else {
        Err(LedgerBuilderError::InvalidCapacity { what, value })
    }
}
