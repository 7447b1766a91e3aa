//! Sink contract and the stream adapter installed by the builder.

use std::io;

use crate::error::Error;
use crate::record::LogRecord;

/// ISO 8601 timestamp with millisecond precision, the resolution records carry.
///
/// Format: `2024-01-15T14:30:45.123Z`
const ISO8601_MILLIS: &[time::format_description::FormatItem<'static>] =
    time::macros::format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z"
    );

/// Receiver of decoded records.
///
/// For each record the sink sees exactly one [`Sink::on_record_header`] call,
/// followed by payload chunks whose lengths sum to `payload_len`. The final
/// chunk carries `last = true`; a record with `payload_len == 0` gets no chunk
/// calls at all. A chunk boundary may split a multi-byte UTF-8 sequence, the
/// concatenation of a record's chunks is always valid UTF-8.
///
/// Errors are the sink's own to report; callers never retry a failed call.
pub trait Sink {
    fn on_record_header(&mut self, payload_len: usize, record: LogRecord) -> Result<(), Error>;

    fn on_payload_chunk(&mut self, last: bool, chunk: &[u8]) -> Result<(), Error>;

    fn flush(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn on_record_header(&mut self, payload_len: usize, record: LogRecord) -> Result<(), Error> {
        (**self).on_record_header(payload_len, record)
    }

    fn on_payload_chunk(&mut self, last: bool, chunk: &[u8]) -> Result<(), Error> {
        (**self).on_payload_chunk(last, chunk)
    }

    fn flush(&mut self) -> Result<(), Error> {
        (**self).flush()
    }
}

/// Human-readable line output to any writer.
///
/// ```text
/// [2021-07-29T01:02:03.000Z] INFO  (worker-1) {request=42} Hello, World!
/// ```
///
/// Exception text, when present, follows the line verbatim.
pub struct StreamSink<W: io::Write> {
    wr: W,
    /// Held back until the message line is complete.
    exception_text: Option<std::sync::Arc<str>>,
}

impl<W: io::Write> StreamSink<W> {
    pub fn new(wr: W) -> Self {
        Self {
            wr,
            exception_text: None,
        }
    }

    pub fn get_ref(&self) -> &W {
        &self.wr
    }

    pub fn into_inner(self) -> W {
        self.wr
    }

    fn write_prefix(&mut self, record: &LogRecord) -> io::Result<()> {
        self.wr.write_all(b"[")?;
        match time::OffsetDateTime::from_unix_timestamp_nanos(
            record.timestamp_millis as i128 * 1_000_000,
        ) {
            Ok(ts) => {
                ts.format_into(&mut self.wr, &ISO8601_MILLIS)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            }
            Err(_) => write!(self.wr, "{}ms", record.timestamp_millis)?,
        }
        write!(
            self.wr,
            "] {} ({}) ",
            record.level.formatted_name(),
            record.thread_name.as_deref().unwrap_or("-")
        )?;
        match &record.context {
            Some(context) => write!(self.wr, "{}", context),
            None => self.wr.write_all(b"{}"),
        }
    }

    fn write_exception(&mut self, text: Option<&str>) -> io::Result<()> {
        if let Some(text) = text {
            self.wr.write_all(text.as_bytes())?;
            if !text.ends_with('\n') {
                self.wr.write_all(b"\n")?;
            }
        }
        Ok(())
    }
}

impl<W: io::Write> Sink for StreamSink<W> {
    fn on_record_header(&mut self, payload_len: usize, record: LogRecord) -> Result<(), Error> {
        self.write_prefix(&record)?;
        if payload_len == 0 {
            self.wr.write_all(b"\n")?;
            self.write_exception(record.exception_text.as_deref())?;
        } else {
            self.wr.write_all(b" ")?;
            self.exception_text = record.exception_text;
        }
        Ok(())
    }

    fn on_payload_chunk(&mut self, last: bool, chunk: &[u8]) -> Result<(), Error> {
        self.wr.write_all(chunk)?;
        if last {
            self.wr.write_all(b"\n")?;
            let text = self.exception_text.take();
            self.write_exception(text.as_deref())?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.wr.flush()?;
        Ok(())
    }
}
