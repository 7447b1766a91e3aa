//! Drivers that move records between a [`Sink`] and a byte stream.
//!
//! [`EncodingSink`] is itself a sink: put it behind a [`crate::LogQueue`] and
//! every drained record is encoded into chunks of a [`ChunkWriter`].
//! [`Receiver`] is the other end, fed raw bytes in whatever pieces the
//! transport delivers and replaying complete records into any sink.

use std::io;
use std::sync::Arc;

use crate::codec::{Frame, Step};
use crate::error::{CodecError, Error};
use crate::intern::StringInterner;
use crate::record::LogRecord;
use crate::record_codec::{RecordDecoder, RecordEncoder};
use crate::sink::Sink;

/// Default chunk size for [`StreamChunks`].
pub const DEFAULT_CHUNK_SIZE: usize = 8192;

/// Output side of the encoder: a sequence of fixed-size chunks.
pub trait ChunkWriter {
    /// Writable tail of the current chunk, starting a new chunk if the current
    /// one is full. Never empty.
    fn chunk(&mut self) -> io::Result<&mut [u8]>;

    /// Marks `n` bytes at the front of the last returned tail as written.
    fn advance(&mut self, n: usize);

    /// Called after each complete record.
    fn end_of_record(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()>;
}

/// [`ChunkWriter`] writing whole chunks to any [`io::Write`].
pub struct StreamChunks<W: io::Write> {
    wr: W,
    buf: Box<[u8]>,
    filled: usize,
}

impl<W: io::Write> StreamChunks<W> {
    pub fn new(wr: W) -> Self {
        Self::with_chunk_size(wr, DEFAULT_CHUNK_SIZE)
    }

    /// # Panics
    ///
    /// If `chunk_size` is zero.
    pub fn with_chunk_size(wr: W, chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk size must be positive");
        Self {
            wr,
            buf: vec![0; chunk_size].into_boxed_slice(),
            filled: 0,
        }
    }

    pub fn get_ref(&self) -> &W {
        &self.wr
    }

    /// The underlying writer. Bytes of the current chunk are not in it until
    /// [`ChunkWriter::flush`].
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.wr
    }

    /// Flushes buffered bytes and returns the writer.
    pub fn into_inner(mut self) -> io::Result<W> {
        ChunkWriter::flush(&mut self)?;
        Ok(self.wr)
    }
}

impl<W: io::Write> ChunkWriter for StreamChunks<W> {
    fn chunk(&mut self) -> io::Result<&mut [u8]> {
        if self.filled == self.buf.len() {
            self.wr.write_all(&self.buf)?;
            self.filled = 0;
        }
        Ok(&mut self.buf[self.filled..])
    }

    fn advance(&mut self, n: usize) {
        debug_assert!(self.filled + n <= self.buf.len());
        self.filled += n;
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.filled > 0 {
            self.wr.write_all(&self.buf[..self.filled])?;
            self.filled = 0;
        }
        self.wr.flush()
    }
}

/// A [`Sink`] that encodes each record onto a [`ChunkWriter`].
pub struct EncodingSink<W: ChunkWriter> {
    writer: W,
    encoder: RecordEncoder,
    stack: Vec<Frame>,
    records: u64,
}

impl<W: ChunkWriter> EncodingSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            encoder: RecordEncoder::new(),
            stack: Vec::with_capacity(4),
            records: 0,
        }
    }

    /// Records fully encoded so far.
    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    /// Push/pop driver for the header: frames first, innermost on top, then
    /// back into the record state machine.
    fn write_header(&mut self) -> Result<(), Error> {
        let Self {
            writer,
            encoder,
            stack,
            ..
        } = self;

        loop {
            let buf = writer.chunk()?;
            let total = buf.len();
            let mut out = buf;
            let done = loop {
                match stack.pop() {
                    Some(frame) => {
                        if encoder.resume(frame, &mut out, stack)?.is_suspend() {
                            break false;
                        }
                    }
                    None => break !encoder.consume(&mut out, stack)?.is_suspend(),
                }
            };
            let used = total - out.len();
            writer.advance(used);
            if done {
                return Ok(());
            }
        }
    }

    fn end_record(&mut self) -> Result<(), Error> {
        self.records += 1;
        self.writer.end_of_record()?;
        Ok(())
    }
}

impl<W: ChunkWriter> Sink for EncodingSink<W> {
    fn on_record_header(&mut self, payload_len: usize, record: LogRecord) -> Result<(), Error> {
        if !self.encoder.is_idle() {
            // the previous record failed mid-write and its bytes are already
            // out; drop it and carry on with this one
            crate::error::report(
                "abandoned partially encoded record",
                &CodecError::RecordInProgress,
            );
            self.encoder.reset();
            self.stack.clear();
        }
        self.encoder.init(payload_len, record)?;
        self.write_header()?;
        if self.encoder.is_idle() {
            self.end_record()?;
        }
        Ok(())
    }

    fn on_payload_chunk(&mut self, last: bool, chunk: &[u8]) -> Result<(), Error> {
        self.encoder.chunk(last, chunk.len())?;
        let mut data = chunk;
        loop {
            let buf = self.writer.chunk()?;
            let total = buf.len();
            let mut out = buf;
            let step = self.encoder.payload(&mut out, &mut data)?;
            let used = total - out.len();
            self.writer.advance(used);
            if let Step::Complete(_) = step {
                break;
            }
        }
        if last {
            self.end_record()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Decodes a byte stream of records into a [`Sink`].
///
/// Records may be split at any byte; `feed` returns as soon as its input is
/// used up and the next call continues at the exact byte.
pub struct Receiver<S: Sink> {
    decoder: RecordDecoder,
    stack: Vec<Frame>,
    sink: S,
}

impl<S: Sink> Receiver<S> {
    pub fn new(sink: S) -> Self {
        Self::with_decoder(sink, RecordDecoder::new())
    }

    /// Thread names and context entries are deduplicated through `interner`.
    pub fn with_interner(sink: S, interner: Arc<StringInterner>) -> Self {
        Self::with_decoder(sink, RecordDecoder::with_interner(interner))
    }

    fn with_decoder(sink: S, decoder: RecordDecoder) -> Self {
        Self {
            decoder,
            stack: Vec::with_capacity(4),
            sink,
        }
    }

    /// Decodes as much of `input` as possible.
    ///
    /// A partial field at the end of `input` is kept and completed by the
    /// next call; records are replayed into the sink as they complete.
    ///
    /// # Errors
    ///
    /// The first codec or sink error. The stream is not resynchronized
    /// afterwards, so a receiver that returned an error should be dropped.
    ///
    /// # Example
    ///
    /// ```rust, ignore
    /// let mut receiver = Receiver::new(StreamSink::new(std::io::stdout()));
    /// let mut buf = [0u8; 4096];
    /// loop {
    ///     let n = socket.read(&mut buf)?;
    ///     if n == 0 { break; }
    ///     receiver.feed(&buf[..n])?;
    /// }
    /// receiver.finish()?;
    /// ```
    pub fn feed(&mut self, mut input: &[u8]) -> Result<(), Error> {
        loop {
            if input.is_empty() && self.stack.is_empty() && self.decoder.is_idle() {
                return Ok(());
            }
            let step = match self.stack.pop() {
                Some(frame) => self.decoder.resume(frame, &mut input, &mut self.stack)?,
                None => self
                    .decoder
                    .consume(&mut input, &mut self.stack, &mut self.sink)?,
            };
            if step.is_suspend() {
                return Ok(());
            }
        }
    }

    /// Ends the stream. Fails if it stopped in the middle of a record.
    pub fn finish(&mut self) -> Result<(), Error> {
        if !self.stack.is_empty() || !self.decoder.is_idle() {
            self.stack.clear();
            self.decoder.reset();
            return Err(CodecError::TruncatedRecord.into());
        }
        self.sink.flush()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }
}
