//! Record-level state machines over the field codecs.
//!
//! Wire layout, big-endian:
//!
//! ```text
//! flags: u8            bits 0-2 level ordinal, bit 3 thread name, bit 4 exception
//! timestamp: i64
//! context: i32 count, then count x (key, value) strings
//! [thread name]        iff bit 3
//! [exception text]     iff bit 4
//! payload length: i32  UTF-8 bytes
//! payload              streamed in chunks
//! ```
//!
//! Both codecs step `Flags -> Timestamp -> Context -> ThreadName ->
//! ExceptionText -> PayloadLength -> payload`, skipping absent optional
//! fields. When a field unit suspends the codec pushes a [`Frame`] and marks
//! the field parked; the driver pops frames and calls `resume` until the stack
//! is empty, then calls `consume` again, which collects the parked field and
//! moves on.

use std::sync::Arc;

use crate::codec::{FieldDecoder, FieldEncoder, Frame, Step};
use crate::decoder::{ByteDecoder, IntDecoder, LongDecoder, MapDecoder, StringDecoder};
use crate::encoder::{ByteEncoder, IntEncoder, LongEncoder, MapEncoder, StringEncoder};
use crate::error::{CodecError, Error};
use crate::intern::StringInterner;
use crate::record::{Level, LogRecord};
use crate::sink::Sink;
use crate::utf8::Utf8Validator;

/// Largest payload chunk the decoder hands to its sink.
pub const PAYLOAD_CHUNK_SIZE: usize = 8192;

const LEVEL_MASK: u8 = 0x07;
const HAS_THREAD_NAME: u8 = 0x08;
const HAS_EXCEPTION: u8 = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Flags,
    Timestamp,
    Context,
    ThreadName,
    ExceptionText,
    PayloadLength,
    /// Encoder only: header written, waiting for `chunk`.
    AwaitChunk,
    Payload,
    /// Encoder only: no record in progress.
    Idle,
}

/// Tracks the frames a record codec has pushed and not yet seen resumed, so
/// a driver that pops the wrong frame gets an error instead of a field that
/// silently swallows the next bytes of the stream.
#[derive(Debug, Default)]
struct Suspended {
    /// Record-level field waiting to be resumed.
    field: Option<Frame>,
    /// A [`Frame::ContextEntry`] sits above the field frame.
    entry: bool,
}

impl Suspended {
    /// Pushes `frame`, plus the map entry frame when the context map stopped
    /// inside a string.
    fn push(&mut self, frame: Frame, in_entry: bool, stack: &mut Vec<Frame>) {
        stack.push(frame);
        match frame {
            Frame::ContextEntry => self.entry = true,
            Frame::Context if in_entry => {
                self.field = Some(frame);
                self.entry = true;
                stack.push(Frame::ContextEntry);
            }
            _ => self.field = Some(frame),
        }
    }

    fn innermost(&self) -> Option<Frame> {
        if self.entry {
            Some(Frame::ContextEntry)
        } else {
            self.field
        }
    }

    /// Accepts `frame` only if it is the innermost frame pushed.
    fn pop(&mut self, frame: Frame) -> Result<(), CodecError> {
        if self.innermost() != Some(frame) {
            return Err(CodecError::NotSuspended(frame));
        }
        if frame == Frame::ContextEntry {
            self.entry = false;
        } else {
            self.field = None;
        }
        Ok(())
    }

    /// Fails while any pushed frame has not been resumed.
    fn ensure_clear(&self) -> Result<(), CodecError> {
        match self.innermost() {
            Some(frame) => Err(CodecError::FramePending(frame)),
            None => Ok(()),
        }
    }
}

/// Runs an encoder unit unless it was already finished through the stack.
/// Returns `false` when the unit suspended and was parked.
fn encode_field<E: FieldEncoder>(
    unit: &mut E,
    parked: &mut bool,
    out: &mut &mut [u8],
) -> Result<bool, CodecError> {
    if std::mem::take(parked) {
        return Ok(true);
    }
    if unit.consume(out)?.is_suspend() {
        *parked = true;
        return Ok(false);
    }
    Ok(true)
}

/// Decoder counterpart of [`encode_field`]; yields the value once complete.
fn decode_field<D: FieldDecoder>(
    unit: &mut D,
    parked: &mut bool,
    input: &mut &[u8],
) -> Result<Option<D::Value>, CodecError> {
    if !std::mem::take(parked) && unit.consume(input)?.is_suspend() {
        *parked = true;
        return Ok(None);
    }
    Ok(Some(unit.take_value()))
}

/// Writes records to successive output buffers.
///
/// ```text
/// init(len, record) -> consume(out, stack)* -> [chunk(last, n) -> payload(out, data)*]*
/// ```
#[derive(Debug)]
pub struct RecordEncoder {
    state: State,
    parked: bool,
    suspended: Suspended,
    flags: ByteEncoder,
    timestamp: LongEncoder,
    context: MapEncoder,
    thread_name: StringEncoder,
    exception_text: StringEncoder,
    payload_len: IntEncoder,
    has_thread_name: bool,
    has_exception: bool,
    /// Payload bytes not yet written.
    remaining: usize,
    /// Bytes of the current chunk not yet written.
    chunk_remaining: usize,
    last: bool,
    utf8: Utf8Validator,
}

impl Default for RecordEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordEncoder {
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            parked: false,
            suspended: Suspended::default(),
            flags: ByteEncoder::new(),
            timestamp: LongEncoder::new(),
            context: MapEncoder::new(),
            thread_name: StringEncoder::new(),
            exception_text: StringEncoder::new(),
            payload_len: IntEncoder::new(),
            has_thread_name: false,
            has_exception: false,
            remaining: 0,
            chunk_remaining: 0,
            last: false,
            utf8: Utf8Validator::new(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state == State::Idle
    }

    /// Payload bytes still expected for the current record.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Starts a record whose payload will be `payload_len` UTF-8 bytes.
    ///
    /// Nothing is written yet; header fields go out through
    /// [`RecordEncoder::consume`].
    ///
    /// # Errors
    ///
    /// * [`CodecError::RecordInProgress`] - the previous record is unfinished
    /// * [`CodecError::LengthOverflow`] - the payload or a string field does
    ///   not fit a signed 32-bit length
    ///
    /// On error no record is started.
    pub fn init(&mut self, payload_len: usize, record: LogRecord) -> Result<(), CodecError> {
        if self.state != State::Idle {
            return Err(CodecError::RecordInProgress);
        }
        let length =
            i32::try_from(payload_len).map_err(|_| CodecError::LengthOverflow(payload_len))?;

        let LogRecord {
            timestamp_millis,
            level,
            context,
            thread_name,
            exception_text,
        } = record;

        self.has_thread_name = thread_name.is_some();
        self.has_exception = exception_text.is_some();
        let mut flags = level.ordinal();
        if let Some(name) = thread_name {
            self.thread_name.set(&name)?;
            flags |= HAS_THREAD_NAME;
        }
        if let Some(text) = exception_text {
            self.exception_text.set(&text)?;
            flags |= HAS_EXCEPTION;
        }
        self.context.set(context)?;
        self.flags.set(flags);
        self.timestamp.set(timestamp_millis);
        self.payload_len.set(length);

        self.remaining = payload_len;
        self.chunk_remaining = 0;
        self.parked = false;
        self.suspended = Suspended::default();
        self.utf8.reset();
        self.state = State::Flags;
        Ok(())
    }

    /// Writes header fields until the header is done or `out` is full.
    ///
    /// `Complete` means the header is fully written; the record then either
    /// waits for payload chunks or, with an empty payload, is finished.
    ///
    /// # Returns
    ///
    /// * `Step::Complete(n)` - header done, `n` bytes of `out` left
    /// * `Step::Suspend` - `out` filled up inside a field; the frames to
    ///   resume are on `stack`, innermost last
    ///
    /// # Errors
    ///
    /// [`CodecError::FramePending`] if called while a suspended frame has
    /// not been resumed.
    ///
    /// # Example
    ///
    /// ```rust, ignore
    /// loop {
    ///     let mut out = writer.chunk()?;
    ///     let done = loop {
    ///         match stack.pop() {
    ///             Some(frame) if encoder.resume(frame, &mut out, &mut stack)?.is_suspend() => break false,
    ///             Some(_) => {}
    ///             None => break !encoder.consume(&mut out, &mut stack)?.is_suspend(),
    ///         }
    ///     };
    ///     if done { break; }
    /// }
    /// ```
    pub fn consume(
        &mut self,
        out: &mut &mut [u8],
        stack: &mut Vec<Frame>,
    ) -> Result<Step, CodecError> {
        self.suspended.ensure_clear()?;
        loop {
            let (done, frame, next) = match self.state {
                State::Flags => (
                    encode_field(&mut self.flags, &mut self.parked, out)?,
                    Frame::Flags,
                    State::Timestamp,
                ),
                State::Timestamp => (
                    encode_field(&mut self.timestamp, &mut self.parked, out)?,
                    Frame::Timestamp,
                    State::Context,
                ),
                State::Context => (
                    encode_field(&mut self.context, &mut self.parked, out)?,
                    Frame::Context,
                    State::ThreadName,
                ),
                State::ThreadName if !self.has_thread_name => {
                    self.state = State::ExceptionText;
                    continue;
                }
                State::ThreadName => (
                    encode_field(&mut self.thread_name, &mut self.parked, out)?,
                    Frame::ThreadName,
                    State::ExceptionText,
                ),
                State::ExceptionText if !self.has_exception => {
                    self.state = State::PayloadLength;
                    continue;
                }
                State::ExceptionText => (
                    encode_field(&mut self.exception_text, &mut self.parked, out)?,
                    Frame::ExceptionText,
                    State::PayloadLength,
                ),
                State::PayloadLength => {
                    let next = if self.remaining > 0 {
                        State::AwaitChunk
                    } else {
                        State::Idle
                    };
                    (
                        encode_field(&mut self.payload_len, &mut self.parked, out)?,
                        Frame::PayloadLength,
                        next,
                    )
                }
                State::AwaitChunk | State::Payload | State::Idle => {
                    return Ok(Step::Complete(out.len()))
                }
            };

            if !done {
                self.suspended.push(frame, self.context.in_entry(), stack);
                return Ok(Step::Suspend);
            }
            self.state = next;
            if matches!(next, State::AwaitChunk | State::Idle) {
                return Ok(Step::Complete(out.len()));
            }
        }
    }

    /// Continues the field named by a popped frame.
    pub fn resume(
        &mut self,
        frame: Frame,
        out: &mut &mut [u8],
        stack: &mut Vec<Frame>,
    ) -> Result<Step, CodecError> {
        self.suspended.pop(frame)?;
        let step = match frame {
            Frame::Flags => self.flags.consume(out)?,
            Frame::Timestamp => self.timestamp.consume(out)?,
            Frame::Context => self.context.consume(out)?,
            Frame::ContextEntry => self.context.resume_entry(out)?,
            Frame::ThreadName => self.thread_name.consume(out)?,
            Frame::ExceptionText => self.exception_text.consume(out)?,
            Frame::PayloadLength => self.payload_len.consume(out)?,
        };
        if step.is_suspend() {
            self.suspended.push(frame, self.context.in_entry(), stack);
        }
        Ok(step)
    }

    /// Announces the next payload chunk of `len` bytes.
    ///
    /// The last chunk must cover exactly the remaining payload; any other
    /// chunk must leave at least one byte for a later chunk.
    ///
    /// # Errors
    ///
    /// * [`CodecError::UnexpectedChunk`] - the header is not finished, or
    ///   no payload is expected
    /// * [`CodecError::ChunkLengthMismatch`] - `len` breaks the rule above
    pub fn chunk(&mut self, last: bool, len: usize) -> Result<(), CodecError> {
        if self.state != State::AwaitChunk {
            return Err(CodecError::UnexpectedChunk);
        }
        let fits = if last {
            len == self.remaining
        } else {
            len < self.remaining
        };
        if !fits {
            return Err(CodecError::ChunkLengthMismatch {
                last,
                actual: len,
                remaining: self.remaining,
            });
        }
        self.chunk_remaining = len;
        self.last = last;
        self.state = State::Payload;
        Ok(())
    }

    /// Copies the announced chunk, advancing `data` past what was written.
    ///
    /// `data` must hold exactly the part of the chunk not yet written.
    /// Bytes are validated as UTF-8 across chunk boundaries; a code point
    /// may be split between chunks.
    ///
    /// # Returns
    ///
    /// `Step::Suspend` when `out` is full, `Step::Complete` once the chunk is
    /// written. After the last chunk the encoder is idle again.
    ///
    /// # Errors
    ///
    /// [`CodecError::InvalidUtf8`] on malformed text, or when the last chunk
    /// ends inside a code point.
    pub fn payload(&mut self, out: &mut &mut [u8], data: &mut &[u8]) -> Result<Step, CodecError> {
        if self.state != State::Payload {
            return Err(CodecError::UnexpectedChunk);
        }
        if data.len() != self.chunk_remaining {
            return Err(CodecError::ChunkLengthMismatch {
                last: self.last,
                actual: data.len(),
                remaining: self.chunk_remaining,
            });
        }

        let n = out.len().min(data.len());
        let (head, tail) = data.split_at(n);
        self.utf8.feed(head)?;
        crate::codec::put(out, head);
        *data = tail;
        self.chunk_remaining -= n;
        self.remaining -= n;

        if self.chunk_remaining > 0 {
            return Ok(Step::Suspend);
        }
        if self.last {
            self.utf8.finish()?;
            self.state = State::Idle;
        } else {
            self.state = State::AwaitChunk;
        }
        Ok(Step::Complete(out.len()))
    }

    /// Abandons the record in progress.
    pub fn reset(&mut self) {
        self.flags.reset();
        self.timestamp.reset();
        self.context.reset();
        self.thread_name.reset();
        self.exception_text.reset();
        self.payload_len.reset();
        self.utf8.reset();
        self.parked = false;
        self.suspended = Suspended::default();
        self.remaining = 0;
        self.chunk_remaining = 0;
        self.state = State::Idle;
    }
}

/// Reads records from successive input buffers and replays them into a [`Sink`].
#[derive(Debug)]
pub struct RecordDecoder {
    state: State,
    parked: bool,
    suspended: Suspended,
    flags: ByteDecoder,
    timestamp: LongDecoder,
    context: MapDecoder,
    thread_name: StringDecoder,
    exception_text: StringDecoder,
    payload_len: IntDecoder,
    bits: u8,
    record: LogRecord,
    /// Payload bytes not yet read from input.
    remaining: usize,
    chunk: Vec<u8>,
    utf8: Utf8Validator,
}

impl Default for RecordDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordDecoder {
    pub fn new() -> Self {
        Self::with_units(
            MapDecoder::new(),
            StringDecoder::new(),
            StringDecoder::new(),
        )
    }

    /// Decoded context entries and thread names go through `interner`.
    pub fn with_interner(interner: Arc<StringInterner>) -> Self {
        Self::with_units(
            MapDecoder::with_interner(interner.clone()),
            StringDecoder::with_interner(interner),
            StringDecoder::new(),
        )
    }

    fn with_units(context: MapDecoder, thread_name: StringDecoder, exception_text: StringDecoder) -> Self {
        Self {
            state: State::Flags,
            parked: false,
            suspended: Suspended::default(),
            flags: ByteDecoder::new(),
            timestamp: LongDecoder::new(),
            context,
            thread_name,
            exception_text,
            payload_len: IntDecoder::new(),
            bits: 0,
            record: LogRecord::default(),
            remaining: 0,
            chunk: Vec::with_capacity(PAYLOAD_CHUNK_SIZE),
            utf8: Utf8Validator::new(),
        }
    }

    /// Between records, with nothing partially read.
    pub fn is_idle(&self) -> bool {
        self.state == State::Flags && !self.parked
    }

    /// Reads until one record is complete or `input` is exhausted.
    ///
    /// The header reaches the sink as soon as the payload length is known;
    /// payload chunks follow as they fill up, at most
    /// [`PAYLOAD_CHUNK_SIZE`] bytes each.
    ///
    /// # Parameters
    ///
    /// * `input` - Advanced past every byte consumed.
    /// * `stack` - Receives the frames to resume when `input` runs out
    ///   inside a field; must be empty on entry.
    /// * `sink` - Gets the decoded header and payload chunks.
    ///
    /// # Errors
    ///
    /// Codec errors for a corrupt stream, [`CodecError::FramePending`] if a
    /// suspended frame was skipped, and whatever the sink returns.
    pub fn consume<S: Sink + ?Sized>(
        &mut self,
        input: &mut &[u8],
        stack: &mut Vec<Frame>,
        sink: &mut S,
    ) -> Result<Step, Error> {
        self.suspended.ensure_clear()?;
        loop {
            match self.state {
                State::Flags => {
                    let Some(bits) = decode_field(&mut self.flags, &mut self.parked, input)? else {
                        return Ok(self.suspend(Frame::Flags, stack));
                    };
                    let ordinal = bits & LEVEL_MASK;
                    self.record.level =
                        Level::from_ordinal(ordinal).ok_or(CodecError::InvalidLevel(ordinal))?;
                    self.bits = bits;
                    self.state = State::Timestamp;
                }
                State::Timestamp => {
                    let Some(ts) = decode_field(&mut self.timestamp, &mut self.parked, input)?
                    else {
                        return Ok(self.suspend(Frame::Timestamp, stack));
                    };
                    self.record.timestamp_millis = ts;
                    self.state = State::Context;
                }
                State::Context => {
                    let Some(context) = decode_field(&mut self.context, &mut self.parked, input)?
                    else {
                        return Ok(self.suspend(Frame::Context, stack));
                    };
                    self.record.context = context;
                    self.state = State::ThreadName;
                }
                State::ThreadName => {
                    if self.bits & HAS_THREAD_NAME != 0 {
                        let Some(name) =
                            decode_field(&mut self.thread_name, &mut self.parked, input)?
                        else {
                            return Ok(self.suspend(Frame::ThreadName, stack));
                        };
                        self.record.thread_name = Some(name);
                    }
                    self.state = State::ExceptionText;
                }
                State::ExceptionText => {
                    if self.bits & HAS_EXCEPTION != 0 {
                        let Some(text) =
                            decode_field(&mut self.exception_text, &mut self.parked, input)?
                        else {
                            return Ok(self.suspend(Frame::ExceptionText, stack));
                        };
                        self.record.exception_text = Some(text);
                    }
                    self.state = State::PayloadLength;
                }
                State::PayloadLength => {
                    let Some(length) = decode_field(&mut self.payload_len, &mut self.parked, input)?
                    else {
                        return Ok(self.suspend(Frame::PayloadLength, stack));
                    };
                    if length < 0 {
                        return Err(CodecError::NegativePayloadLength(length).into());
                    }
                    self.remaining = length as usize;
                    let record = std::mem::take(&mut self.record);
                    sink.on_record_header(self.remaining, record)?;
                    if self.remaining == 0 {
                        self.state = State::Flags;
                        return Ok(Step::Complete(input.len()));
                    }
                    self.utf8.reset();
                    self.chunk.clear();
                    self.state = State::Payload;
                }
                State::Payload => {
                    let room = PAYLOAD_CHUNK_SIZE - self.chunk.len();
                    let bytes = crate::codec::take(input, room.min(self.remaining));
                    self.utf8.feed(bytes)?;
                    self.chunk.extend_from_slice(bytes);
                    self.remaining -= bytes.len();

                    if self.remaining == 0 {
                        self.utf8.finish()?;
                        sink.on_payload_chunk(true, &self.chunk)?;
                        self.chunk.clear();
                        self.state = State::Flags;
                        return Ok(Step::Complete(input.len()));
                    }
                    if self.chunk.len() == PAYLOAD_CHUNK_SIZE {
                        sink.on_payload_chunk(false, &self.chunk)?;
                        self.chunk.clear();
                    } else {
                        return Ok(Step::Suspend);
                    }
                }
                State::AwaitChunk | State::Idle => {
                    self.state = State::Flags;
                }
            }
        }
    }

    fn suspend(&mut self, frame: Frame, stack: &mut Vec<Frame>) -> Step {
        self.suspended.push(frame, self.context.in_entry(), stack);
        Step::Suspend
    }

    /// Continues the field named by a popped frame.
    pub fn resume(
        &mut self,
        frame: Frame,
        input: &mut &[u8],
        stack: &mut Vec<Frame>,
    ) -> Result<Step, CodecError> {
        self.suspended.pop(frame)?;
        let step = match frame {
            Frame::Flags => self.flags.consume(input)?,
            Frame::Timestamp => self.timestamp.consume(input)?,
            Frame::Context => self.context.consume(input)?,
            Frame::ContextEntry => self.context.resume_entry(input)?,
            Frame::ThreadName => self.thread_name.consume(input)?,
            Frame::ExceptionText => self.exception_text.consume(input)?,
            Frame::PayloadLength => self.payload_len.consume(input)?,
        };
        if step.is_suspend() {
            self.suspended.push(frame, self.context.in_entry(), stack);
        }
        Ok(step)
    }

    /// Abandons the record in progress.
    pub fn reset(&mut self) {
        self.flags.reset();
        self.timestamp.reset();
        self.context.reset();
        self.thread_name.reset();
        self.exception_text.reset();
        self.payload_len.reset();
        self.utf8.reset();
        self.record = LogRecord::default();
        self.chunk.clear();
        self.parked = false;
        self.suspended = Suspended::default();
        self.remaining = 0;
        self.state = State::Flags;
    }
}
