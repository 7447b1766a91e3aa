//! Resumable field codecs.
//!
//! A field unit reads or writes one wire field across any number of buffers.
//! Each call to `consume` advances the buffer past the bytes it used and
//! reports either [`Step::Complete`] with the bytes left in the buffer, or
//! [`Step::Suspend`] when the buffer ran out first. A suspended unit keeps its
//! partial state and picks up at the exact byte on the next call.
//!
//! Record-level codecs compose units and record every suspension as a
//! [`Frame`] on a caller-owned stack. Drivers resume the top frame first, so
//! the innermost unsuspended field finishes before its enclosing field
//! continues. Nothing recurses across buffer boundaries.

use crate::error::CodecError;

/// Outcome of a `consume` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The field finished; this many bytes are still unused in the buffer.
    Complete(usize),
    /// The buffer is exhausted and the field is not.
    Suspend,
}

impl Step {
    #[inline]
    pub fn is_suspend(self) -> bool {
        matches!(self, Step::Suspend)
    }
}

/// A suspended record field, pushed by a record codec and popped by its driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    Flags,
    Timestamp,
    /// The context map as a whole.
    Context,
    /// The key or value string currently in progress inside the context map.
    /// Always sits above a [`Frame::Context`].
    ContextEntry,
    ThreadName,
    ExceptionText,
    PayloadLength,
}

/// Writes one field into successive output buffers.
pub trait FieldEncoder {
    /// Forgets any partially written value.
    fn reset(&mut self);

    fn consume(&mut self, out: &mut &mut [u8]) -> Result<Step, CodecError>;
}

/// Reads one field from successive input buffers.
pub trait FieldDecoder {
    type Value;

    /// Forgets any partially read value.
    fn reset(&mut self);

    fn consume(&mut self, input: &mut &[u8]) -> Result<Step, CodecError>;

    /// Hands out the completed value and readies the unit for the next field.
    fn take_value(&mut self) -> Self::Value;
}

/// Splits up to `n` bytes off the front of `input`.
#[inline]
pub(crate) fn take<'a>(input: &mut &'a [u8], n: usize) -> &'a [u8] {
    let (head, tail) = input.split_at(n.min(input.len()));
    *input = tail;
    head
}

/// Copies as much of `src` as fits into `out` and advances `out` past it.
#[inline]
pub(crate) fn put(out: &mut &mut [u8], src: &[u8]) -> usize {
    let n = src.len().min(out.len());
    let (head, tail) = std::mem::take(out).split_at_mut(n);
    head.copy_from_slice(&src[..n]);
    *out = tail;
    n
}
