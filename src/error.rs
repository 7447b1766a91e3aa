use std::io;

use crate::codec::Frame;

/// Protocol and character-encoding faults raised by the wire codec.
///
/// None of these are retried: a decoder that returns one of them has seen a
/// corrupt stream, and an encoder that returns one has been driven out of
/// order or handed text it cannot represent.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("negative context entry count: {0}")]
    NegativeMapCount(i32),
    #[error("negative payload length: {0}")]
    NegativePayloadLength(i32),
    #[error("invalid level ordinal: {0}")]
    InvalidLevel(u8),
    #[error("length {0} does not fit the wire format")]
    LengthOverflow(usize),
    #[error("payload is not valid utf-8")]
    InvalidUtf8,
    #[error("two-byte string contains an unpaired surrogate")]
    InvalidUtf16,
    #[error("chunk of {actual} bytes contradicts {remaining} remaining payload bytes (last: {last})")]
    ChunkLengthMismatch {
        last: bool,
        actual: usize,
        remaining: usize,
    },
    #[error("payload chunk supplied while no payload is expected")]
    UnexpectedChunk,
    #[error("record started before the previous record completed")]
    RecordInProgress,
    #[error("stream ended in the middle of a record")]
    TruncatedRecord,
    #[error("frame {0:?} resumed but it is not the innermost suspended field")]
    NotSuspended(Frame),
    #[error("record continued while frame {0:?} is still suspended")]
    FramePending(Frame),
}

/// Crate-wide error: codec faults plus whatever a sink or chunk writer hits on I/O.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Reports an internal fault on stderr.
///
/// The crate is the logging backend itself, so it cannot log its own failures
/// through the `log` facade without feeding them back into its own queue.
pub(crate) fn report(what: &str, err: &dyn std::fmt::Display) {
    eprintln!("ledgerlog: {}: {}", what, err);
}
