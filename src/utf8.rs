//! Incremental UTF-8 validation for payload bytes.

use crate::error::CodecError;

/// Validates a byte stream piece by piece.
///
/// A multi-byte sequence split across pieces is held back until its
/// continuation bytes arrive; at most three bytes are ever pending.
#[derive(Debug, Default)]
pub(crate) struct Utf8Validator {
    pending: [u8; 4],
    len: usize,
}

impl Utf8Validator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn feed(&mut self, mut bytes: &[u8]) -> Result<(), CodecError> {
        while self.len > 0 {
            let Some((&b, rest)) = bytes.split_first() else {
                return Ok(());
            };
            bytes = rest;
            self.pending[self.len] = b;
            self.len += 1;
            match std::str::from_utf8(&self.pending[..self.len]) {
                Ok(_) => self.len = 0,
                Err(e) if e.error_len().is_some() => return Err(CodecError::InvalidUtf8),
                Err(_) if self.len == self.pending.len() => return Err(CodecError::InvalidUtf8),
                Err(_) => {}
            }
        }

        match std::str::from_utf8(bytes) {
            Ok(_) => Ok(()),
            Err(e) if e.error_len().is_some() => Err(CodecError::InvalidUtf8),
            Err(e) => {
                let tail = &bytes[e.valid_up_to()..];
                self.pending[..tail.len()].copy_from_slice(tail);
                self.len = tail.len();
                Ok(())
            }
        }
    }

    /// Ends the stream; a dangling partial sequence is an error.
    pub(crate) fn finish(&mut self) -> Result<(), CodecError> {
        let dangling = self.len > 0;
        self.len = 0;
        if dangling {
            Err(CodecError::InvalidUtf8)
        } else {
            Ok(())
        }
    }

    pub(crate) fn reset(&mut self) {
        self.len = 0;
    }
}
