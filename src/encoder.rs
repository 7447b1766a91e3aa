//! Field encoders: fixed-width integers, compact strings, string maps.

use crate::codec::{put, FieldEncoder, Step};
use crate::error::CodecError;
use crate::record::Context;

/// Big-endian fixed-width value, written byte by byte across buffers.
#[derive(Debug)]
pub struct FixedEncoder<const N: usize> {
    bytes: [u8; N],
    written: usize,
}

pub type ByteEncoder = FixedEncoder<1>;
pub type IntEncoder = FixedEncoder<4>;
pub type LongEncoder = FixedEncoder<8>;

impl<const N: usize> FixedEncoder<N> {
    pub fn new() -> Self {
        Self {
            bytes: [0; N],
            written: 0,
        }
    }

    fn set_bytes(&mut self, bytes: [u8; N]) {
        self.bytes = bytes;
        self.written = 0;
    }

    pub fn is_complete(&self) -> bool {
        self.written == N
    }
}

impl<const N: usize> Default for FixedEncoder<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteEncoder {
    pub fn set(&mut self, value: u8) {
        self.set_bytes([value]);
    }
}

impl IntEncoder {
    pub fn set(&mut self, value: i32) {
        self.set_bytes(value.to_be_bytes());
    }
}

impl LongEncoder {
    pub fn set(&mut self, value: i64) {
        self.set_bytes(value.to_be_bytes());
    }
}

impl<const N: usize> FieldEncoder for FixedEncoder<N> {
    fn reset(&mut self) {
        self.written = 0;
    }

    fn consume(&mut self, out: &mut &mut [u8]) -> Result<Step, CodecError> {
        self.written += put(out, &self.bytes[self.written..]);
        if self.is_complete() {
            Ok(Step::Complete(out.len()))
        } else {
            Ok(Step::Suspend)
        }
    }
}

/// Length-prefixed string in the compact two-encoding form.
///
/// Strings made only of chars up to `U+00FF` are written as one byte per char
/// behind a negative length; anything else is written as big-endian UTF-16
/// code units behind a positive length.
#[derive(Debug, Default)]
pub struct StringEncoder {
    length: IntEncoder,
    /// Rendered body, reused across values.
    body: Vec<u8>,
    offset: usize,
}

impl StringEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, value: &str) -> Result<(), CodecError> {
        self.body.clear();
        self.offset = 0;

        let length = if value.chars().all(|c| (c as u32) <= 0xFF) {
            self.body.extend(value.chars().map(|c| c as u32 as u8));
            let n = self.body.len();
            -i32::try_from(n).map_err(|_| CodecError::LengthOverflow(n))?
        } else {
            for unit in value.encode_utf16() {
                self.body.extend_from_slice(&unit.to_be_bytes());
            }
            let n = self.body.len() / 2;
            i32::try_from(n).map_err(|_| CodecError::LengthOverflow(n))?
        };
        self.length.set(length);
        Ok(())
    }
}

impl FieldEncoder for StringEncoder {
    fn reset(&mut self) {
        self.length.reset();
        self.offset = 0;
    }

    fn consume(&mut self, out: &mut &mut [u8]) -> Result<Step, CodecError> {
        if !self.length.is_complete() && self.length.consume(out)?.is_suspend() {
            return Ok(Step::Suspend);
        }
        self.offset += put(out, &self.body[self.offset..]);
        if self.offset == self.body.len() {
            Ok(Step::Complete(out.len()))
        } else {
            Ok(Step::Suspend)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MapState {
    Count,
    Key(usize),
    Value(usize),
    Done,
}

/// Entry count followed by key/value string pairs in insertion order.
///
/// An absent context and an empty one both encode as a zero count.
#[derive(Debug)]
pub struct MapEncoder {
    count: IntEncoder,
    entry: StringEncoder,
    context: Context,
    state: MapState,
}

impl Default for MapEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl MapEncoder {
    pub fn new() -> Self {
        Self {
            count: IntEncoder::new(),
            entry: StringEncoder::new(),
            context: Context::new(),
            state: MapState::Done,
        }
    }

    pub fn set(&mut self, context: Option<Context>) -> Result<(), CodecError> {
        self.context = context.unwrap_or_default();
        let n = self.context.len();
        self.count
            .set(i32::try_from(n).map_err(|_| CodecError::LengthOverflow(n))?);
        self.state = MapState::Count;
        Ok(())
    }

    /// Whether a suspension happened inside a key or value string.
    pub fn in_entry(&self) -> bool {
        matches!(self.state, MapState::Key(_) | MapState::Value(_))
    }

    /// Resumes only the key or value string in progress, then steps to the
    /// next string without writing it.
    pub fn resume_entry(&mut self, out: &mut &mut [u8]) -> Result<Step, CodecError> {
        match self.entry.consume(out)? {
            Step::Suspend => Ok(Step::Suspend),
            Step::Complete(remaining) => {
                self.advance()?;
                Ok(Step::Complete(remaining))
            }
        }
    }

    fn advance(&mut self) -> Result<(), CodecError> {
        let n = self.context.len();
        self.state = match self.state {
            MapState::Count if n > 0 => MapState::Key(0),
            MapState::Key(i) => MapState::Value(i),
            MapState::Value(i) if i + 1 < n => MapState::Key(i + 1),
            _ => MapState::Done,
        };
        match self.state {
            MapState::Key(i) => {
                if let Some((key, _)) = self.context.entry(i) {
                    self.entry.set(key)?;
                }
            }
            MapState::Value(i) => {
                if let Some((_, value)) = self.context.entry(i) {
                    self.entry.set(value)?;
                }
            }
            MapState::Count | MapState::Done => {}
        }
        Ok(())
    }
}

impl FieldEncoder for MapEncoder {
    fn reset(&mut self) {
        self.count.reset();
        self.entry.reset();
        self.context.clear();
        self.state = MapState::Done;
    }

    fn consume(&mut self, out: &mut &mut [u8]) -> Result<Step, CodecError> {
        loop {
            let step = match self.state {
                MapState::Count => self.count.consume(out)?,
                MapState::Key(_) | MapState::Value(_) => self.entry.consume(out)?,
                MapState::Done => {
                    self.context.clear();
                    return Ok(Step::Complete(out.len()));
                }
            };
            if step.is_suspend() {
                return Ok(Step::Suspend);
            }
            self.advance()?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_all<E: FieldEncoder>(encoder: &mut E) -> Vec<u8> {
        let mut storage = [0u8; 256];
        let mut out = &mut storage[..];
        let step = encoder.consume(&mut out).unwrap();
        let remaining = out.len();
        assert_eq!(step, Step::Complete(remaining));
        storage[..256 - remaining].to_vec()
    }

    fn encode_bytewise<E: FieldEncoder>(encoder: &mut E) -> Vec<u8> {
        let mut bytes = Vec::new();
        loop {
            let mut storage = [0u8; 1];
            let mut out = &mut storage[..];
            let step = encoder.consume(&mut out).unwrap();
            if out.is_empty() {
                bytes.push(storage[0]);
            }
            if let Step::Complete(_) = step {
                return bytes;
            }
        }
    }

    #[test]
    fn test_fixed_width_is_big_endian() {
        let mut long = LongEncoder::new();
        long.set(0x0102_0304_0506_0708);
        assert_eq!(encode_all(&mut long), vec![1, 2, 3, 4, 5, 6, 7, 8]);

        let mut int = IntEncoder::new();
        int.set(-2);
        assert_eq!(encode_bytewise(&mut int), vec![0xFF, 0xFF, 0xFF, 0xFE]);
    }

    #[test]
    fn test_latin1_string_uses_negative_length() {
        let mut s = StringEncoder::new();
        s.set("café").unwrap();
        assert_eq!(
            encode_all(&mut s),
            vec![0xFF, 0xFF, 0xFF, 0xFC, b'c', b'a', b'f', 0xE9]
        );
    }

    #[test]
    fn test_wide_string_uses_utf16_units() {
        let mut s = StringEncoder::new();
        s.set("a€").unwrap();
        assert_eq!(encode_bytewise(&mut s), vec![0, 0, 0, 2, 0x00, 0x61, 0x20, 0xAC]);

        s.set("").unwrap();
        assert_eq!(encode_all(&mut s), vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_map_writes_entries_in_order() {
        let mut map = MapEncoder::new();
        map.set(Some(Context::from_iter([("k", "v"), ("a", "b")])))
            .unwrap();
        let expected = vec![
            0, 0, 0, 2, //
            0xFF, 0xFF, 0xFF, 0xFF, b'k', //
            0xFF, 0xFF, 0xFF, 0xFF, b'v', //
            0xFF, 0xFF, 0xFF, 0xFF, b'a', //
            0xFF, 0xFF, 0xFF, 0xFF, b'b',
        ];
        assert_eq!(encode_bytewise(&mut map), expected);

        map.set(None).unwrap();
        assert_eq!(encode_all(&mut map), vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_map_entry_can_be_resumed_alone() {
        let mut map = MapEncoder::new();
        map.set(Some(Context::from_iter([("key", "value")]))).unwrap();

        let mut storage = [0u8; 6];
        let mut out = &mut storage[..];
        assert_eq!(map.consume(&mut out).unwrap(), Step::Suspend);
        assert!(map.in_entry());

        let mut storage = [0u8; 64];
        let mut out = &mut storage[..];
        assert!(matches!(map.resume_entry(&mut out).unwrap(), Step::Complete(_)));
        assert!(map.in_entry());
        assert!(matches!(map.consume(&mut out).unwrap(), Step::Complete(_)));
        assert!(!map.in_entry());
    }
}
