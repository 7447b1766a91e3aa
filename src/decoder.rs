//! Field decoders, the mirror of [`crate::encoder`].

use std::sync::Arc;

use crate::codec::{take, FieldDecoder, Step};
use crate::error::CodecError;
use crate::intern::StringInterner;
use crate::record::Context;

/// Upper bound on speculative string reservations; a corrupt length must not
/// translate into a huge allocation before any body byte has arrived.
const MAX_PREALLOC: usize = 64 * 1024;

/// Big-endian fixed-width value.
///
/// Bytes are shifted into an accumulator as they arrive, so a value split
/// across buffers needs no scratch copy.
#[derive(Debug, Default)]
pub struct FixedDecoder<const N: usize> {
    acc: u64,
    read: usize,
}

pub type ByteDecoder = FixedDecoder<1>;
pub type IntDecoder = FixedDecoder<4>;
pub type LongDecoder = FixedDecoder<8>;

impl<const N: usize> FixedDecoder<N> {
    pub fn new() -> Self {
        Self { acc: 0, read: 0 }
    }

    fn fill(&mut self, input: &mut &[u8]) -> Step {
        for &b in take(input, N - self.read) {
            self.acc = (self.acc << 8) | u64::from(b);
            self.read += 1;
        }
        if self.read == N {
            Step::Complete(input.len())
        } else {
            Step::Suspend
        }
    }

    fn take_acc(&mut self) -> u64 {
        let acc = self.acc;
        self.acc = 0;
        self.read = 0;
        acc
    }
}

macro_rules! fixed_decoder {
    ($n:literal, $ty:ty) => {
        impl FieldDecoder for FixedDecoder<$n> {
            type Value = $ty;

            fn reset(&mut self) {
                self.acc = 0;
                self.read = 0;
            }

            fn consume(&mut self, input: &mut &[u8]) -> Result<Step, CodecError> {
                Ok(self.fill(input))
            }

            fn take_value(&mut self) -> $ty {
                self.take_acc() as $ty
            }
        }
    };
}

fixed_decoder!(1, u8);
fixed_decoder!(4, i32);
fixed_decoder!(8, i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StringState {
    Length,
    Latin1(usize),
    Utf16(usize),
    Done,
}

/// Length-prefixed string in either compact form.
#[derive(Debug)]
pub struct StringDecoder {
    length: IntDecoder,
    state: StringState,
    latin1: String,
    units: Vec<u16>,
    /// High byte of a UTF-16 unit whose low byte is in the next buffer.
    half: Option<u8>,
    value: Option<Arc<str>>,
    interner: Option<Arc<StringInterner>>,
}

impl Default for StringDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StringDecoder {
    pub fn new() -> Self {
        Self {
            length: IntDecoder::new(),
            state: StringState::Length,
            latin1: String::new(),
            units: Vec::new(),
            half: None,
            value: None,
            interner: None,
        }
    }

    pub fn with_interner(interner: Arc<StringInterner>) -> Self {
        Self {
            interner: Some(interner),
            ..Self::new()
        }
    }

    fn complete(&mut self, text: &str) {
        self.value = Some(match &self.interner {
            Some(interner) => interner.intern(text),
            None => Arc::from(text),
        });
        self.state = StringState::Done;
    }
}

impl FieldDecoder for StringDecoder {
    type Value = Arc<str>;

    fn reset(&mut self) {
        self.length.reset();
        self.state = StringState::Length;
        self.latin1.clear();
        self.units.clear();
        self.half = None;
        self.value = None;
    }

    fn consume(&mut self, input: &mut &[u8]) -> Result<Step, CodecError> {
        loop {
            match self.state {
                StringState::Length => {
                    if self.length.consume(input)?.is_suspend() {
                        return Ok(Step::Suspend);
                    }
                    let length = self.length.take_value();
                    if length < 0 {
                        let n = length.unsigned_abs() as usize;
                        self.latin1.clear();
                        self.latin1.reserve(n.min(MAX_PREALLOC));
                        self.state = StringState::Latin1(n);
                    } else if length > 0 {
                        let n = length as usize;
                        self.units.clear();
                        self.units.reserve(n.min(MAX_PREALLOC));
                        self.state = StringState::Utf16(n);
                    } else {
                        self.complete("");
                    }
                }
                StringState::Latin1(remaining) => {
                    let bytes = take(input, remaining);
                    self.latin1.extend(bytes.iter().map(|&b| char::from(b)));
                    let remaining = remaining - bytes.len();
                    if remaining > 0 {
                        self.state = StringState::Latin1(remaining);
                        return Ok(Step::Suspend);
                    }
                    let text = std::mem::take(&mut self.latin1);
                    self.complete(&text);
                    self.latin1 = text;
                }
                StringState::Utf16(mut remaining) => {
                    while remaining > 0 {
                        let Some((&b, rest)) = input.split_first() else {
                            self.state = StringState::Utf16(remaining);
                            return Ok(Step::Suspend);
                        };
                        *input = rest;
                        match self.half.take() {
                            None => self.half = Some(b),
                            Some(high) => {
                                self.units.push(u16::from_be_bytes([high, b]));
                                remaining -= 1;
                            }
                        }
                    }
                    let text =
                        String::from_utf16(&self.units).map_err(|_| CodecError::InvalidUtf16)?;
                    self.complete(&text);
                }
                StringState::Done => return Ok(Step::Complete(input.len())),
            }
        }
    }

    fn take_value(&mut self) -> Arc<str> {
        let value = self.value.take().unwrap_or_else(|| Arc::from(""));
        self.reset();
        value
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MapState {
    Count,
    Key(usize, usize),
    Value(usize, usize),
    Done,
}

/// Entry count followed by key/value string pairs.
///
/// A zero count decodes as `None`, a negative count is a protocol violation.
#[derive(Debug)]
pub struct MapDecoder {
    count: IntDecoder,
    entry: StringDecoder,
    state: MapState,
    key: Option<Arc<str>>,
    context: Option<Context>,
}

impl Default for MapDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl MapDecoder {
    pub fn new() -> Self {
        Self::with_entry_decoder(StringDecoder::new())
    }

    pub fn with_interner(interner: Arc<StringInterner>) -> Self {
        Self::with_entry_decoder(StringDecoder::with_interner(interner))
    }

    fn with_entry_decoder(entry: StringDecoder) -> Self {
        Self {
            count: IntDecoder::new(),
            entry,
            state: MapState::Count,
            key: None,
            context: None,
        }
    }

    /// Whether a suspension happened inside a key or value string.
    pub fn in_entry(&self) -> bool {
        matches!(self.state, MapState::Key(..) | MapState::Value(..))
    }

    /// Resumes only the key or value string in progress and stores it.
    pub fn resume_entry(&mut self, input: &mut &[u8]) -> Result<Step, CodecError> {
        let step = self.entry.consume(input)?;
        if let Step::Complete(_) = step {
            self.store_entry();
        }
        Ok(step)
    }

    fn store_entry(&mut self) {
        let text = self.entry.take_value();
        self.state = match self.state {
            MapState::Key(i, n) => {
                self.key = Some(text);
                MapState::Value(i, n)
            }
            MapState::Value(i, n) => {
                if let (Some(key), Some(context)) = (self.key.take(), self.context.as_mut()) {
                    context.insert(key, text);
                }
                if i + 1 < n {
                    MapState::Key(i + 1, n)
                } else {
                    MapState::Done
                }
            }
            state => state,
        };
    }
}

impl FieldDecoder for MapDecoder {
    type Value = Option<Context>;

    fn reset(&mut self) {
        self.count.reset();
        self.entry.reset();
        self.state = MapState::Count;
        self.key = None;
        self.context = None;
    }

    fn consume(&mut self, input: &mut &[u8]) -> Result<Step, CodecError> {
        loop {
            match self.state {
                MapState::Count => {
                    if self.count.consume(input)?.is_suspend() {
                        return Ok(Step::Suspend);
                    }
                    let count = self.count.take_value();
                    if count < 0 {
                        return Err(CodecError::NegativeMapCount(count));
                    }
                    let n = count as usize;
                    if n == 0 {
                        self.state = MapState::Done;
                    } else {
                        self.context = Some(Context::with_capacity(n.min(64)));
                        self.state = MapState::Key(0, n);
                    }
                }
                MapState::Key(..) | MapState::Value(..) => {
                    if self.entry.consume(input)?.is_suspend() {
                        return Ok(Step::Suspend);
                    }
                    self.store_entry();
                }
                MapState::Done => return Ok(Step::Complete(input.len())),
            }
        }
    }

    fn take_value(&mut self) -> Option<Context> {
        let context = self.context.take();
        self.reset();
        context
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_bytewise<D: FieldDecoder>(decoder: &mut D, bytes: &[u8]) -> D::Value {
        for (i, b) in bytes.iter().enumerate() {
            let mut input = std::slice::from_ref(b);
            let step = decoder.consume(&mut input).unwrap();
            if i + 1 < bytes.len() {
                assert_eq!(step, Step::Suspend);
            } else {
                assert_eq!(step, Step::Complete(0));
            }
        }
        decoder.take_value()
    }

    #[test]
    fn test_fixed_width_accumulates_across_buffers() {
        let mut long = LongDecoder::new();
        let value = decode_bytewise(&mut long, &(-1234567890123i64).to_be_bytes());
        assert_eq!(value, -1234567890123);

        let mut int = IntDecoder::new();
        let mut input = &[0x7F, 0xFF, 0xFF, 0xFF, 0xAA][..];
        assert_eq!(int.consume(&mut input).unwrap(), Step::Complete(1));
        assert_eq!(int.take_value(), i32::MAX);
        assert_eq!(input, &[0xAA]);
    }

    #[test]
    fn test_string_forms() {
        let mut s = StringDecoder::new();
        let latin1 = [0xFF, 0xFF, 0xFF, 0xFD, b'a', 0xE9, b'z'];
        assert_eq!(&*decode_bytewise(&mut s, &latin1), "aéz");

        let wide = [0, 0, 0, 3, 0xD8, 0x3D, 0xDE, 0x00, 0x20, 0xAC];
        assert_eq!(&*decode_bytewise(&mut s, &wide), "😀€");

        let mut input = &[0u8, 0, 0, 0][..];
        assert_eq!(s.consume(&mut input).unwrap(), Step::Complete(0));
        assert_eq!(&*s.take_value(), "");
    }

    #[test]
    fn test_unpaired_surrogate_is_rejected() {
        let mut s = StringDecoder::new();
        let mut input = &[0u8, 0, 0, 1, 0xD8, 0x00][..];
        assert_eq!(s.consume(&mut input), Err(CodecError::InvalidUtf16));
    }

    #[test]
    fn test_map_count_rules() {
        let mut map = MapDecoder::new();
        let mut input = &[0u8, 0, 0, 0][..];
        assert_eq!(map.consume(&mut input).unwrap(), Step::Complete(0));
        assert_eq!(map.take_value(), None);

        let mut input = &[0xFFu8, 0xFF, 0xFF, 0xFF][..];
        assert_eq!(map.consume(&mut input), Err(CodecError::NegativeMapCount(-1)));
    }

    #[test]
    fn test_map_entries_through_interner() {
        let interner = Arc::new(StringInterner::new(16));
        let mut map = MapDecoder::with_interner(interner.clone());
        let bytes = [
            0, 0, 0, 1, //
            0xFF, 0xFF, 0xFF, 0xFE, b'i', b'd', //
            0, 0, 0, 1, 0x00, b'7',
        ];
        let context = decode_bytewise(&mut map, &bytes).unwrap();
        assert_eq!(context.get("id").map(|v| &**v), Some("7"));

        let key = context.iter().next().map(|(k, _)| k.clone()).unwrap();
        assert!(Arc::ptr_eq(&key, &interner.intern("id")));
    }
}
