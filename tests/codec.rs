use std::sync::Arc;

use ledgerlog::{
    ChunkWriter, CodecError, Context, EncodingSink, Error, FieldEncoder, Level, LogRecord,
    Receiver, Sink, StreamChunks, StringEncoder, PAYLOAD_CHUNK_SIZE,
};
use proptest::prelude::*;

#[derive(Default, Debug, PartialEq)]
struct Collect {
    records: Vec<(usize, LogRecord, Vec<u8>)>,
    chunk_sizes: Vec<usize>,
    lasts: usize,
}

impl Sink for Collect {
    fn on_record_header(&mut self, payload_len: usize, record: LogRecord) -> Result<(), Error> {
        self.records.push((payload_len, record, Vec::new()));
        Ok(())
    }

    fn on_payload_chunk(&mut self, last: bool, chunk: &[u8]) -> Result<(), Error> {
        if let Some((_, _, text)) = self.records.last_mut() {
            text.extend_from_slice(chunk);
        }
        self.chunk_sizes.push(chunk.len());
        self.lasts += last as usize;
        Ok(())
    }
}

fn full_record() -> LogRecord {
    LogRecord::new(1_234_567_890_123, Level::Error)
        .with_context(Context::from_iter([
            ("trace_id", "4bf92f3577b34da6"),
            ("city", "Zürich"),
            ("greeting", "こんにちは"),
        ]))
        .with_thread_name("tokio-runtime-worker")
        .with_exception_text("Error: connection reset\n\nCaused by:\n    0: peer went away ✗")
}

fn payload(len: usize) -> String {
    "The quick brown fox jumps over the lazy dog. "
        .chars()
        .cycle()
        .take(len)
        .collect()
}

/// Encodes records, handing the payload to the encoder in `piece`-sized chunks.
fn encode(records: &[(LogRecord, String)], chunk_size: usize, piece: usize) -> Vec<u8> {
    let mut sink = EncodingSink::new(StreamChunks::with_chunk_size(Vec::new(), chunk_size));
    for (record, text) in records {
        sink.on_record_header(text.len(), record.clone()).unwrap();
        let bytes = text.as_bytes();
        let mut start = 0;
        while start < bytes.len() {
            let end = (start + piece).min(bytes.len());
            sink.on_payload_chunk(end == bytes.len(), &bytes[start..end])
                .unwrap();
            start = end;
        }
    }
    sink.into_inner().into_inner().unwrap()
}

fn decode_in_pieces(bytes: &[u8], piece: usize) -> Collect {
    let mut receiver = Receiver::new(Collect::default());
    for part in bytes.chunks(piece.max(1)) {
        receiver.feed(part).unwrap();
    }
    receiver.finish().unwrap();
    receiver.into_sink()
}

#[test]
fn test_round_trip_across_chunk_size_boundaries() {
    for len in [0, 1, 8191, 8192, 8193, 70_000] {
        let text = payload(len);
        let records = vec![(full_record(), text.clone())];
        let bytes = encode(&records, 4096, 5000);

        let sink = decode_in_pieces(&bytes, 1 << 20);
        assert_eq!(sink.records.len(), 1, "payload {}", len);
        let (got_len, record, got_text) = &sink.records[0];
        assert_eq!(*got_len, len);
        assert_eq!(*record, full_record());
        assert_eq!(got_text, text.as_bytes());
        assert_eq!(sink.lasts, usize::from(len > 0));
        assert!(sink.chunk_sizes.iter().all(|&n| n <= PAYLOAD_CHUNK_SIZE));
        assert_eq!(sink.chunk_sizes.len(), len.div_ceil(PAYLOAD_CHUNK_SIZE));
    }
}

#[test]
fn test_byte_by_byte_matches_single_buffer() {
    let records = vec![
        (full_record(), payload(9000)),
        (LogRecord::new(0, Level::Trace), String::new()),
        (LogRecord::new(-1, Level::Warn).with_thread_name("ñ"), "½ ∞ 🚀".to_string()),
    ];
    let bytes = encode(&records, 8192, 8192);
    assert_eq!(encode(&records, 1, 3), bytes);

    let whole = decode_in_pieces(&bytes, bytes.len());
    let bytewise = decode_in_pieces(&bytes, 1);
    assert_eq!(whole.records, bytewise.records);
    assert_eq!(whole.lasts, 2);
    assert_eq!(bytewise.lasts, 2);
}

#[test]
fn test_string_compaction() {
    fn encoded(value: &str) -> Vec<u8> {
        let mut encoder = StringEncoder::new();
        encoder.set(value).unwrap();
        let mut storage = vec![0u8; 4 + 2 * value.len()];
        let mut out = &mut storage[..];
        encoder.consume(&mut out).unwrap();
        let remaining = out.len();
        let used = storage.len() - remaining;
        storage.truncate(used);
        storage
    }

    let latin1 = encoded("naïve café");
    assert_eq!(i32::from_be_bytes(latin1[..4].try_into().unwrap()), -10);
    assert_eq!(latin1.len(), 4 + 10);

    let wide = encoded("naïve café ₿");
    assert_eq!(i32::from_be_bytes(wide[..4].try_into().unwrap()), 12);
    assert_eq!(wide.len(), 4 + 2 * 12);
}

#[test]
fn test_corrupt_streams_fail_hard() {
    // negative context count
    let mut bytes = vec![Level::Info as u8];
    bytes.extend_from_slice(&0i64.to_be_bytes());
    bytes.extend_from_slice(&(-3i32).to_be_bytes());
    let mut receiver = Receiver::new(Collect::default());
    assert!(matches!(
        receiver.feed(&bytes),
        Err(Error::Codec(CodecError::NegativeMapCount(-3)))
    ));

    // payload that is not UTF-8
    let mut bytes = vec![Level::Info as u8];
    bytes.extend_from_slice(&0i64.to_be_bytes());
    bytes.extend_from_slice(&0i32.to_be_bytes());
    bytes.extend_from_slice(&2i32.to_be_bytes());
    bytes.extend_from_slice(&[0xF0, 0x28]);
    let mut receiver = Receiver::new(Collect::default());
    assert!(matches!(
        receiver.feed(&bytes),
        Err(Error::Codec(CodecError::InvalidUtf8))
    ));
}

#[test]
fn test_encoder_chunk_misuse() {
    let mut sink = EncodingSink::new(StreamChunks::new(Vec::new()));
    assert!(matches!(
        sink.on_payload_chunk(true, b"orphan"),
        Err(Error::Codec(CodecError::UnexpectedChunk))
    ));

    sink.on_record_header(4, LogRecord::default()).unwrap();
    assert!(matches!(
        sink.on_payload_chunk(true, b"abc"),
        Err(Error::Codec(CodecError::ChunkLengthMismatch {
            last: true,
            actual: 3,
            remaining: 4
        }))
    ));
    sink.on_payload_chunk(true, b"abcd").unwrap();
    assert_eq!(sink.records(), 1);
    sink.get_mut().flush().unwrap();
}

fn arb_text() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-z ]{0,40}",
        "[\\x{00}-\\x{ff}]{0,20}",
        any::<String>(),
    ]
}

fn arb_record() -> impl Strategy<Value = (LogRecord, String)> {
    (
        any::<i64>(),
        0u8..5,
        proptest::collection::vec((arb_text(), arb_text()), 0..4),
        proptest::option::of(arb_text()),
        proptest::option::of(arb_text()),
        arb_text(),
    )
        .prop_map(|(ts, level, entries, thread, exception, text)| {
            let mut record = LogRecord::new(ts, Level::from_ordinal(level).unwrap());
            if !entries.is_empty() {
                record.context = Some(Context::from_iter(entries));
            }
            record.thread_name = thread.map(Arc::from);
            record.exception_text = exception.map(Arc::from);
            (record, text)
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_random_splits_round_trip(
        records in proptest::collection::vec(arb_record(), 1..5),
        chunk_size in 1usize..64,
        piece in 1usize..32,
        split in 1usize..40,
    ) {
        let bytes = encode(&records, chunk_size, piece);
        let sink = decode_in_pieces(&bytes, split);

        prop_assert_eq!(sink.records.len(), records.len());
        for ((len, got, text), (want, want_text)) in sink.records.iter().zip(&records) {
            prop_assert_eq!(*len, want_text.len());
            prop_assert_eq!(got, want);
            prop_assert_eq!(text.as_slice(), want_text.as_bytes());
        }
    }
}
