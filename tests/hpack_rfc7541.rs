//! RFC 7541 HPACK tests against the appendix C vectors, exercised
//! through the public encoder/decoder.

use bytes::Bytes;
use weft::hpack::{Decoder, Encoder, HuffmanStrategy};
use weft::HeaderField;

fn field(name: &str, value: &'static str) -> HeaderField {
    HeaderField::new(name.to_string(), Bytes::from_static(value.as_bytes())).unwrap()
}

fn first_request() -> Vec<HeaderField> {
    vec![
        field(":method", "GET"),
        field(":scheme", "http"),
        field(":path", "/"),
        field(":authority", "www.example.com"),
    ]
}

#[test]
fn c3_request_sequence_without_huffman() {
    let mut encoder = Encoder::with_strategy(HuffmanStrategy::Never);

    // C.3.1: first request
    let block = encoder.encode(&first_request());
    assert_eq!(
        &block[..],
        &[
            0x82, 0x86, 0x84, 0x41, 0x0f, b'w', b'w', b'w', b'.', b'e', b'x', b'a', b'm', b'p',
            b'l', b'e', b'.', b'c', b'o', b'm'
        ][..]
    );
    assert_eq!(encoder.table_size(), 57);

    // C.3.2: second request
    let mut second = first_request();
    second.push(field("cache-control", "no-cache"));
    let block = encoder.encode(&second);
    assert_eq!(
        &block[..],
        &[0x82, 0x86, 0x84, 0xbe, 0x58, 0x08, b'n', b'o', b'-', b'c', b'a', b'c', b'h', b'e'][..]
    );
    assert_eq!(encoder.table_size(), 110);

    // C.3.3: third request
    let third = vec![
        field(":method", "GET"),
        field(":scheme", "https"),
        field(":path", "/index.html"),
        field(":authority", "www.example.com"),
        field("custom-key", "custom-value"),
    ];
    let block = encoder.encode(&third);
    assert_eq!(
        &block[..],
        &[
            0x82, 0x87, 0x85, 0xbf, 0x40, 0x0a, b'c', b'u', b's', b't', b'o', b'm', b'-', b'k',
            b'e', b'y', 0x0c, b'c', b'u', b's', b't', b'o', b'm', b'-', b'v', b'a', b'l', b'u',
            b'e'
        ][..]
    );
    assert_eq!(encoder.table_size(), 164);
}

#[test]
fn c4_first_request_with_huffman() {
    let mut encoder = Encoder::with_strategy(HuffmanStrategy::Always);
    let block = encoder.encode(&first_request());
    assert_eq!(
        &block[..],
        &[
            0x82, 0x86, 0x84, 0x41, 0x8c, 0xf1, 0xe3, 0xc2, 0xe5, 0xf2, 0x3a, 0x6b, 0xa0, 0xab,
            0x90, 0xf4, 0xff
        ][..]
    );
    assert_eq!(encoder.table_size(), 57);
}

#[test]
fn decoder_tracks_c3_sequence() {
    let mut decoder = Decoder::new();

    let block1 = [
        0x82, 0x86, 0x84, 0x41, 0x0f, b'w', b'w', b'w', b'.', b'e', b'x', b'a', b'm', b'p', b'l',
        b'e', b'.', b'c', b'o', b'm',
    ];
    let fields = decoder.decode(&block1, None).unwrap();
    assert_eq!(fields, first_request());
    assert_eq!(decoder.table_size(), 57);

    let block2 = [
        0x82, 0x86, 0x84, 0xbe, 0x58, 0x08, b'n', b'o', b'-', b'c', b'a', b'c', b'h', b'e',
    ];
    let fields = decoder.decode(&block2, None).unwrap();
    assert_eq!(fields.len(), 5);
    assert_eq!(fields[4], field("cache-control", "no-cache"));
    assert_eq!(decoder.table_size(), 110);
}

#[test]
fn round_trip_under_all_strategies() {
    for strategy in [
        HuffmanStrategy::Always,
        HuffmanStrategy::Never,
        HuffmanStrategy::WhenSmaller,
    ] {
        let mut encoder = Encoder::with_strategy(strategy);
        let mut decoder = Decoder::new();

        let mut fields = first_request();
        fields.push(field("user-agent", "weft/0.1"));
        fields.push(field("accept", "*/*"));

        for _ in 0..5 {
            let block = encoder.encode(&fields);
            let decoded = decoder.decode(&block, None).unwrap();
            assert_eq!(decoded, fields);
            assert_eq!(encoder.table_size(), decoder.table_size());
        }
    }
}

#[test]
fn sensitive_fields_survive_round_trip_unindexed() {
    let mut encoder = Encoder::new();
    let mut decoder = Decoder::new();

    let fields = vec![
        field(":status", "200"),
        HeaderField::new("authorization".to_string(), Bytes::from_static(b"Bearer t"))
            .unwrap()
            .sensitive(),
    ];

    // Encode twice: the sensitive value must never become table-indexed.
    for _ in 0..2 {
        let block = encoder.encode(&fields);
        let decoded = decoder.decode(&block, None).unwrap();
        assert_eq!(decoded, fields);
        assert!(decoded[1].sensitive);
        assert_eq!(encoder.table_size(), 0);
    }
}

#[test]
fn table_size_is_sum_of_retained_entries() {
    let mut encoder = Encoder::with_strategy(HuffmanStrategy::Never);
    let mut decoder = Decoder::new();

    // Force a tiny table so insertions evict.
    encoder.set_max_table_size(100);
    for i in 0..20 {
        let fields = vec![
            field(":method", "GET"),
            HeaderField::new("x-header", format!("value-{i}")).unwrap(),
        ];
        let block = encoder.encode(&fields);
        decoder.decode(&block, None).unwrap();
        assert!(encoder.table_size() <= 100);
        assert_eq!(encoder.table_size(), decoder.table_size());
    }
}

#[test]
fn oversized_list_reported_without_desync() {
    let mut encoder = Encoder::with_strategy(HuffmanStrategy::Never);
    let mut decoder = Decoder::new();

    let mut fields = first_request();
    fields.push(field("x-large", "0123456789012345678901234567890123456789"));

    let block = encoder.encode(&fields);
    assert!(decoder.decode(&block, Some(64)).is_err());

    // The next block still decodes: the tables stayed in sync.
    let block = encoder.encode(&first_request());
    let decoded = decoder.decode(&block, None).unwrap();
    assert_eq!(decoded, first_request());
}
