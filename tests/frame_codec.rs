//! RFC 7540 section 4/6 frame serialization tests over the public wire
//! types: serialize/parse equality and per-type validation.

use bytes::BytesMut;
use weft::wire::{
    flags, DataFrame, FrameHeader, FrameType, GoAwayFrame, HeadersFrame, PingFrame,
    RstStreamFrame, SettingsFrame, WindowUpdateFrame, FRAME_HEADER_SIZE,
};
use weft::ErrorCode;

#[test]
fn frame_header_layout() {
    let header = FrameHeader {
        length: 100,
        frame_type: FrameType::Data,
        flags: flags::END_STREAM,
        stream_id: 5,
    };

    let mut buf = BytesMut::new();
    header.serialize(&mut buf);
    let bytes = buf.freeze();

    assert_eq!(bytes.len(), FRAME_HEADER_SIZE);
    assert_eq!(&bytes[0..3], &[0, 0, 100]);
    assert_eq!(bytes[3], 0x0);
    assert_eq!(bytes[4], 0x1);
    assert_eq!(&bytes[5..9], &[0, 0, 0, 5]);

    let parsed = FrameHeader::parse(&bytes).unwrap();
    assert_eq!(parsed.length, 100);
    assert_eq!(parsed.frame_type, FrameType::Data);
    assert_eq!(parsed.stream_id, 5);
}

#[test]
fn settings_round_trip() {
    let mut settings = SettingsFrame::new();
    settings.push(0x1, 4096).push(0x2, 0);

    let bytes = settings.serialize().freeze();
    assert_eq!(bytes.len(), FRAME_HEADER_SIZE + 12);

    let header = FrameHeader::parse(&bytes[..9]).unwrap();
    assert_eq!(header.frame_type, FrameType::Settings);
    let parsed = SettingsFrame::parse(0, header.flags, bytes.slice(9..)).unwrap();
    assert_eq!(parsed.settings, vec![(0x1, 4096), (0x2, 0)]);
}

#[test]
fn data_round_trip() {
    let frame = DataFrame::new(3, bytes::Bytes::from_static(b"payload")).end_stream(true);
    let bytes = frame.serialize().freeze();

    let header = FrameHeader::parse(&bytes[..9]).unwrap();
    assert_eq!(header.frame_type, FrameType::Data);
    let parsed = DataFrame::parse(header.stream_id, header.flags, bytes.slice(9..)).unwrap();
    assert_eq!(&parsed.data[..], b"payload");
    assert!(parsed.end_stream);
    assert_eq!(parsed.stream_id, 3);
}

#[test]
fn headers_round_trip() {
    let frame = HeadersFrame::new(7, bytes::Bytes::from_static(&[0x82, 0x86]))
        .end_stream(false)
        .end_headers(true);
    let bytes = frame.serialize().freeze();

    let header = FrameHeader::parse(&bytes[..9]).unwrap();
    let parsed = HeadersFrame::parse(header.stream_id, header.flags, bytes.slice(9..)).unwrap();
    assert_eq!(&parsed.fragment[..], &[0x82, 0x86]);
    assert!(parsed.end_headers);
    assert!(!parsed.end_stream);
}

#[test]
fn ping_round_trip_and_ack() {
    let data = 999u64.to_be_bytes();
    let bytes = PingFrame::new(data).serialize().freeze();
    assert_eq!(bytes.len(), FRAME_HEADER_SIZE + 8);

    let header = FrameHeader::parse(&bytes[..9]).unwrap();
    assert_eq!(header.frame_type, FrameType::Ping);
    let parsed = PingFrame::parse(0, header.flags, &bytes[9..]).unwrap();
    assert!(!parsed.ack);
    assert_eq!(parsed.data, data);

    let ack = PingFrame::ack(data).serialize();
    assert_eq!(ack[4], flags::ACK);
}

#[test]
fn rst_stream_round_trip() {
    let bytes = RstStreamFrame::new(9, ErrorCode::Cancel).serialize().freeze();
    let header = FrameHeader::parse(&bytes[..9]).unwrap();
    let parsed = RstStreamFrame::parse(9, header.length, bytes.slice(9..)).unwrap();
    assert_eq!(parsed.error_code, ErrorCode::Cancel);
}

#[test]
fn goaway_round_trip() {
    let bytes = GoAwayFrame::new(5, ErrorCode::ProtocolError).serialize().freeze();
    assert_eq!(bytes.len(), FRAME_HEADER_SIZE + 8);

    let parsed = GoAwayFrame::parse(0, bytes.slice(9..)).unwrap();
    assert_eq!(parsed.last_stream_id, 5);
    assert_eq!(parsed.error_code, ErrorCode::ProtocolError);
}

#[test]
fn window_update_round_trip() {
    let bytes = WindowUpdateFrame::new(5, 1024).serialize().freeze();
    assert_eq!(bytes.len(), FRAME_HEADER_SIZE + 4);

    let header = FrameHeader::parse(&bytes[..9]).unwrap();
    assert_eq!(header.stream_id, 5);
    let parsed = WindowUpdateFrame::parse(5, header.length, bytes.slice(9..)).unwrap();
    assert_eq!(parsed.increment, 1024);
}

#[test]
fn data_with_padding_parses_clean() {
    // Hand-built PADDED DATA: pad length 3, "hi", three zero octets.
    let mut buf = BytesMut::new();
    FrameHeader {
        length: 6,
        frame_type: FrameType::Data,
        flags: flags::PADDED | flags::END_STREAM,
        stream_id: 1,
    }
    .serialize(&mut buf);
    buf.extend_from_slice(&[3, b'h', b'i', 0, 0, 0]);
    let bytes = buf.freeze();

    let header = FrameHeader::parse(&bytes[..9]).unwrap();
    let parsed = DataFrame::parse(1, header.flags, bytes.slice(9..)).unwrap();
    assert_eq!(&parsed.data[..], b"hi");
    assert_eq!(parsed.pad_len, 3);
    assert!(parsed.end_stream);
}
