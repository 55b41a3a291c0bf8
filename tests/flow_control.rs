//! Flow-control behavior over a live connection: parking on a tiny
//! window, resuming on WINDOW_UPDATE, and receive-side replenishment.

mod helpers;

use std::time::Duration;

use bytes::Bytes;
use helpers::RawPeer;
use tokio::io::split;
use tokio::time::timeout;
use weft::hpack::Encoder;
use weft::wire::{settings_ids, FrameType};
use weft::{Connection, ConnectionBuilder, HeaderField};

fn field(name: &str, value: &'static str) -> HeaderField {
    HeaderField::new(name.to_string(), Bytes::from_static(value.as_bytes())).unwrap()
}

fn get_request() -> Vec<HeaderField> {
    vec![
        field(":method", "GET"),
        field(":scheme", "http"),
        field(":path", "/"),
        field(":authority", "x"),
    ]
}

async fn connect_server(peer_settings: &[(u16, u32)]) -> (Connection, RawPeer) {
    let (local, remote) = tokio::io::duplex(1 << 16);
    let (input, output) = split(local);
    let mut peer = RawPeer::new(remote);
    let (conn, ()) = tokio::join!(
        ConnectionBuilder::server().handshake(input, output),
        peer.handshake_with_server(peer_settings),
    );
    (conn.expect("server handshake failed"), peer)
}

#[tokio::test]
async fn writer_parks_on_stream_window_and_resumes() {
    // The peer allows one octet in flight per stream.
    let (mut conn, mut peer) =
        connect_server(&[(settings_ids::INITIAL_WINDOW_SIZE, 1)]).await;

    let mut encoder = Encoder::new();
    let block = encoder.encode(&get_request());
    peer.send_headers(1, &block, true, true).await;

    let stream = conn.accept().await.expect("stream accepted");
    stream.read_headers().await.unwrap();
    stream
        .write_headers(vec![field(":status", "200")], false)
        .await
        .unwrap();
    stream.write_data(b"0123456789", true).await.unwrap();

    peer.read_frame_of(FrameType::Headers).await;

    // Exactly one octet comes out, then the stream is parked.
    let data = peer.read_frame_of(FrameType::Data).await;
    assert_eq!(&data.payload[..], b"0");
    assert!(!data.end_stream());

    let parked = timeout(Duration::from_millis(100), peer.read_frame()).await;
    assert!(parked.is_err(), "no frame may arrive while parked");

    // Credit the remaining nine octets; the tail flushes with END_STREAM.
    peer.send_window_update(1, 9).await;
    let data = peer.read_frame_of(FrameType::Data).await;
    assert_eq!(&data.payload[..], b"123456789");
    assert!(data.end_stream());
}

#[tokio::test]
async fn writer_respects_connection_window() {
    // Generous stream window, but the connection window stays at the
    // default 65535 and is never replenished by the peer.
    let (mut conn, mut peer) =
        connect_server(&[(settings_ids::INITIAL_WINDOW_SIZE, 1 << 20)]).await;

    let mut encoder = Encoder::new();
    let block = encoder.encode(&get_request());
    peer.send_headers(1, &block, true, true).await;

    let stream = conn.accept().await.expect("stream accepted");
    stream.read_headers().await.unwrap();
    stream
        .write_headers(vec![field(":status", "200")], false)
        .await
        .unwrap();

    let payload = vec![0xa5u8; 80_000];
    let writer = tokio::spawn(async move {
        stream.write_data(&payload, true).await.unwrap();
        stream
    });

    // Collect DATA until the connection window (65535) is exhausted.
    let mut received = 0usize;
    while received < 65_535 {
        let frame = peer.read_frame_of(FrameType::Data).await;
        received += frame.payload.len();
    }
    assert_eq!(received, 65_535);

    let parked = timeout(Duration::from_millis(100), peer.read_frame()).await;
    assert!(parked.is_err(), "connection window must gate the rest");

    // Connection-level credit releases the remainder.
    peer.send_window_update(0, 65_535).await;
    let mut tail = 0usize;
    let mut ended = false;
    while !ended {
        let frame = peer.read_frame_of(FrameType::Data).await;
        tail += frame.payload.len();
        ended = frame.end_stream();
    }
    assert_eq!(received + tail, 80_000);

    writer.await.unwrap();
}

#[tokio::test]
async fn receive_side_replenishes_consumed_octets() {
    let (mut conn, mut peer) = connect_server(&[]).await;

    let mut encoder = Encoder::new();
    let block = encoder.encode(&get_request());
    peer.send_headers(1, &block, true, false).await;

    // 48000 octets in MAX_FRAME_SIZE-sized slices; the stream window is
    // 65535 so everything fits without waiting.
    let chunk = vec![0x42u8; 16_000];
    for _ in 0..3 {
        peer.send_data(1, &chunk, false).await;
    }
    peer.send_data(1, &[], true).await;

    let stream = conn.accept().await.expect("stream accepted");
    stream.read_headers().await.unwrap();
    let mut buf = [0u8; 4096];
    let mut total = 0usize;
    loop {
        let n = stream.read_data(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        total += n;
    }
    assert_eq!(total, 48_000);

    // Consumption past half the window triggers WINDOW_UPDATE at both
    // scopes.
    let mut stream_credit = 0u64;
    let mut conn_credit = 0u64;
    while stream_credit == 0 || conn_credit == 0 {
        let frame = peer.read_frame_of(FrameType::WindowUpdate).await;
        let increment =
            u64::from(u32::from_be_bytes(frame.payload[..4].try_into().unwrap()));
        if frame.stream_id == 0 {
            conn_credit += increment;
        } else {
            assert_eq!(frame.stream_id, 1);
            stream_credit += increment;
        }
    }
    assert!(stream_credit >= 32_000);
    assert!(conn_credit >= 32_000);
}

#[tokio::test]
async fn zero_length_data_passes_windows() {
    // A window of zero octets still lets an empty END_STREAM frame out.
    let (mut conn, mut peer) =
        connect_server(&[(settings_ids::INITIAL_WINDOW_SIZE, 0)]).await;

    let mut encoder = Encoder::new();
    let block = encoder.encode(&get_request());
    peer.send_headers(1, &block, true, true).await;

    let stream = conn.accept().await.expect("stream accepted");
    stream.read_headers().await.unwrap();
    stream
        .write_headers(vec![field(":status", "204")], false)
        .await
        .unwrap();
    stream.write_data(&[], true).await.unwrap();

    peer.read_frame_of(FrameType::Headers).await;
    let data = peer.read_frame_of(FrameType::Data).await;
    assert!(data.payload.is_empty());
    assert!(data.end_stream());
}
