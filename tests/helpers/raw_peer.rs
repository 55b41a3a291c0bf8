//! A test peer that speaks raw HTTP/2 frames over one side of a
//! `tokio::io::duplex` pipe, with no engine of its own.

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use weft::wire::{
    flags, FrameHeader, FrameType, SettingsFrame, FRAME_HEADER_SIZE,
};
use weft::CONNECTION_PREFACE;

/// A received frame, header fields unpacked.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub frame_type: FrameType,
    pub flags: u8,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl RawFrame {
    pub fn end_stream(&self) -> bool {
        self.flags & flags::END_STREAM != 0
    }

    pub fn end_headers(&self) -> bool {
        self.flags & flags::END_HEADERS != 0
    }

    pub fn ack(&self) -> bool {
        self.flags & flags::ACK != 0
    }
}

pub struct RawPeer {
    io: DuplexStream,
    read_buf: BytesMut,
}

impl RawPeer {
    pub fn new(io: DuplexStream) -> Self {
        Self {
            io,
            read_buf: BytesMut::with_capacity(16_384),
        }
    }

    pub async fn send(&mut self, bytes: &[u8]) {
        self.io.write_all(bytes).await.expect("peer write failed");
        self.io.flush().await.expect("peer flush failed");
    }

    /// Client-side opening: preface plus our SETTINGS.
    pub async fn send_preface_and_settings(&mut self, settings: &[(u16, u32)]) {
        self.send(CONNECTION_PREFACE).await;
        self.send_settings(settings).await;
    }

    pub async fn send_settings(&mut self, settings: &[(u16, u32)]) {
        let mut frame = SettingsFrame::new();
        for &(id, value) in settings {
            frame.push(id, value);
        }
        self.send(&frame.serialize()).await;
    }

    pub async fn send_settings_ack(&mut self) {
        self.send(&SettingsFrame::ack().serialize()).await;
    }

    /// Raw frame with arbitrary type/flags/payload.
    pub async fn send_frame(
        &mut self,
        frame_type: FrameType,
        frame_flags: u8,
        stream_id: u32,
        payload: &[u8],
    ) {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
        FrameHeader {
            length: payload.len() as u32,
            frame_type,
            flags: frame_flags,
            stream_id,
        }
        .serialize(&mut buf);
        buf.extend_from_slice(payload);
        self.send(&buf).await;
    }

    pub async fn send_headers(
        &mut self,
        stream_id: u32,
        block: &[u8],
        end_headers: bool,
        end_stream: bool,
    ) {
        let mut frame_flags = 0;
        if end_headers {
            frame_flags |= flags::END_HEADERS;
        }
        if end_stream {
            frame_flags |= flags::END_STREAM;
        }
        self.send_frame(FrameType::Headers, frame_flags, stream_id, block)
            .await;
    }

    pub async fn send_data(&mut self, stream_id: u32, data: &[u8], end_stream: bool) {
        let frame_flags = if end_stream { flags::END_STREAM } else { 0 };
        self.send_frame(FrameType::Data, frame_flags, stream_id, data)
            .await;
    }

    pub async fn send_window_update(&mut self, stream_id: u32, increment: u32) {
        self.send_frame(
            FrameType::WindowUpdate,
            0,
            stream_id,
            &increment.to_be_bytes(),
        )
        .await;
    }

    pub async fn send_ping(&mut self, payload: [u8; 8]) {
        self.send_frame(FrameType::Ping, 0, 0, &payload).await;
    }

    pub async fn read_frame(&mut self) -> RawFrame {
        while self.read_buf.len() < FRAME_HEADER_SIZE {
            let n = self
                .io
                .read_buf(&mut self.read_buf)
                .await
                .expect("peer read failed");
            assert!(n > 0, "engine closed the transport mid-frame");
        }
        let header = FrameHeader::parse(&self.read_buf[..FRAME_HEADER_SIZE]).unwrap();
        let total = FRAME_HEADER_SIZE + header.length as usize;
        while self.read_buf.len() < total {
            let n = self
                .io
                .read_buf(&mut self.read_buf)
                .await
                .expect("peer read failed");
            assert!(n > 0, "engine closed the transport mid-frame");
        }
        let mut frame = self.read_buf.split_to(total);
        frame.advance(FRAME_HEADER_SIZE);
        RawFrame {
            frame_type: header.frame_type,
            flags: header.flags,
            stream_id: header.stream_id,
            payload: frame.freeze(),
        }
    }

    /// Read frames until one of the wanted type arrives; other types are
    /// discarded (handshake SETTINGS, WINDOW_UPDATE noise).
    pub async fn read_frame_of(&mut self, wanted: FrameType) -> RawFrame {
        loop {
            let frame = self.read_frame().await;
            if frame.frame_type == wanted {
                return frame;
            }
        }
    }

    /// Server-side opening: consume the engine's preface and answer its
    /// SETTINGS.
    pub async fn expect_preface(&mut self) {
        let mut preface = vec![0u8; CONNECTION_PREFACE.len()];
        // The preface may already be buffered from a prior read.
        while self.read_buf.len() < preface.len() {
            let n = self
                .io
                .read_buf(&mut self.read_buf)
                .await
                .expect("peer read failed");
            assert!(n > 0, "engine closed before sending preface");
        }
        let preface_len = preface.len();
        preface.copy_from_slice(&self.read_buf.split_to(preface_len));
        assert_eq!(&preface[..], CONNECTION_PREFACE, "bad connection preface");
    }

    /// Run the standard peer-side handshake against a server engine:
    /// send preface + SETTINGS, wait for the engine's SETTINGS, ACK it,
    /// and wait for the engine to ACK ours.
    pub async fn handshake_with_server(&mut self, settings: &[(u16, u32)]) {
        self.send_preface_and_settings(settings).await;

        let frame = self.read_frame_of(FrameType::Settings).await;
        assert!(!frame.ack(), "expected server SETTINGS before any ACK");
        self.send_settings_ack().await;

        let frame = self.read_frame_of(FrameType::Settings).await;
        assert!(frame.ack(), "expected SETTINGS ACK for our settings");
    }
}
