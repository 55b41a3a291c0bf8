//! HTTP/2 frame types and binary serialization.
//!
//! Implements the RFC 7540 section 4 framing layer: the fixed 9-octet
//! frame header, typed payload parse/serialize for every frame type, and
//! the buffered [`FrameReader`] that chops a byte stream into frames while
//! enforcing the local MAX_FRAME_SIZE.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::ProtoError;

/// Frame header size (9 bytes per RFC 7540).
pub const FRAME_HEADER_SIZE: usize = 9;

/// Default maximum frame size (16KB per RFC 7540).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;

/// Upper bound on SETTINGS_MAX_FRAME_SIZE (2^24-1).
pub const MAX_ALLOWED_FRAME_SIZE: u32 = 16_777_215;

/// Default initial flow-control window (RFC 7540 section 6.9.2).
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;

/// HTTP/2 connection preface (client must send this first).
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Frame type identifiers per RFC 7540 section 6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
    Continuation,
    Unknown(u8),
}

impl From<u8> for FrameType {
    fn from(v: u8) -> Self {
        match v {
            0x0 => Self::Data,
            0x1 => Self::Headers,
            0x2 => Self::Priority,
            0x3 => Self::RstStream,
            0x4 => Self::Settings,
            0x5 => Self::PushPromise,
            0x6 => Self::Ping,
            0x7 => Self::GoAway,
            0x8 => Self::WindowUpdate,
            0x9 => Self::Continuation,
            other => Self::Unknown(other),
        }
    }
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        match ft {
            FrameType::Data => 0x0,
            FrameType::Headers => 0x1,
            FrameType::Priority => 0x2,
            FrameType::RstStream => 0x3,
            FrameType::Settings => 0x4,
            FrameType::PushPromise => 0x5,
            FrameType::Ping => 0x6,
            FrameType::GoAway => 0x7,
            FrameType::WindowUpdate => 0x8,
            FrameType::Continuation => 0x9,
            FrameType::Unknown(v) => v,
        }
    }
}

/// Frame flags.
pub mod flags {
    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1; // Same value, different context (SETTINGS/PING)
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

/// HTTP/2 error codes per RFC 7540 section 7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl From<u32> for ErrorCode {
    fn from(v: u32) -> Self {
        match v {
            0x0 => Self::NoError,
            0x1 => Self::ProtocolError,
            0x2 => Self::InternalError,
            0x3 => Self::FlowControlError,
            0x4 => Self::SettingsTimeout,
            0x5 => Self::StreamClosed,
            0x6 => Self::FrameSizeError,
            0x7 => Self::RefusedStream,
            0x8 => Self::Cancel,
            0x9 => Self::CompressionError,
            0xa => Self::ConnectError,
            0xb => Self::EnhanceYourCalm,
            0xc => Self::InadequateSecurity,
            0xd => Self::Http11Required,
            // Unknown codes must be treated as INTERNAL_ERROR equivalent;
            // we map them to ProtocolError like the rest of the codebase.
            _ => Self::ProtocolError,
        }
    }
}

/// Parsed frame header.
#[derive(Debug, Clone)]
pub struct FrameHeader {
    pub length: u32,
    pub frame_type: FrameType,
    pub flags: u8,
    pub stream_id: u32,
}

impl FrameHeader {
    /// Parse a frame header from exactly 9 bytes.
    ///
    /// The reserved high bit of the stream id is ignored on receipt per
    /// RFC 7540 section 4.1.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < FRAME_HEADER_SIZE {
            return None;
        }

        let length = ((buf[0] as u32) << 16) | ((buf[1] as u32) << 8) | (buf[2] as u32);
        let frame_type = FrameType::from(buf[3]);
        let flags = buf[4];
        let stream_id = ((buf[5] as u32 & 0x7f) << 24)
            | ((buf[6] as u32) << 16)
            | ((buf[7] as u32) << 8)
            | (buf[8] as u32);

        Some(Self {
            length,
            frame_type,
            flags,
            stream_id,
        })
    }

    /// Serialize frame header to bytes.
    pub fn serialize(&self, buf: &mut BytesMut) {
        buf.put_u8((self.length >> 16) as u8);
        buf.put_u8((self.length >> 8) as u8);
        buf.put_u8(self.length as u8);
        buf.put_u8(self.frame_type.into());
        buf.put_u8(self.flags);
        // Stream ID is 31 bits; the high bit is reserved and sent as 0.
        buf.put_u32(self.stream_id & 0x7fff_ffff);
    }
}

/// DATA frame.
#[derive(Debug, Clone)]
pub struct DataFrame {
    pub stream_id: u32,
    pub data: Bytes,
    pub end_stream: bool,
    pub pad_len: u8,
}

impl DataFrame {
    pub fn new(stream_id: u32, data: Bytes) -> Self {
        Self {
            stream_id,
            data,
            end_stream: false,
            pad_len: 0,
        }
    }

    pub fn end_stream(mut self, end: bool) -> Self {
        self.end_stream = end;
        self
    }

    /// Serialize into the provided buffer (header included). Padding is
    /// never emitted by this engine.
    pub fn serialize_into(&self, buf: &mut BytesMut) {
        let header = FrameHeader {
            length: self.data.len() as u32,
            frame_type: FrameType::Data,
            flags: if self.end_stream { flags::END_STREAM } else { 0 },
            stream_id: self.stream_id,
        };
        header.serialize(buf);
        buf.extend_from_slice(&self.data);
    }

    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.data.len());
        self.serialize_into(&mut buf);
        buf
    }

    /// Parse a DATA frame payload, stripping padding.
    pub fn parse(stream_id: u32, frame_flags: u8, mut payload: Bytes) -> Result<Self, ProtoError> {
        if stream_id == 0 {
            return Err(ProtoError::conn(
                ErrorCode::ProtocolError,
                "DATA frame on stream 0",
            ));
        }

        let end_stream = (frame_flags & flags::END_STREAM) != 0;
        let padded = (frame_flags & flags::PADDED) != 0;

        let (data, pad_len) = if padded {
            if payload.remaining() < 1 {
                return Err(ProtoError::conn(
                    ErrorCode::ProtocolError,
                    "PADDED DATA frame missing pad length",
                ));
            }
            let pad_len = payload.get_u8() as usize;
            if pad_len > payload.remaining() {
                return Err(ProtoError::conn(
                    ErrorCode::ProtocolError,
                    "DATA padding exceeds payload",
                ));
            }
            let data_len = payload.remaining() - pad_len;
            let data = payload.copy_to_bytes(data_len);
            (data, pad_len as u8)
        } else {
            (payload, 0)
        };

        Ok(Self {
            stream_id,
            data,
            end_stream,
            pad_len,
        })
    }
}

/// HEADERS frame. Carries a header block fragment; the priority block, if
/// present, is parsed and then ignored (priority trees are not modeled).
#[derive(Debug, Clone)]
pub struct HeadersFrame {
    pub stream_id: u32,
    pub fragment: Bytes,
    pub end_stream: bool,
    pub end_headers: bool,
    pub pad_len: u8,
}

impl HeadersFrame {
    pub fn new(stream_id: u32, fragment: Bytes) -> Self {
        Self {
            stream_id,
            fragment,
            end_stream: false,
            end_headers: true,
            pad_len: 0,
        }
    }

    pub fn end_stream(mut self, end: bool) -> Self {
        self.end_stream = end;
        self
    }

    pub fn end_headers(mut self, end: bool) -> Self {
        self.end_headers = end;
        self
    }

    pub fn serialize_into(&self, buf: &mut BytesMut) {
        let mut frame_flags = 0u8;
        if self.end_stream {
            frame_flags |= flags::END_STREAM;
        }
        if self.end_headers {
            frame_flags |= flags::END_HEADERS;
        }

        let header = FrameHeader {
            length: self.fragment.len() as u32,
            frame_type: FrameType::Headers,
            flags: frame_flags,
            stream_id: self.stream_id,
        };
        header.serialize(buf);
        buf.extend_from_slice(&self.fragment);
    }

    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.fragment.len());
        self.serialize_into(&mut buf);
        buf
    }

    /// Parse a HEADERS frame payload: padding, optional 5-byte priority
    /// block (discarded), then the header block fragment.
    pub fn parse(stream_id: u32, frame_flags: u8, mut payload: Bytes) -> Result<Self, ProtoError> {
        if stream_id == 0 {
            return Err(ProtoError::conn(
                ErrorCode::ProtocolError,
                "HEADERS frame on stream 0",
            ));
        }

        let end_stream = (frame_flags & flags::END_STREAM) != 0;
        let end_headers = (frame_flags & flags::END_HEADERS) != 0;
        let padded = (frame_flags & flags::PADDED) != 0;
        let priority = (frame_flags & flags::PRIORITY) != 0;

        let pad_len = if padded {
            if payload.remaining() < 1 {
                return Err(ProtoError::conn(
                    ErrorCode::ProtocolError,
                    "PADDED HEADERS frame missing pad length",
                ));
            }
            payload.get_u8() as usize
        } else {
            0
        };

        if priority {
            if payload.remaining() < 5 {
                return Err(ProtoError::conn(
                    ErrorCode::FrameSizeError,
                    "HEADERS priority block truncated",
                ));
            }
            // Exclusive bit, dependency and weight: parsed then dropped.
            let _dep = payload.get_u32();
            let _weight = payload.get_u8();
        }

        if pad_len > payload.remaining() {
            return Err(ProtoError::conn(
                ErrorCode::ProtocolError,
                "HEADERS padding exceeds payload",
            ));
        }
        let fragment_len = payload.remaining() - pad_len;
        let fragment = payload.copy_to_bytes(fragment_len);

        Ok(Self {
            stream_id,
            fragment,
            end_stream,
            end_headers,
            pad_len: pad_len as u8,
        })
    }
}

/// PRIORITY frame (RFC 7540 section 6.3). Parsed for validity, then
/// discarded by the dispatcher.
#[derive(Debug, Clone)]
pub struct PriorityFrame {
    pub stream_id: u32,
    pub exclusive: bool,
    pub dependency: u32,
    pub weight: u8,
}

impl PriorityFrame {
    pub fn parse(stream_id: u32, length: u32, mut payload: Bytes) -> Result<Self, ProtoError> {
        if stream_id == 0 {
            return Err(ProtoError::conn(
                ErrorCode::ProtocolError,
                "PRIORITY frame on stream 0",
            ));
        }
        // Malformed length is a stream error, not a connection error.
        if length != 5 {
            return Err(ProtoError::stream(stream_id, ErrorCode::FrameSizeError));
        }

        let dep_raw = payload.get_u32();
        let exclusive = (dep_raw & 0x8000_0000) != 0;
        let dependency = dep_raw & 0x7fff_ffff;
        let weight = payload.get_u8();

        if dependency == stream_id {
            return Err(ProtoError::stream(stream_id, ErrorCode::ProtocolError));
        }

        Ok(Self {
            stream_id,
            exclusive,
            dependency,
            weight,
        })
    }
}

/// RST_STREAM frame.
#[derive(Debug, Clone)]
pub struct RstStreamFrame {
    pub stream_id: u32,
    pub error_code: ErrorCode,
}

impl RstStreamFrame {
    pub fn new(stream_id: u32, error_code: ErrorCode) -> Self {
        Self {
            stream_id,
            error_code,
        }
    }

    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 4);
        let header = FrameHeader {
            length: 4,
            frame_type: FrameType::RstStream,
            flags: 0,
            stream_id: self.stream_id,
        };
        header.serialize(&mut buf);
        buf.put_u32(self.error_code as u32);
        buf
    }

    pub fn parse(stream_id: u32, length: u32, mut payload: Bytes) -> Result<Self, ProtoError> {
        if stream_id == 0 {
            return Err(ProtoError::conn(
                ErrorCode::ProtocolError,
                "RST_STREAM frame on stream 0",
            ));
        }
        if length != 4 {
            return Err(ProtoError::conn(
                ErrorCode::FrameSizeError,
                "RST_STREAM frame length != 4",
            ));
        }

        Ok(Self {
            stream_id,
            error_code: ErrorCode::from(payload.get_u32()),
        })
    }
}

/// SETTINGS frame payload: ordered (id, value) pairs.
#[derive(Debug, Clone, Default)]
pub struct SettingsFrame {
    pub settings: Vec<(u16, u32)>,
    pub ack: bool,
}

impl SettingsFrame {
    pub fn new() -> Self {
        Self {
            settings: Vec::new(),
            ack: false,
        }
    }

    /// Create a SETTINGS ACK frame.
    pub fn ack() -> Self {
        Self {
            settings: Vec::new(),
            ack: true,
        }
    }

    /// Add a setting. Order of calls determines wire order.
    pub fn push(&mut self, id: u16, value: u32) -> &mut Self {
        self.settings.push((id, value));
        self
    }

    pub fn serialize(&self) -> BytesMut {
        let payload_len = if self.ack { 0 } else { self.settings.len() * 6 };
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload_len);

        let header = FrameHeader {
            length: payload_len as u32,
            frame_type: FrameType::Settings,
            flags: if self.ack { flags::ACK } else { 0 },
            stream_id: 0,
        };
        header.serialize(&mut buf);

        if !self.ack {
            for (id, value) in &self.settings {
                buf.put_u16(*id);
                buf.put_u32(*value);
            }
        }

        buf
    }

    pub fn parse(stream_id: u32, frame_flags: u8, mut payload: Bytes) -> Result<Self, ProtoError> {
        if stream_id != 0 {
            return Err(ProtoError::conn(
                ErrorCode::ProtocolError,
                "SETTINGS frame on non-zero stream",
            ));
        }
        let ack = (frame_flags & flags::ACK) != 0;
        if ack && payload.remaining() != 0 {
            return Err(ProtoError::conn(
                ErrorCode::FrameSizeError,
                "SETTINGS ACK with payload",
            ));
        }
        if payload.remaining() % 6 != 0 {
            return Err(ProtoError::conn(
                ErrorCode::FrameSizeError,
                "SETTINGS payload not a multiple of 6",
            ));
        }

        let mut settings = Vec::with_capacity(payload.remaining() / 6);
        while payload.remaining() >= 6 {
            let id = payload.get_u16();
            let value = payload.get_u32();
            settings.push((id, value));
        }

        Ok(Self { settings, ack })
    }
}

/// PUSH_PROMISE frame (RFC 7540 section 6.6). The engine never emits
/// these; they are parsed on receipt so HPACK state stays consistent, then
/// the promised stream is refused.
#[derive(Debug, Clone)]
pub struct PushPromiseFrame {
    pub stream_id: u32,
    pub promised_stream_id: u32,
    pub fragment: Bytes,
    pub end_headers: bool,
}

impl PushPromiseFrame {
    pub fn parse(stream_id: u32, frame_flags: u8, mut payload: Bytes) -> Result<Self, ProtoError> {
        if stream_id == 0 {
            return Err(ProtoError::conn(
                ErrorCode::ProtocolError,
                "PUSH_PROMISE frame on stream 0",
            ));
        }

        let end_headers = (frame_flags & flags::END_HEADERS) != 0;
        let padded = (frame_flags & flags::PADDED) != 0;

        let pad_len = if padded {
            if payload.remaining() < 1 {
                return Err(ProtoError::conn(
                    ErrorCode::ProtocolError,
                    "PADDED PUSH_PROMISE frame missing pad length",
                ));
            }
            payload.get_u8() as usize
        } else {
            0
        };

        if payload.remaining() < 4 {
            return Err(ProtoError::conn(
                ErrorCode::FrameSizeError,
                "PUSH_PROMISE missing promised stream id",
            ));
        }
        let promised_stream_id = payload.get_u32() & 0x7fff_ffff;

        if pad_len > payload.remaining() {
            return Err(ProtoError::conn(
                ErrorCode::ProtocolError,
                "PUSH_PROMISE padding exceeds payload",
            ));
        }
        let fragment_len = payload.remaining() - pad_len;
        let fragment = payload.copy_to_bytes(fragment_len);

        Ok(Self {
            stream_id,
            promised_stream_id,
            fragment,
            end_headers,
        })
    }
}

/// PING frame.
#[derive(Debug, Clone)]
pub struct PingFrame {
    pub ack: bool,
    pub data: [u8; 8],
}

impl PingFrame {
    pub fn new(data: [u8; 8]) -> Self {
        Self { ack: false, data }
    }

    /// Create a PING ACK echoing the opaque payload.
    pub fn ack(data: [u8; 8]) -> Self {
        Self { ack: true, data }
    }

    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 8);
        let header = FrameHeader {
            length: 8,
            frame_type: FrameType::Ping,
            flags: if self.ack { flags::ACK } else { 0 },
            stream_id: 0,
        };
        header.serialize(&mut buf);
        buf.extend_from_slice(&self.data);
        buf
    }

    pub fn parse(stream_id: u32, frame_flags: u8, payload: &[u8]) -> Result<Self, ProtoError> {
        if stream_id != 0 {
            return Err(ProtoError::conn(
                ErrorCode::ProtocolError,
                "PING frame on non-zero stream",
            ));
        }
        if payload.len() != 8 {
            return Err(ProtoError::conn(
                ErrorCode::FrameSizeError,
                "PING frame length != 8",
            ));
        }
        let mut data = [0u8; 8];
        data.copy_from_slice(payload);
        Ok(Self {
            ack: (frame_flags & flags::ACK) != 0,
            data,
        })
    }
}

/// GOAWAY frame.
#[derive(Debug, Clone)]
pub struct GoAwayFrame {
    pub last_stream_id: u32,
    pub error_code: ErrorCode,
    pub debug_data: Bytes,
}

impl GoAwayFrame {
    pub fn new(last_stream_id: u32, error_code: ErrorCode) -> Self {
        Self {
            last_stream_id,
            error_code,
            debug_data: Bytes::new(),
        }
    }

    pub fn with_debug(mut self, debug: Bytes) -> Self {
        self.debug_data = debug;
        self
    }

    pub fn serialize(&self) -> BytesMut {
        let payload_len = 8 + self.debug_data.len();
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload_len);

        let header = FrameHeader {
            length: payload_len as u32,
            frame_type: FrameType::GoAway,
            flags: 0,
            stream_id: 0,
        };
        header.serialize(&mut buf);
        buf.put_u32(self.last_stream_id & 0x7fff_ffff);
        buf.put_u32(self.error_code as u32);
        buf.extend_from_slice(&self.debug_data);
        buf
    }

    pub fn parse(stream_id: u32, mut payload: Bytes) -> Result<Self, ProtoError> {
        if stream_id != 0 {
            return Err(ProtoError::conn(
                ErrorCode::ProtocolError,
                "GOAWAY frame on non-zero stream",
            ));
        }
        if payload.remaining() < 8 {
            return Err(ProtoError::conn(
                ErrorCode::FrameSizeError,
                "GOAWAY frame shorter than 8 bytes",
            ));
        }
        let last_stream_id = payload.get_u32() & 0x7fff_ffff;
        let error_code = ErrorCode::from(payload.get_u32());
        let debug_data = payload.copy_to_bytes(payload.remaining());

        Ok(Self {
            last_stream_id,
            error_code,
            debug_data,
        })
    }
}

/// WINDOW_UPDATE frame.
#[derive(Debug, Clone)]
pub struct WindowUpdateFrame {
    pub stream_id: u32,
    pub increment: u32,
}

impl WindowUpdateFrame {
    pub fn new(stream_id: u32, increment: u32) -> Self {
        Self {
            stream_id,
            increment,
        }
    }

    pub fn serialize_into(&self, buf: &mut BytesMut) {
        let header = FrameHeader {
            length: 4,
            frame_type: FrameType::WindowUpdate,
            flags: 0,
            stream_id: self.stream_id,
        };
        header.serialize(buf);
        buf.put_u32(self.increment & 0x7fff_ffff);
    }

    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 4);
        self.serialize_into(&mut buf);
        buf
    }

    /// Parse a WINDOW_UPDATE. A zero increment is a PROTOCOL_ERROR whose
    /// scope depends on the stream id (RFC 7540 section 6.9).
    pub fn parse(stream_id: u32, length: u32, mut payload: Bytes) -> Result<Self, ProtoError> {
        if length != 4 {
            return Err(ProtoError::conn(
                ErrorCode::FrameSizeError,
                "WINDOW_UPDATE frame length != 4",
            ));
        }
        let increment = payload.get_u32() & 0x7fff_ffff;
        if increment == 0 {
            return if stream_id == 0 {
                Err(ProtoError::conn(
                    ErrorCode::ProtocolError,
                    "WINDOW_UPDATE with zero increment",
                ))
            } else {
                Err(ProtoError::stream(stream_id, ErrorCode::ProtocolError))
            };
        }

        Ok(Self {
            stream_id,
            increment,
        })
    }
}

/// CONTINUATION frame (RFC 7540 section 6.10).
#[derive(Debug, Clone)]
pub struct ContinuationFrame {
    pub stream_id: u32,
    pub fragment: Bytes,
    pub end_headers: bool,
}

impl ContinuationFrame {
    pub fn new(stream_id: u32, fragment: Bytes, end_headers: bool) -> Self {
        Self {
            stream_id,
            fragment,
            end_headers,
        }
    }

    pub fn serialize_into(&self, buf: &mut BytesMut) {
        let header = FrameHeader {
            length: self.fragment.len() as u32,
            frame_type: FrameType::Continuation,
            flags: if self.end_headers {
                flags::END_HEADERS
            } else {
                0
            },
            stream_id: self.stream_id,
        };
        header.serialize(buf);
        buf.extend_from_slice(&self.fragment);
    }

    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.fragment.len());
        self.serialize_into(&mut buf);
        buf
    }

    pub fn parse(stream_id: u32, frame_flags: u8, payload: Bytes) -> Result<Self, ProtoError> {
        if stream_id == 0 {
            return Err(ProtoError::conn(
                ErrorCode::ProtocolError,
                "CONTINUATION frame on stream 0",
            ));
        }
        Ok(Self {
            stream_id,
            fragment: payload,
            end_headers: (frame_flags & flags::END_HEADERS) != 0,
        })
    }
}

/// A fully parsed inbound frame.
#[derive(Debug, Clone)]
pub enum Frame {
    Data(DataFrame),
    Headers(HeadersFrame),
    Priority(PriorityFrame),
    RstStream(RstStreamFrame),
    Settings(SettingsFrame),
    PushPromise(PushPromiseFrame),
    Ping(PingFrame),
    GoAway(GoAwayFrame),
    WindowUpdate(WindowUpdateFrame),
    Continuation(ContinuationFrame),
    /// Unknown frame types are discarded after the payload is consumed.
    Unknown { frame_type: u8, stream_id: u32 },
}

impl Frame {
    /// Typed parse with per-type validation.
    pub fn parse(header: &FrameHeader, payload: Bytes) -> Result<Frame, ProtoError> {
        let id = header.stream_id;
        match header.frame_type {
            FrameType::Data => DataFrame::parse(id, header.flags, payload).map(Frame::Data),
            FrameType::Headers => {
                HeadersFrame::parse(id, header.flags, payload).map(Frame::Headers)
            }
            FrameType::Priority => {
                PriorityFrame::parse(id, header.length, payload).map(Frame::Priority)
            }
            FrameType::RstStream => {
                RstStreamFrame::parse(id, header.length, payload).map(Frame::RstStream)
            }
            FrameType::Settings => {
                SettingsFrame::parse(id, header.flags, payload).map(Frame::Settings)
            }
            FrameType::PushPromise => {
                PushPromiseFrame::parse(id, header.flags, payload).map(Frame::PushPromise)
            }
            FrameType::Ping => PingFrame::parse(id, header.flags, &payload).map(Frame::Ping),
            FrameType::GoAway => GoAwayFrame::parse(id, payload).map(Frame::GoAway),
            FrameType::WindowUpdate => {
                WindowUpdateFrame::parse(id, header.length, payload).map(Frame::WindowUpdate)
            }
            FrameType::Continuation => {
                ContinuationFrame::parse(id, header.flags, payload).map(Frame::Continuation)
            }
            FrameType::Unknown(t) => Ok(Frame::Unknown {
                frame_type: t,
                stream_id: id,
            }),
        }
    }
}

/// Buffered frame reader over the input transport. Accumulates bytes until
/// a complete frame is available, enforcing the local MAX_FRAME_SIZE
/// before the payload is read.
pub struct FrameReader<R> {
    input: R,
    buf: BytesMut,
    max_frame_size: u32,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            input,
            buf: BytesMut::with_capacity(DEFAULT_MAX_FRAME_SIZE as usize),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Raise or lower the advertised frame-size ceiling. Takes effect once
    /// the peer has acknowledged the corresponding SETTINGS.
    pub fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = size;
    }

    /// Read exactly `n` bytes into the internal buffer, e.g. the preface.
    pub async fn read_exact_raw(&mut self, n: usize) -> crate::Result<Bytes> {
        while self.buf.len() < n {
            let read = self.input.read_buf(&mut self.buf).await?;
            if read == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "transport closed during handshake",
                )
                .into());
            }
        }
        Ok(self.buf.split_to(n).freeze())
    }

    /// Read the next frame. Returns `Ok(None)` on a clean EOF at a frame
    /// boundary; EOF inside a frame is an error.
    pub async fn read_frame(&mut self) -> crate::Result<Option<(FrameHeader, Bytes)>> {
        while self.buf.len() < FRAME_HEADER_SIZE {
            let read = self.input.read_buf(&mut self.buf).await?;
            if read == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "transport closed mid-frame",
                )
                .into());
            }
        }

        let header = match FrameHeader::parse(&self.buf[..FRAME_HEADER_SIZE]) {
            Some(h) => h,
            None => {
                return Err(crate::Error::connection(
                    ErrorCode::ProtocolError,
                    "unparseable frame header",
                ))
            }
        };

        if header.length > self.max_frame_size {
            return Err(crate::Error::connection(
                ErrorCode::FrameSizeError,
                format!(
                    "frame of {} bytes exceeds MAX_FRAME_SIZE {}",
                    header.length, self.max_frame_size
                ),
            ));
        }

        let frame_len = FRAME_HEADER_SIZE + header.length as usize;
        while self.buf.len() < frame_len {
            let read = self.input.read_buf(&mut self.buf).await?;
            if read == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "transport closed mid-frame",
                )
                .into());
            }
        }

        let mut frame = self.buf.split_to(frame_len);
        frame.advance(FRAME_HEADER_SIZE);
        Ok(Some((header, frame.freeze())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_header_round_trip() {
        let header = FrameHeader {
            length: 18,
            frame_type: FrameType::Settings,
            flags: 0,
            stream_id: 0,
        };
        let mut buf = BytesMut::new();
        header.serialize(&mut buf);
        assert_eq!(buf.len(), FRAME_HEADER_SIZE);

        let parsed = FrameHeader::parse(&buf).unwrap();
        assert_eq!(parsed.length, 18);
        assert_eq!(parsed.frame_type, FrameType::Settings);
        assert_eq!(parsed.stream_id, 0);
    }

    #[test]
    fn reserved_bit_masked_on_parse() {
        let bytes = [0, 0, 0, 0x8, 0, 0x80, 0, 0, 1];
        let header = FrameHeader::parse(&bytes).unwrap();
        assert_eq!(header.stream_id, 1);
    }

    #[test]
    fn data_frame_strips_padding() {
        // pad_len=2, "ok", two pad bytes
        let payload = Bytes::from_static(&[2, b'o', b'k', 0, 0]);
        let frame = DataFrame::parse(1, flags::PADDED | flags::END_STREAM, payload).unwrap();
        assert_eq!(&frame.data[..], b"ok");
        assert!(frame.end_stream);
        assert_eq!(frame.pad_len, 2);
    }

    #[test]
    fn data_padding_exceeding_payload_is_protocol_error() {
        let payload = Bytes::from_static(&[9, b'o', b'k']);
        let err = DataFrame::parse(1, flags::PADDED, payload).unwrap_err();
        assert!(matches!(
            err,
            ProtoError::Connection {
                code: ErrorCode::ProtocolError,
                ..
            }
        ));
    }

    #[test]
    fn data_on_stream_zero_rejected() {
        let err = DataFrame::parse(0, 0, Bytes::from_static(b"x")).unwrap_err();
        assert!(matches!(err, ProtoError::Connection { .. }));
    }

    #[test]
    fn headers_priority_block_discarded() {
        let mut payload = BytesMut::new();
        payload.put_u32(3); // dependency
        payload.put_u8(200); // weight
        payload.extend_from_slice(&[0x82]);
        let frame =
            HeadersFrame::parse(1, flags::END_HEADERS | flags::PRIORITY, payload.freeze()).unwrap();
        assert_eq!(&frame.fragment[..], &[0x82]);
        assert!(frame.end_headers);
    }

    #[test]
    fn priority_wrong_length_is_stream_error() {
        let err = PriorityFrame::parse(3, 4, Bytes::from_static(&[0, 0, 0, 1])).unwrap_err();
        assert!(matches!(
            err,
            ProtoError::Stream {
                id: 3,
                code: ErrorCode::FrameSizeError,
            }
        ));
    }

    #[test]
    fn settings_frame_round_trip() {
        let mut settings = SettingsFrame::new();
        settings.push(0x3, 100).push(0x4, 65_535);
        let buf = settings.serialize().freeze();
        assert_eq!(buf.len(), FRAME_HEADER_SIZE + 12);

        let header = FrameHeader::parse(&buf[..9]).unwrap();
        let parsed = SettingsFrame::parse(0, header.flags, buf.slice(9..)).unwrap();
        assert_eq!(parsed.settings, vec![(0x3, 100), (0x4, 65_535)]);
        assert!(!parsed.ack);
    }

    #[test]
    fn settings_ack_with_payload_rejected() {
        let err = SettingsFrame::parse(0, flags::ACK, Bytes::from_static(&[0; 6])).unwrap_err();
        assert!(matches!(
            err,
            ProtoError::Connection {
                code: ErrorCode::FrameSizeError,
                ..
            }
        ));
    }

    #[test]
    fn settings_length_not_multiple_of_six_rejected() {
        let err = SettingsFrame::parse(0, 0, Bytes::from_static(&[0; 5])).unwrap_err();
        assert!(matches!(
            err,
            ProtoError::Connection {
                code: ErrorCode::FrameSizeError,
                ..
            }
        ));
    }

    #[test]
    fn ping_round_trip() {
        let ping = PingFrame::new([1, 2, 3, 4, 5, 6, 7, 8]);
        let buf = ping.serialize().freeze();
        let header = FrameHeader::parse(&buf[..9]).unwrap();
        let parsed = PingFrame::parse(0, header.flags, &buf[9..]).unwrap();
        assert!(!parsed.ack);
        assert_eq!(parsed.data, [1, 2, 3, 4, 5, 6, 7, 8]);

        let ack = PingFrame::ack(parsed.data);
        assert_eq!(ack.serialize()[4], flags::ACK);
    }

    #[test]
    fn window_update_zero_increment_scoped() {
        let conn_err = WindowUpdateFrame::parse(0, 4, Bytes::from_static(&[0; 4])).unwrap_err();
        assert!(matches!(conn_err, ProtoError::Connection { .. }));

        let stream_err = WindowUpdateFrame::parse(7, 4, Bytes::from_static(&[0; 4])).unwrap_err();
        assert!(matches!(
            stream_err,
            ProtoError::Stream {
                id: 7,
                code: ErrorCode::ProtocolError,
            }
        ));
    }

    #[test]
    fn goaway_round_trip_with_debug() {
        let goaway =
            GoAwayFrame::new(5, ErrorCode::EnhanceYourCalm).with_debug(Bytes::from_static(b"calm"));
        let buf = goaway.serialize().freeze();
        let parsed = GoAwayFrame::parse(0, buf.slice(9..)).unwrap();
        assert_eq!(parsed.last_stream_id, 5);
        assert_eq!(parsed.error_code, ErrorCode::EnhanceYourCalm);
        assert_eq!(&parsed.debug_data[..], b"calm");
    }

    #[test]
    fn unknown_frame_type_passes_through() {
        let header = FrameHeader {
            length: 3,
            frame_type: FrameType::Unknown(0x42),
            flags: 0,
            stream_id: 9,
        };
        let frame = Frame::parse(&header, Bytes::from_static(&[1, 2, 3])).unwrap();
        assert!(matches!(
            frame,
            Frame::Unknown {
                frame_type: 0x42,
                stream_id: 9,
            }
        ));
    }
}
