//! # weft
//!
//! An HTTP/2 (RFC 7540) connection engine with an in-tree HPACK
//! (RFC 7541) codec, multiplexing bidirectional streams over a
//! caller-supplied byte-duplex transport.
//!
//! weft is deliberately a protocol engine, not an HTTP client or server:
//! it does not open sockets, terminate TLS, negotiate ALPN, or define
//! request/response types. Callers hand it the read and write halves of a
//! connected transport and work with per-stream header lists and octet
//! payloads.
//!
//! ```no_run
//! use weft::{ConnectionBuilder, HeaderField};
//!
//! # async fn example(input: tokio::io::DuplexStream, output: tokio::io::DuplexStream)
//! #     -> weft::Result<()> {
//! let mut conn = ConnectionBuilder::server().handshake(input, output).await?;
//!
//! while let Some(stream) = conn.accept().await {
//!     tokio::spawn(async move {
//!         let _request = stream.read_headers().await?;
//!         let response = vec![HeaderField::new(":status", "200")?];
//!         stream.write_headers(response, false).await?;
//!         stream.write_data(b"ok", true).await?;
//!         weft::Result::Ok(())
//!     });
//! }
//! # Ok(())
//! # }
//! ```

mod buffer;
mod connection;
mod error;
mod flow;
mod frame;
mod headers;
pub mod hpack;
mod settings;
mod stream;
mod writer;

pub use connection::{Connection, ConnectionBuilder, Role, StreamDecision, StreamListener};
pub use error::{Error, ProtoError, Result};
pub use frame::{ErrorCode, CONNECTION_PREFACE};
pub use headers::{list_size, validate_request, validate_response, validate_trailers};
pub use headers::{HeaderField, InvalidHeader};
pub use hpack::HuffmanStrategy;
pub use settings::Settings;
pub use stream::{StreamHandle, StreamState};

// Wire-level types, exposed for tests and advanced integrations that
// speak raw frames.
pub mod wire {
    pub use crate::frame::{
        flags, ContinuationFrame, DataFrame, Frame, FrameHeader, FrameType, GoAwayFrame,
        HeadersFrame, PingFrame, PriorityFrame, PushPromiseFrame, RstStreamFrame, SettingsFrame,
        WindowUpdateFrame, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_SIZE,
    };
    pub use crate::settings::ids as settings_ids;
}
