//! HPACK header compression (RFC 7541).
//!
//! The decoder is owned by the connection's reader task and the encoder by
//! the writer task; neither is shared, so the table state on each side
//! tracks the wire exactly.

mod decoder;
mod dynamic_table;
mod encoder;
mod error;
mod huffman;
mod integer;
mod static_table;

pub use decoder::Decoder;
pub use encoder::{Encoder, HuffmanStrategy};
pub use error::HpackError;
