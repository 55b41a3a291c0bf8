//! HPACK-specific error types.

use thiserror::Error;

/// HPACK encoding/decoding errors. Everything except [`ListTooLarge`]
/// maps to a connection-level COMPRESSION_ERROR; an oversized list is a
/// stream-level refusal because the table state is still consistent.
///
/// [`ListTooLarge`]: HpackError::ListTooLarge
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HpackError {
    #[error("unexpected end of header block")]
    UnexpectedEof,

    #[error("prefixed integer overflow")]
    IntegerOverflow,

    #[error("invalid huffman code")]
    InvalidHuffman,

    #[error("EOS symbol inside huffman string")]
    EosInString,

    #[error("invalid huffman padding")]
    InvalidPadding,

    #[error("invalid table index: {0}")]
    InvalidIndex(usize),

    #[error("dynamic table size update after header fields")]
    LateTableSizeUpdate,

    #[error("dynamic table size update {0} exceeds advertised limit {1}")]
    TableSizeExceedsLimit(usize, usize),

    #[error("decoded header list exceeds MAX_HEADER_LIST_SIZE")]
    ListTooLarge,
}
