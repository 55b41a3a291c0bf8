//! HPACK encoder (RFC 7541).
//!
//! Owned exclusively by the connection's writer task, so the dynamic table
//! evolves in exactly the order blocks hit the wire.
//!
//! Indexing policy: an exact (name, value) match emits an indexed field; a
//! sensitive field emits never-indexed (with an indexed name when one is
//! available); everything else emits a literal with incremental indexing.

use bytes::Bytes;

use super::dynamic_table::DynamicTable;
use super::huffman;
use super::integer;
use super::static_table::{self, STATIC_TABLE_SIZE};
use crate::headers::HeaderField;

/// When to Huffman-code string literals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HuffmanStrategy {
    Always,
    Never,
    /// Encode only when the coded form is shorter.
    #[default]
    WhenSmaller,
}

pub struct Encoder {
    table: DynamicTable,
    huffman: HuffmanStrategy,
    /// A table resize to announce at the start of the next block.
    pending_size_update: Option<usize>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::with_strategy(HuffmanStrategy::default())
    }

    pub fn with_strategy(huffman: HuffmanStrategy) -> Self {
        Self {
            table: DynamicTable::new(4096),
            huffman,
            pending_size_update: None,
        }
    }

    /// Adopt the peer's HEADER_TABLE_SIZE. The resize itself is applied
    /// now; the size-update signal goes out with the next block.
    pub fn set_max_table_size(&mut self, size: usize) {
        if size == self.table.max_size() {
            return;
        }
        self.table.set_max_size(size);
        self.pending_size_update = Some(size);
    }

    pub fn table_size(&self) -> usize {
        self.table.current_size()
    }

    /// Encode a header list into one block.
    pub fn encode(&mut self, fields: &[HeaderField]) -> Bytes {
        let mut out = Vec::with_capacity(fields.len() * 32);

        if let Some(size) = self.pending_size_update.take() {
            out.push(0x20);
            integer::encode(size, 5, &mut out);
        }

        for field in fields {
            self.encode_field(field, &mut out);
        }

        Bytes::from(out)
    }

    fn encode_field(&mut self, field: &HeaderField, out: &mut Vec<u8>) {
        let name = &field.name;
        let value = &field.value;

        if field.sensitive {
            // Never-indexed representation, 4-bit name index prefix.
            out.push(0x10);
            let name_index = self.find_name(name);
            integer::encode(name_index.unwrap_or(0), 4, out);
            if name_index.is_none() {
                self.string(name.as_bytes(), out);
            }
            self.string(value, out);
            return;
        }

        if let Some(index) = self.find(name, value) {
            out.push(0x80);
            integer::encode(index, 7, out);
            return;
        }

        // Literal with incremental indexing, 6-bit name index prefix.
        out.push(0x40);
        let name_index = self.find_name(name);
        integer::encode(name_index.unwrap_or(0), 6, out);
        if name_index.is_none() {
            self.string(name.as_bytes(), out);
        }
        self.string(value, out);
        self.table.add(name.clone(), value.clone());
    }

    /// Combined static+dynamic exact-match index.
    fn find(&self, name: &str, value: &[u8]) -> Option<usize> {
        static_table::find(name, value)
            .or_else(|| self.table.find(name, value).map(|i| i + STATIC_TABLE_SIZE))
    }

    /// Combined static+dynamic name index.
    fn find_name(&self, name: &str) -> Option<usize> {
        static_table::find_name(name)
            .or_else(|| self.table.find_name(name).map(|i| i + STATIC_TABLE_SIZE))
    }

    /// Emit a string literal (section 5.2) under the huffman strategy.
    fn string(&self, input: &[u8], out: &mut Vec<u8>) {
        let coded = match self.huffman {
            HuffmanStrategy::Always => true,
            HuffmanStrategy::Never => false,
            HuffmanStrategy::WhenSmaller => huffman::encoded_len(input) < input.len(),
        };

        if coded {
            let encoded = huffman::encode(input);
            out.push(0x80);
            integer::encode(encoded.len(), 7, out);
            out.extend_from_slice(&encoded);
        } else {
            out.push(0x00);
            integer::encode(input.len(), 7, out);
            out.extend_from_slice(input);
        }
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}
