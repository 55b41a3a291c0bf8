//! HPACK decoder (RFC 7541).
//!
//! Decodes one header block into a header list, applying dynamic-table
//! updates as it goes. Owned exclusively by the connection's reader task.

use bytes::Bytes;

use super::dynamic_table::DynamicTable;
use super::error::HpackError;
use super::huffman;
use super::integer;
use super::static_table::{self, STATIC_TABLE_SIZE};
use crate::headers::HeaderField;

pub struct Decoder {
    table: DynamicTable,
    /// Ceiling for size updates: the HEADER_TABLE_SIZE we advertised (and
    /// the peer acknowledged). A block may lower the table below this but
    /// never raise it above.
    max_size_limit: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            table: DynamicTable::new(4096),
            max_size_limit: 4096,
        }
    }

    /// Apply a new acknowledged HEADER_TABLE_SIZE of our own settings.
    pub fn set_max_size_limit(&mut self, limit: usize) {
        self.max_size_limit = limit;
        if self.table.max_size() > limit {
            self.table.set_max_size(limit);
        }
    }

    pub fn table_size(&self) -> usize {
        self.table.current_size()
    }

    /// Decode a complete header block.
    ///
    /// When the cumulative list size exceeds `max_list_size`, decoding
    /// still runs to the end of the block so the dynamic table stays
    /// synchronized with the peer's encoder, then reports
    /// [`HpackError::ListTooLarge`].
    pub fn decode(
        &mut self,
        block: &[u8],
        max_list_size: Option<usize>,
    ) -> Result<Vec<HeaderField>, HpackError> {
        let mut fields = Vec::new();
        let mut pos = 0;
        let mut seen_field = false;
        let mut list_size = 0usize;
        let mut too_large = false;

        while pos < block.len() {
            let byte = block[pos];

            if byte & 0x80 != 0 {
                // Indexed header field (section 6.1).
                let (index, consumed) = integer::decode(&block[pos..], 7)?;
                pos += consumed;
                let (name, value) = self.lookup(index)?;
                seen_field = true;
                self.push_field(
                    &mut fields,
                    HeaderField::raw(name, value, false),
                    &mut list_size,
                    max_list_size,
                    &mut too_large,
                );
            } else if byte & 0xc0 == 0x40 {
                // Literal with incremental indexing (section 6.2.1).
                let (name, value, consumed) = self.literal(&block[pos..], 6)?;
                pos += consumed;
                seen_field = true;
                self.table.add(name.clone(), value.clone());
                self.push_field(
                    &mut fields,
                    HeaderField::raw(name, value, false),
                    &mut list_size,
                    max_list_size,
                    &mut too_large,
                );
            } else if byte & 0xe0 == 0x20 {
                // Dynamic table size update (section 6.3). Must precede
                // any header representation in the block.
                if seen_field {
                    return Err(HpackError::LateTableSizeUpdate);
                }
                let (size, consumed) = integer::decode(&block[pos..], 5)?;
                pos += consumed;
                if size > self.max_size_limit {
                    return Err(HpackError::TableSizeExceedsLimit(size, self.max_size_limit));
                }
                self.table.set_max_size(size);
            } else if byte & 0xf0 == 0x10 {
                // Literal never indexed (section 6.2.3).
                let (name, value, consumed) = self.literal(&block[pos..], 4)?;
                pos += consumed;
                seen_field = true;
                self.push_field(
                    &mut fields,
                    HeaderField::raw(name, value, true),
                    &mut list_size,
                    max_list_size,
                    &mut too_large,
                );
            } else {
                // Literal without indexing (section 6.2.2), prefix 0000.
                let (name, value, consumed) = self.literal(&block[pos..], 4)?;
                pos += consumed;
                seen_field = true;
                self.push_field(
                    &mut fields,
                    HeaderField::raw(name, value, false),
                    &mut list_size,
                    max_list_size,
                    &mut too_large,
                );
            }
        }

        if too_large {
            return Err(HpackError::ListTooLarge);
        }
        Ok(fields)
    }

    fn push_field(
        &self,
        fields: &mut Vec<HeaderField>,
        field: HeaderField,
        list_size: &mut usize,
        max_list_size: Option<usize>,
        too_large: &mut bool,
    ) {
        *list_size += field.hpack_size();
        if let Some(limit) = max_list_size {
            if *list_size > limit {
                // Keep decoding for table consistency, stop retaining.
                *too_large = true;
                return;
            }
        }
        fields.push(field);
    }

    /// Resolve a combined static+dynamic index into an owned (name, value).
    fn lookup(&self, index: usize) -> Result<(String, Bytes), HpackError> {
        if index == 0 {
            return Err(HpackError::InvalidIndex(0));
        }
        if index <= STATIC_TABLE_SIZE {
            let (name, value) = static_table::get(index).ok_or(HpackError::InvalidIndex(index))?;
            Ok((name.to_string(), Bytes::from_static(value.as_bytes())))
        } else {
            let entry = self
                .table
                .get(index - STATIC_TABLE_SIZE)
                .ok_or(HpackError::InvalidIndex(index))?;
            Ok((entry.name.clone(), entry.value.clone()))
        }
    }

    /// Decode a literal representation body: indexed-or-literal name, then
    /// a literal value. Returns (name, value, bytes consumed).
    fn literal(
        &self,
        data: &[u8],
        name_prefix_bits: u8,
    ) -> Result<(String, Bytes, usize), HpackError> {
        let (name_index, mut pos) = integer::decode(data, name_prefix_bits)?;

        let name = if name_index == 0 {
            let (name_bytes, consumed) = self.string(&data[pos..])?;
            pos += consumed;
            String::from_utf8_lossy(&name_bytes).into_owned()
        } else {
            self.lookup(name_index)?.0
        };

        let (value_bytes, consumed) = self.string(&data[pos..])?;
        pos += consumed;

        Ok((name, Bytes::from(value_bytes), pos))
    }

    /// Decode a string literal (section 5.2): H flag, 7-bit length prefix,
    /// then raw or Huffman-coded octets.
    fn string(&self, data: &[u8]) -> Result<(Vec<u8>, usize), HpackError> {
        if data.is_empty() {
            return Err(HpackError::UnexpectedEof);
        }
        let huffman_coded = data[0] & 0x80 != 0;
        let (length, mut pos) = integer::decode(data, 7)?;

        let end = pos.checked_add(length).ok_or(HpackError::IntegerOverflow)?;
        if end > data.len() {
            return Err(HpackError::UnexpectedEof);
        }
        let raw = &data[pos..end];
        pos = end;

        let bytes = if huffman_coded {
            huffman::decode(raw)?
        } else {
            raw.to_vec()
        };
        Ok((bytes, pos))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
