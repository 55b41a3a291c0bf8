//! HPACK Huffman codec (RFC 7541 Appendix B).
//!
//! Codes are stored right-aligned. Decoding walks a lazily-built binary
//! tree; the EOS symbol must never appear inside a string, and trailing
//! padding must be the most significant bits of EOS (all ones, at most
//! seven of them).

use std::sync::OnceLock;

use super::error::HpackError;

/// `(code, bit length)` for byte values 0x00-0xFF. EOS is kept separate.
const HUFFMAN_TABLE: [(u32, u8); 256] = [
    (0x1ff8, 13), (0x7fffd8, 23), (0xfffffe2, 28), (0xfffffe3, 28),
    (0xfffffe4, 28), (0xfffffe5, 28), (0xfffffe6, 28), (0xfffffe7, 28),
    (0xfffffe8, 28), (0xffffea, 24), (0x3ffffffc, 30), (0xfffffe9, 28),
    (0xfffffea, 28), (0x3ffffffd, 30), (0xfffffeb, 28), (0xfffffec, 28),
    (0xfffffed, 28), (0xfffffee, 28), (0xfffffef, 28), (0xffffff0, 28),
    (0xffffff1, 28), (0xffffff2, 28), (0x3ffffffe, 30), (0xffffff3, 28),
    (0xffffff4, 28), (0xffffff5, 28), (0xffffff6, 28), (0xffffff7, 28),
    (0xffffff8, 28), (0xffffff9, 28), (0xffffffa, 28), (0xffffffb, 28),
    (0x14, 6), (0x3f8, 10), (0x3f9, 10), (0xffa, 12),
    (0x1ff9, 13), (0x15, 6), (0xf8, 8), (0x7fa, 11),
    (0x3fa, 10), (0x3fb, 10), (0xf9, 8), (0x7fb, 11),
    (0xfa, 8), (0x16, 6), (0x17, 6), (0x18, 6),
    (0x0, 5), (0x1, 5), (0x2, 5), (0x19, 6),
    (0x1a, 6), (0x1b, 6), (0x1c, 6), (0x1d, 6),
    (0x1e, 6), (0x1f, 6), (0x5c, 7), (0xfb, 8),
    (0x7ffc, 15), (0x20, 6), (0xffb, 12), (0x3fc, 10),
    (0x1ffa, 13), (0x21, 6), (0x5d, 7), (0x5e, 7),
    (0x5f, 7), (0x60, 7), (0x61, 7), (0x62, 7),
    (0x63, 7), (0x64, 7), (0x65, 7), (0x66, 7),
    (0x67, 7), (0x68, 7), (0x69, 7), (0x6a, 7),
    (0x6b, 7), (0x6c, 7), (0x6d, 7), (0x6e, 7),
    (0x6f, 7), (0x70, 7), (0x71, 7), (0x72, 7),
    (0xfc, 8), (0x73, 7), (0xfd, 8), (0x1ffb, 13),
    (0x7fff0, 19), (0x1ffc, 13), (0x3ffc, 14), (0x22, 6),
    (0x7ffd, 15), (0x3, 5), (0x23, 6), (0x4, 5),
    (0x24, 6), (0x5, 5), (0x25, 6), (0x26, 6),
    (0x27, 6), (0x6, 5), (0x74, 7), (0x75, 7),
    (0x28, 6), (0x29, 6), (0x2a, 6), (0x7, 5),
    (0x2b, 6), (0x76, 7), (0x2c, 6), (0x8, 5),
    (0x9, 5), (0x2d, 6), (0x77, 7), (0x78, 7),
    (0x79, 7), (0x7a, 7), (0x7b, 7), (0x7ffe, 15),
    (0x7fc, 11), (0x3ffd, 14), (0x1ffd, 13), (0xffffffc, 28),
    (0xfffe6, 20), (0x3fffd2, 22), (0xfffe7, 20), (0xfffe8, 20),
    (0x3fffd3, 22), (0x3fffd4, 22), (0x3fffd5, 22), (0x7fffd9, 23),
    (0x3fffd6, 22), (0x7fffda, 23), (0x7fffdb, 23), (0x7fffdc, 23),
    (0x7fffdd, 23), (0x7fffde, 23), (0xffffeb, 24), (0x7fffdf, 23),
    (0xffffec, 24), (0xffffed, 24), (0x3fffd7, 22), (0x7fffe0, 23),
    (0xffffee, 24), (0x7fffe1, 23), (0x7fffe2, 23), (0x7fffe3, 23),
    (0x7fffe4, 23), (0x1fffdc, 21), (0x3fffd8, 22), (0x7fffe5, 23),
    (0x3fffd9, 22), (0x7fffe6, 23), (0x7fffe7, 23), (0xffffef, 24),
    (0x3fffda, 22), (0x1fffdd, 21), (0xfffe9, 20), (0x3fffdb, 22),
    (0x3fffdc, 22), (0x7fffe8, 23), (0x7fffe9, 23), (0x1fffde, 21),
    (0x7fffea, 23), (0x3fffdd, 22), (0x3fffde, 22), (0xfffff0, 24),
    (0x1fffdf, 21), (0x3fffdf, 22), (0x7fffeb, 23), (0x7fffec, 23),
    (0x1fffe0, 21), (0x1fffe1, 21), (0x3fffe0, 22), (0x1fffe2, 21),
    (0x7fffed, 23), (0x3fffe1, 22), (0x7fffee, 23), (0x7fffef, 23),
    (0xfffea, 20), (0x3fffe2, 22), (0x3fffe3, 22), (0x3fffe4, 22),
    (0x7ffff0, 23), (0x3fffe5, 22), (0x3fffe6, 22), (0x7ffff1, 23),
    (0x3ffffe0, 26), (0x3ffffe1, 26), (0xfffeb, 20), (0x7fff1, 19),
    (0x3fffe7, 22), (0x7ffff2, 23), (0x3fffe8, 22), (0x1ffffec, 25),
    (0x3ffffe2, 26), (0x3ffffe3, 26), (0x3ffffe4, 26), (0x7ffffde, 27),
    (0x7ffffdf, 27), (0x3ffffe5, 26), (0xfffff1, 24), (0x1ffffed, 25),
    (0x7fff2, 19), (0x1fffe3, 21), (0x3ffffe6, 26), (0x7ffffe0, 27),
    (0x7ffffe1, 27), (0x3ffffe7, 26), (0x7ffffe2, 27), (0xfffff2, 24),
    (0x1fffe4, 21), (0x1fffe5, 21), (0x3ffffe8, 26), (0x3ffffe9, 26),
    (0xffffffd, 28), (0x7ffffe3, 27), (0x7ffffe4, 27), (0x7ffffe5, 27),
    (0xfffec, 20), (0xfffff3, 24), (0xfffed, 20), (0x1fffe6, 21),
    (0x3fffe9, 22), (0x1fffe7, 21), (0x1fffe8, 21), (0x7ffff3, 23),
    (0x3fffea, 22), (0x3fffeb, 22), (0x1ffffee, 25), (0x1ffffef, 25),
    (0xfffff4, 24), (0xfffff5, 24), (0x3ffffea, 26), (0x7ffff4, 23),
    (0x3ffffeb, 26), (0x7ffffe6, 27), (0x3ffffec, 26), (0x3ffffed, 26),
    (0x7ffffe7, 27), (0x7ffffe8, 27), (0x7ffffe9, 27), (0x7ffffea, 27),
    (0x7ffffeb, 27), (0xffffffe, 28), (0x7ffffec, 27), (0x7ffffed, 27),
    (0x7ffffee, 27), (0x7ffffef, 27), (0x7fffff0, 27), (0x3ffffee, 26),
];

const EOS_CODE: u32 = 0x3fff_ffff;
const EOS_LEN: u8 = 30;

/// Exact encoded size in bytes, for the size-heuristic strategy.
pub fn encoded_len(input: &[u8]) -> usize {
    let bits: usize = input
        .iter()
        .map(|&b| HUFFMAN_TABLE[b as usize].1 as usize)
        .sum();
    bits.div_ceil(8)
}

/// Huffman-encode `input`, padding the final partial octet with the most
/// significant bits of EOS.
pub fn encode(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(encoded_len(input));
    let mut acc: u64 = 0;
    let mut bits: u8 = 0;

    for &byte in input {
        let (code, len) = HUFFMAN_TABLE[byte as usize];
        acc = (acc << len) | code as u64;
        bits += len;
        while bits >= 8 {
            bits -= 8;
            out.push((acc >> bits) as u8);
        }
    }

    if bits > 0 {
        let pad = 8 - bits;
        acc = (acc << pad) | ((1u64 << pad) - 1);
        out.push(acc as u8);
    }

    out
}

/// Binary decode tree. Node cells hold either another node index or
/// `LEAF | symbol`; `UNSET` marks codes that do not exist.
struct DecodeTree {
    nodes: Vec<[u16; 2]>,
}

const UNSET: u16 = u16::MAX;
const LEAF: u16 = 0x8000;

impl DecodeTree {
    fn build() -> Self {
        let mut nodes = vec![[UNSET; 2]];
        let mut insert = |code: u32, len: u8, symbol: u16, nodes: &mut Vec<[u16; 2]>| {
            let mut node = 0usize;
            for bit_pos in (0..len).rev() {
                let bit = ((code >> bit_pos) & 1) as usize;
                if bit_pos == 0 {
                    nodes[node][bit] = LEAF | symbol;
                } else {
                    if nodes[node][bit] == UNSET {
                        nodes.push([UNSET; 2]);
                        let next = (nodes.len() - 1) as u16;
                        nodes[node][bit] = next;
                    }
                    node = nodes[node][bit] as usize;
                }
            }
        };

        for (symbol, &(code, len)) in HUFFMAN_TABLE.iter().enumerate() {
            insert(code, len, symbol as u16, &mut nodes);
        }
        insert(EOS_CODE, EOS_LEN, 256, &mut nodes);

        Self { nodes }
    }
}

static DECODE_TREE: OnceLock<DecodeTree> = OnceLock::new();

/// Decode a Huffman-encoded string.
pub fn decode(input: &[u8]) -> Result<Vec<u8>, HpackError> {
    let tree = DECODE_TREE.get_or_init(DecodeTree::build);
    let mut out = Vec::with_capacity(input.len() * 2);

    let mut node = 0usize;
    // Bits consumed since the last completed symbol, and whether they were
    // all ones; used to validate the final padding.
    let mut partial_bits: u8 = 0;
    let mut partial_all_ones = true;

    for &byte in input {
        for shift in (0..8).rev() {
            let bit = ((byte >> shift) & 1) as usize;
            let cell = tree.nodes[node][bit];
            if cell == UNSET {
                return Err(HpackError::InvalidHuffman);
            }
            partial_bits += 1;
            partial_all_ones &= bit == 1;

            if cell & LEAF != 0 {
                let symbol = cell & !LEAF;
                if symbol == 256 {
                    return Err(HpackError::EosInString);
                }
                out.push(symbol as u8);
                node = 0;
                partial_bits = 0;
                partial_all_ones = true;
            } else {
                node = cell as usize;
            }
        }
    }

    // RFC 7541 section 5.2: padding strictly longer than 7 bits or not
    // matching the EOS prefix must be treated as a decoding error.
    if partial_bits > 7 || !partial_all_ones {
        return Err(HpackError::InvalidPadding);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc_c4_1_www_example_com() {
        // RFC 7541 Appendix C.4.1
        let encoded = encode(b"www.example.com");
        assert_eq!(
            encoded,
            [0xf1, 0xe3, 0xc2, 0xe5, 0xf2, 0x3a, 0x6b, 0xa0, 0xab, 0x90, 0xf4, 0xff]
        );
        assert_eq!(decode(&encoded).unwrap(), b"www.example.com");
    }

    #[test]
    fn rfc_c4_2_no_cache() {
        let encoded = encode(b"no-cache");
        assert_eq!(encoded, [0xa8, 0xeb, 0x10, 0x64, 0x9c, 0xbf]);
        assert_eq!(decode(&encoded).unwrap(), b"no-cache");
    }

    #[test]
    fn rfc_c6_1_date_value() {
        let encoded = encode(b"Mon, 21 Oct 2013 20:13:21 GMT");
        assert_eq!(
            encoded,
            [
                0xd0, 0x7a, 0xbe, 0x94, 0x10, 0x54, 0xd4, 0x44, 0xa8, 0x20, 0x05, 0x95, 0x04,
                0x0b, 0x81, 0x66, 0xe0, 0x82, 0xa6, 0x2d, 0x1b, 0xff
            ]
        );
        assert_eq!(decode(&encoded).unwrap(), b"Mon, 21 Oct 2013 20:13:21 GMT");
    }

    #[test]
    fn round_trip_all_byte_values() {
        let input: Vec<u8> = (0..=255u8).collect();
        assert_eq!(decode(&encode(&input)).unwrap(), input);
    }

    #[test]
    fn encoded_len_matches_encode() {
        for input in [&b"a"[..], b"hello", b"www.example.com", b"/index.html"] {
            assert_eq!(encoded_len(input), encode(input).len());
        }
    }

    #[test]
    fn empty_input() {
        assert!(encode(b"").is_empty());
        assert_eq!(decode(b"").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn eos_in_string_rejected() {
        // Four bytes of all ones: 30-bit EOS code followed by ones.
        let err = decode(&[0xff, 0xff, 0xff, 0xff]).unwrap_err();
        assert_eq!(err, HpackError::EosInString);
    }

    #[test]
    fn padding_with_zero_bit_rejected() {
        // 'a' is 00011 (5 bits); pad with 110 instead of 111.
        let byte = (0b00011 << 3) | 0b110;
        assert_eq!(decode(&[byte]).unwrap_err(), HpackError::InvalidPadding);
    }

    #[test]
    fn eight_bit_padding_rejected() {
        // 'a' then a full 0xff octet: 3 bits of valid padding would have
        // ended the string; the extra ones make the padding 11 bits.
        let first = (0b00011 << 3) | 0b111;
        assert_eq!(
            decode(&[first, 0xff]).unwrap_err(),
            HpackError::InvalidPadding
        );
    }
}
