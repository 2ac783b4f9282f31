//! Pack entry headers.
//!
//! The first byte holds a continuation bit, the 3-bit object type and the
//! low 4 bits of the uncompressed size; each following byte holds a
//! continuation bit and 7 more size bits, least significant first.

use hoard_types::ObjectKind;

use crate::error::{PackError, PackResult};

pub const PACK_MAGIC: &[u8; 4] = b"PACK";
pub const PACK_VERSION: u32 = 2;
pub const PACK_HEADER_LEN: usize = 12;
/// Longest header a 64-bit size needs.
pub const MAX_ENTRY_HEADER_LEN: usize = 10;

pub fn encode_header(kind: ObjectKind, size: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(MAX_ENTRY_HEADER_LEN);
    let mut byte = (kind.pack_code() << 4) | (size & 0x0f) as u8;
    let mut rest = size >> 4;
    while rest > 0 {
        out.push(byte | 0x80);
        byte = (rest & 0x7f) as u8;
        rest >>= 7;
    }
    out.push(byte);
    out
}

/// Parse a header from the start of `buf`, returning the kind, the
/// uncompressed size and the header length. `offset` only labels errors.
pub fn decode_header(buf: &[u8], offset: u64) -> PackResult<(ObjectKind, u64, usize)> {
    let Some(&first) = buf.first() else {
        return Err(PackError::corrupt(offset, "empty entry header"));
    };
    let code = (first >> 4) & 0x07;
    let kind = ObjectKind::from_pack_code(code)
        .ok_or_else(|| PackError::corrupt(offset, format!("unsupported object type {code}")))?;
    let mut size = u64::from(first & 0x0f);
    let mut shift = 4;
    let mut byte = first;
    let mut len = 1;
    while byte & 0x80 != 0 {
        if len >= MAX_ENTRY_HEADER_LEN {
            return Err(PackError::corrupt(offset, "entry size overflows"));
        }
        byte = *buf
            .get(len)
            .ok_or_else(|| PackError::corrupt(offset, "truncated entry header"))?;
        size |= u64::from(byte & 0x7f) << shift;
        shift += 7;
        len += 1;
    }
    Ok((kind, size, len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_sizes_fit_one_byte() {
        assert_eq!(encode_header(ObjectKind::Blob, 5), vec![0x35]);
        assert_eq!(encode_header(ObjectKind::Tree, 0), vec![0x20]);
        assert_eq!(
            decode_header(&[0x35, 0xff], 0).unwrap(),
            (ObjectKind::Blob, 5, 1)
        );
    }

    #[test]
    fn larger_sizes_continue() {
        assert_eq!(encode_header(ObjectKind::Blob, 100), vec![0xb4, 0x06]);
        let big = 1u64 << 40;
        let hdr = encode_header(ObjectKind::Commit, big);
        assert_eq!(decode_header(&hdr, 0).unwrap(), (ObjectKind::Commit, big, hdr.len()));
        let max = encode_header(ObjectKind::Blob, u64::MAX);
        assert_eq!(max.len(), MAX_ENTRY_HEADER_LEN);
        assert_eq!(decode_header(&max, 0).unwrap().1, u64::MAX);
    }

    #[test]
    fn malformed_headers() {
        assert!(matches!(
            decode_header(&[], 7),
            Err(PackError::CorruptEntry { offset: 7, .. })
        ));
        assert!(decode_header(&[0xb4], 0).is_err());
        // Type 6 is an offset delta, which this store never writes.
        assert!(decode_header(&[0x60], 0).is_err());
        assert!(decode_header(&[0xb0; 12], 0).is_err());
    }
}
