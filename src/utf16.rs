//! Big-endian UTF-16 codec used by the sparse header's `parent_unicode_name` field.

use crate::error::FormatError;

/// Encodes `text` as big-endian UTF-16, with surrogate pairs for characters outside
/// the BMP. No byte-order mark and no terminator are written; callers pad/terminate.
pub fn encode_be(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len() * 2);
    for unit in text.encode_utf16() {
        out.extend_from_slice(&unit.to_be_bytes());
    }
    out
}

/// Decodes a fixed-size byte region containing a UTF-16 string.
///
/// - `FE FF` at the start selects big-endian and is consumed as a BOM.
/// - `FF FE` at the start selects little-endian and is consumed as a BOM.
/// - Otherwise the region is decoded as big-endian starting at offset 0.
///
/// Decoding stops at the first `U+0000` code unit (or at the end of `buf`).
pub fn decode_be_terminated(buf: &[u8]) -> Result<String, FormatError> {
    let (little_endian, body) = match buf {
        [0xFE, 0xFF, rest @ ..] => (false, rest),
        [0xFF, 0xFE, rest @ ..] => (true, rest),
        rest => (false, rest),
    };

    let mut units = Vec::with_capacity(body.len() / 2);
    for chunk in body.chunks_exact(2) {
        let unit = if little_endian {
            u16::from_le_bytes([chunk[0], chunk[1]])
        } else {
            u16::from_be_bytes([chunk[0], chunk[1]])
        };

        if unit == 0 {
            break;
        }
        units.push(unit);
    }

    String::from_utf16(&units).map_err(|_| FormatError::UnpairedSurrogate(units.len()))
}
