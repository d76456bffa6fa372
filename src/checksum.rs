//! One's-complement checksum used by the footer, sparse header, and BATmap header.

/// Sums every byte of `buf` as a wrapping `u32` and returns the one's complement.
///
/// Callers are responsible for zeroing the checksum field in `buf` before calling this
/// (see [`sub`] for verifying a stored checksum without mutating the buffer).
pub fn compute(buf: &[u8]) -> u32 {
    let sum = buf.iter().fold(0u32, |acc, &b| acc.wrapping_add(b as u32));
    !sum
}

/// Given a stored checksum `stored` that was computed over a buffer whose checksum
/// field held `field_value` (instead of zero), returns what the checksum would have
/// been had that field read zero.
///
/// `stored = !(sum_without_field + field_value)`, so
/// `sum_without_field = !stored - field_value`, and the zero-field checksum is
/// `!sum_without_field`. Each byte of `field_value` contributes independently to the
/// sum regardless of its position, so this only needs the field's big-endian byte sum.
pub fn sub(stored: u32, field_value: u32) -> u32 {
    let field_byte_sum = field_value
        .to_be_bytes()
        .iter()
        .fold(0u32, |acc, &b| acc.wrapping_add(b as u32));

    let sum_without_field = (!stored).wrapping_sub(field_byte_sum);
    !sum_without_field
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_matches_definition() {
        let buf = [1u8, 2, 3, 4, 0, 0, 0, 0];
        let expected = !(1u32 + 2 + 3 + 4);
        assert_eq!(compute(&buf), expected);
    }

    #[test]
    fn sub_recovers_zero_field_checksum() {
        let mut buf = [10u8, 20, 0, 0, 0, 0, 30, 40];
        let zero_checksum = compute(&buf);

        let field_value = 0xDEAD_BEEFu32;
        buf[2..6].copy_from_slice(&field_value.to_be_bytes());
        let stored = compute(&buf);

        assert_eq!(sub(stored, field_value), zero_checksum);
    }

    #[test]
    fn sub_agrees_with_recompute_on_marshal_unmarshal_roundtrip() {
        // Mirrors the "open question" in the spec: the subtractive method used on
        // unmarshal and the direct recompute used on marshal must always agree.
        let mut buf = vec![0u8; 512];
        for (i, b) in buf.iter_mut().enumerate() {
            *b = (i * 7 + 3) as u8;
        }
        buf[64..68].copy_from_slice(&[0, 0, 0, 0]);
        let marshal_checksum = compute(&buf);

        // "Marshal": write the checksum into its own field.
        buf[64..68].copy_from_slice(&marshal_checksum.to_be_bytes());

        // "Unmarshal": recover the zero-field checksum via subtraction, without
        // mutating `buf`.
        let stored = u32::from_be_bytes(buf[64..68].try_into().unwrap());
        let unmarshal_checksum = sub(stored, stored);

        assert_eq!(unmarshal_checksum, marshal_checksum);
    }
}
