//! Small integer-math helpers shared by the codec, resolver, and writer.
//!
//! The teacher crate (`lingedeng-rvhd`) declares a `math` module that its call sites
//! (`math::ceil`, `math::round_up`, `math::round_down`, `math::bound_to`) clearly rely
//! on, but the module itself was not present in the retrieved source. These are
//! reconstructed from their call sites rather than transcribed.

/// Ceiling division: the smallest `n` such that `n * b >= a`.
pub fn ceil_div(a: u64, b: u64) -> u64 {
    debug_assert!(b > 0);
    (a + b - 1) / b
}

/// Rounds `a` up to the next multiple of `unit`.
pub fn round_up_to(a: u64, unit: u64) -> u64 {
    ceil_div(a, unit) * unit
}

/// Rounds `a` down to the previous (or equal) multiple of `unit`.
pub fn round_down_to(a: u64, unit: u64) -> u64 {
    debug_assert!(unit > 0);
    (a / unit) * unit
}

/// Clamps a requested read/write length to what remains before `capacity`.
///
/// Returns `None` if `offset` is already at or past `capacity`, otherwise the number
/// of bytes (`<= len`) that fit before `capacity`.
pub fn bound_len(capacity: u64, offset: u64, len: usize) -> Option<usize> {
    if offset >= capacity {
        return None;
    }

    let remaining = capacity - offset;
    Some(std::cmp::min(len as u64, remaining) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceil_div_exact_and_inexact() {
        assert_eq!(ceil_div(8, 4), 2);
        assert_eq!(ceil_div(9, 4), 3);
        assert_eq!(ceil_div(1, 4), 1);
    }

    #[test]
    fn round_up_and_down() {
        assert_eq!(round_up_to(513, 512), 1024);
        assert_eq!(round_up_to(512, 512), 512);
        assert_eq!(round_down_to(513, 512), 512);
        assert_eq!(round_down_to(1024, 512), 1024);
    }

    #[test]
    fn bound_len_clamps_at_capacity() {
        assert_eq!(bound_len(100, 90, 20), Some(10));
        assert_eq!(bound_len(100, 50, 20), Some(20));
        assert_eq!(bound_len(100, 100, 20), None);
        assert_eq!(bound_len(100, 150, 20), None);
    }
}
