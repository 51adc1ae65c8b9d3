//! Tagged-integer codec
//!
//! The kernel's runtime represents small integers as fixnums: the value
//! shifted left by one, leaving the low bit clear as the integer tag. Every
//! counter, page number and flag word the loader writes into kernel-visible
//! structures uses this encoding. Getting it wrong silently doubles (or
//! halves) every value the kernel reads, so the codec lives here in exactly
//! one place.

/// Encode a signed integer as a fixnum.
#[inline]
#[must_use]
pub const fn fixnum(value: i64) -> u64 {
    (value as u64) << 1
}

/// Decode a fixnum back to a signed integer.
///
/// The shift is arithmetic: negative fixnums sign-extend.
#[inline]
#[must_use]
pub const fn unfixnum(raw: u64) -> i64 {
    (raw as i64) >> 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        for &value in &[
            0i64,
            1,
            -1,
            42,
            -42,
            (1 << 62) - 1,
            -(1 << 62),
            0x000F_FFFF_FFFF_FFFF,
            -0x000F_FFFF_FFFF_FFFF,
        ] {
            assert_eq!(unfixnum(fixnum(value)), value);
        }
    }

    #[test]
    fn round_trip_across_range() {
        // Sweep a spread of magnitudes in both signs.
        let mut value = 1i64;
        while value < (1 << 62) {
            assert_eq!(unfixnum(fixnum(value)), value);
            assert_eq!(unfixnum(fixnum(-value)), -value);
            value = value.wrapping_mul(3) + 7;
        }
    }

    #[test]
    fn tag_bit_is_clear() {
        assert_eq!(fixnum(12345) & 1, 0);
        assert_eq!(fixnum(-12345) & 1, 0);
    }

    #[test]
    fn decode_is_arithmetic() {
        // A negative fixnum has its sign bit set; decoding must sign-extend.
        assert_eq!(unfixnum(fixnum(-1)), -1);
        assert_eq!(unfixnum(u64::MAX & !1), -1);
    }
}
