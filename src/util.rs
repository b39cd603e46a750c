//! Small formatting and arithmetic helpers.

use std::fmt::Write as _;

/// Round `value` up to the next multiple of `alignment`.
///
/// `alignment` must be a power of two. Saturates to the highest aligned
/// value instead of wrapping.
#[inline]
pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    let mask = alignment - 1;
    match value.checked_add(mask) {
        Some(v) => v & !mask,
        None => align_down(value, alignment),
    }
}

/// Round `value` down to a multiple of `alignment` (a power of two).
#[inline]
pub fn align_down(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    value & !(alignment - 1)
}

/// Whether `value` is a multiple of `alignment` (a power of two).
#[inline]
pub fn is_aligned(value: u64, alignment: u64) -> bool {
    value & (alignment - 1) == 0
}

/// Format `value` as zero-padded hex, e.g. `0x0000000000001000`.
pub fn hex_string(value: u64, digits: usize) -> String {
    format!("0x{:0width$x}", value, width = digits)
}

/// Hex dump with 16 bytes per line, each line prefixed by its address.
pub fn hex_dump(data: &[u8], address: u64) -> String {
    let mut out = String::new();
    for (line, chunk) in data.chunks(16).enumerate() {
        if line > 0 {
            out.push('\n');
        }
        out.push_str(&hex_string(address + (line as u64) * 16, 16));
        out.push_str(": ");
        for byte in chunk {
            let _ = write!(out, "{:02x} ", byte);
        }
    }
    out
}

/// Convert a host-order value to big-endian.
#[inline]
pub fn to_big_endian(value: u64) -> u64 {
    value.to_be()
}

/// Convert a big-endian value to host order.
#[inline]
pub fn from_big_endian(value: u64) -> u64 {
    u64::from_be(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::PAGE_SIZE;

    #[test]
    fn test_alignment_bounds() {
        let samples = [
            0u64,
            1,
            4095,
            4096,
            4097,
            0x1234_5678,
            u64::MAX - 4096,
            u64::MAX - 1,
            u64::MAX,
        ];
        for v in samples {
            let down = align_down(v, PAGE_SIZE);
            let up = align_up(v, PAGE_SIZE);
            assert!(down <= v, "{v:#x}");
            assert!(is_aligned(down, PAGE_SIZE));
            assert!(is_aligned(up, PAGE_SIZE));
            if v <= u64::MAX - (PAGE_SIZE - 1) {
                assert!(v <= up, "{v:#x}");
                assert!(up - down < 2 * PAGE_SIZE);
            }
        }
    }

    #[test]
    fn test_aligned_values_are_fixed_points() {
        for v in [0u64, 4096, 0x10_0000, u64::MAX & !(PAGE_SIZE - 1)] {
            assert_eq!(align_up(v, PAGE_SIZE), v);
            assert_eq!(align_down(v, PAGE_SIZE), v);
        }
    }

    #[test]
    fn test_hex_string() {
        assert_eq!(hex_string(0x1000, 16), "0x0000000000001000");
        assert_eq!(hex_string(0xff, 4), "0x00ff");
    }

    #[test]
    fn test_hex_dump() {
        let data: Vec<u8> = (0u8..18).collect();
        let dump = hex_dump(&data, 0x1000);
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("0x0000000000001000: 00 01 02"));
        assert_eq!(lines[1], "0x0000000000001010: 10 11 ");
    }

    #[test]
    fn test_endian_round_trip() {
        let v = 0x0102_0304_0506_0708;
        assert_eq!(to_big_endian(v).to_ne_bytes(), v.to_be_bytes());
        assert_eq!(from_big_endian(to_big_endian(v)), v);
    }
}
