//! ECMA-335 compressed unsigned integer encoding (II.23.2).
//!
//! Decoding lives on [`crate::Parser::read_compressed_uint`]; this module provides the
//! writing side, used when the local count of a signature is re-encoded.

/// Largest value representable as a compressed unsigned integer.
pub const COMPRESSED_UINT_MAX: u32 = 0x1FFF_FFFF;

/// Returns the number of bytes (1, 2, or 4) needed to encode `value`.
///
/// - Values < 0x80 use 1 byte
/// - Values < 0x4000 use 2 bytes
/// - Larger values use 4 bytes
#[must_use]
pub fn compressed_uint_size(value: u32) -> usize {
    if value < 0x80 {
        1
    } else if value < 0x4000 {
        2
    } else {
        4
    }
}

/// Appends `value` to `buffer` as a compressed unsigned integer.
///
/// Values above [`COMPRESSED_UINT_MAX`] can not be represented; they are masked to 29 bits,
/// callers are expected to range-check beforehand.
#[allow(clippy::cast_possible_truncation)]
pub fn write_compressed_uint(value: u32, buffer: &mut Vec<u8>) {
    match compressed_uint_size(value) {
        1 => buffer.push(value as u8),
        2 => {
            buffer.push(0x80 | (value >> 8) as u8);
            buffer.push(value as u8);
        }
        _ => {
            let value = value & COMPRESSED_UINT_MAX;
            buffer.push(0xC0 | (value >> 24) as u8);
            buffer.push((value >> 16) as u8);
            buffer.push((value >> 8) as u8);
            buffer.push(value as u8);
        }
    }
}

/// Encodes `value` into a fresh buffer.
#[must_use]
pub fn compress_uint(value: u32) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(4);
    write_compressed_uint(value, &mut buffer);
    buffer
}
