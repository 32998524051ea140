//! Mathematical utility functions.

use crate::Result;

/// Converts a `usize` to `u32` for method body serialization, returning an error if the value
/// exceeds `u32::MAX`. Method bodies are bounded well below this limit.
///
/// # Errors
///
/// Returns an error if `value` exceeds `u32::MAX`.
pub fn to_u32(value: usize) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| malformed_error!("Method body value {value} exceeds u32::MAX"))
}

/// Rounds `value` up to the next multiple of 4.
///
/// Extra sections of a fat method body and the sections themselves start on 4-byte
/// boundaries (ECMA-335 II.25.4.5).
#[must_use]
pub fn align_to_4(value: usize) -> usize {
    (value + 3) & !3
}
