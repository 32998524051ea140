//! Bounds-checked binary access used by all codecs of this crate.
//!
//! - [`io`] - little-endian primitive reads and writes on byte buffers
//! - [`parser`] - a cursor over a byte slice with compressed integer support

pub mod io;
pub mod parser;
