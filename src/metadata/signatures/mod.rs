//! Signature parsing and local variable signature handling.
//!
//! The rewriter needs two things from signature blobs: the parameter and return types of
//! the method it rewrites, and a local variable signature it can grow. Both keep the bytes
//! they were built from, so types can be forwarded verbatim into type specifications and
//! new locals.
//!
//! # Examples
//!
//! ```rust
//! use ilweave::metadata::signatures::parse_method_signature;
//!
//! // instance void M(string)
//! let method_sig = parse_method_signature(&[0x20, 0x01, 0x01, 0x0E])?;
//!
//! assert!(method_sig.has_this);
//! assert!(method_sig.return_type.is_void());
//! assert_eq!(method_sig.params.len(), 1);
//! # Ok::<(), ilweave::Error>(())
//! ```
//!
//! # References
//!
//! - ECMA-335 6th Edition, Partition II, Section 23.2 - Blobs and Signatures

mod locals;
mod parser;
mod types;

pub use locals::*;
pub use parser::*;
pub use types::*;

use crate::Result;

/// Parse a `MethodSignature` from a byte slice
///
/// ## Arguments
/// * 'data' - The input slice to parse
///
/// # Errors
/// Returns an error if the signature data is malformed or parsing fails
pub fn parse_method_signature(data: &[u8]) -> Result<SignatureMethod> {
    let mut parser = SignatureParser::new(data);
    parser.parse_method_signature()
}
