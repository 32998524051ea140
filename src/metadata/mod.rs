//! Binary layout of method bodies and the metadata pieces they reference.
//!
//! # Key Components
//!
//! - [`method`] - Method headers, code and exception handling sections
//! - [`signatures`] - Method signature parsing and growable local variable signatures
//! - [`token`] - Metadata table row references

/// Implementation of the method body layout
pub mod method;
/// Implementation of method and local variable signatures
pub mod signatures;
/// Commonly used metadata token type
pub mod token;
