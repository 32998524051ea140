//! Method body layout: headers, code and exception handling sections.
//!
//! # Key Types
//! - [`MethodBody`]: a method body decomposed into header, code and exception data
//! - [`MethodHeader`]: the fat header every rewrite operates on
//! - [`ExceptionSection`]: original and added exception handling clauses
//!
//! # References
//! - ECMA-335 6th Edition, Partition II, Section 25.4 - Common Intermediate Language Physical Layout

mod exceptions;
mod header;
mod types;

pub use exceptions::*;
pub use header::*;
pub use types::*;
