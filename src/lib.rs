// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![deny(unsafe_code)]
#![allow(clippy::too_many_arguments)]

//! # ilweave
//!
//! A rewriting engine for CIL method bodies. Given the binary body of one compiled .NET
//! method, `ilweave` decomposes it, lets instrumentation logic inject new code around the
//! original instructions, and reassembles a valid body which the host commits back in place
//! of the original.
//!
//! ## Features
//!
//! - **Both header formats** - Tiny headers are promoted to fat ones; fat headers round-trip
//!   bit-exact
//! - **Growable locals** - New locals are appended to the local variable signature, keeping
//!   its compressed count consistent
//! - **Composable emission** - Parameter arrays, reflective method lookups with a
//!   process-wide cache, protected try/catch regions, guarded throws
//! - **Exception clause bookkeeping** - Original clauses are shifted by the injected prologue,
//!   new ones are appended
//! - **Fatal error policy** - Conditions that may leave the target method unusable are
//!   surfaced as [`Error::Fatal`], never swallowed
//!
//! ## Quick Start
//!
//! The host side of a rewrite is described by two traits: [`Function`] gives access to the
//! method being rewritten, [`Tokenizer`] resolves names into metadata tokens of its module.
//!
//! ```rust,ignore
//! use ilweave::prelude::*;
//!
//! fn trace_entry<F: Function>(function: &F) -> ilweave::Result<()> {
//!     let mut rewriter = MethodRewriter::new(function, RewriterConfig::from_env())?;
//!
//!     rewriter.load_method_info("tracer.dll", "Tracer", "Enter", 1, None, true)?;
//!     rewriter.instructions().append(OpCode::Ldnull)?;
//!     rewriter.build_object_array_of_parameters()?;
//!     rewriter.invoke_method_info()?;
//!     rewriter.instructions().append(OpCode::Pop)?;
//!
//!     rewriter.append_user_code()?;
//!     rewriter.instrument()
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`metadata::method`] - Header formats, method body decomposition, exception sections
//! - [`metadata::signatures`] - Method signature parsing and local variable signatures
//! - [`assembly`] - Opcodes and the instruction builder with label patching
//! - [`rewriter`] - The per-method rewriter, its emission primitives and the finalize paths
//! - [`Error`] and [`Result`] - Error handling
//!
//! ## Logging
//!
//! Structural steps of every rewrite are traced through the [`log`] facade, fatal conditions
//! are logged at error level with the name of the method. No logger is installed by the
//! library.
//!
//! ## Standards Compliance
//!
//! Method bodies, exception sections and signatures are encoded per **ECMA-335** (6th
//! edition), Partition II, sections 23.2 and 25.4.
#[macro_use]
pub(crate) mod error;
pub(crate) mod file;
pub(crate) mod utils;

/// Shared functionality which is used in unit-tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types and traits.
///
/// # Example
///
/// ```rust
/// use ilweave::prelude::*;
///
/// let config = RewriterConfig::default();
/// assert!(!config.disable_method_cache);
/// ```
pub mod prelude;

/// Method bodies and signatures based on ECMA-335
///
/// # Key Components
///
/// - [`metadata::method`] - Tiny and fat headers, [`metadata::method::MethodBody`], exception
///   handling sections
/// - [`metadata::signatures`] - Method signature parsing, growable local variable signatures
/// - [`metadata::token`] - Metadata tokens
pub mod metadata;

/// CIL instruction encoding
///
/// [`assembly::InstructionSet`] builds the code of a rewritten method: instructions with
/// their stack effects, labels and jumps patched in a second pass, protected regions and the
/// splice point of the original code.
pub mod assembly;

/// The host side of a rewrite, see [`Function`] and [`Tokenizer`]
pub mod function;

/// Rewriting a method body, see [`MethodRewriter`]
pub mod rewriter;

/// `ilweave` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `ilweave` Error type
///
/// The main error type for all operations in this crate.
pub use error::{Error, FatalReason};

/// Parser for the binary structures of a method body
pub use file::parser::Parser;

/// Metadata token
pub use metadata::token::Token;

/// The host side of a rewrite
pub use function::{Function, Tokenizer};

/// Per-method rewriter and its configuration
pub use rewriter::{MethodRewriter, RewriterConfig};
