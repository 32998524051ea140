//! # ilweave Prelude
//!
//! The types needed by instrumentation logic built on top of `ilweave`, for glob imports.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all ilweave operations
pub use crate::Error;

/// The reason of an unrecoverable rewrite failure
pub use crate::FatalReason;

/// The result type used throughout ilweave
pub use crate::Result;

// ================================================================================================
// Host Interface
// ================================================================================================

/// The method being rewritten and the tokenizer of its module
pub use crate::function::{Function, Tokenizer};

/// Metadata token type
pub use crate::metadata::token::Token;

// ================================================================================================
// Rewriting
// ================================================================================================

/// The per-method rewriter and its configuration
pub use crate::rewriter::{MethodRewriter, RewriterConfig};

/// Deferred code blocks and free-standing emission helpers
pub use crate::rewriter::{
    emit_return, generator, throw_exception, throw_exception_if_null, Generator,
};

/// The process-wide method info cache
pub use crate::rewriter::{MethodInfoCache, MethodInfoCacheKey};

// ================================================================================================
// Instructions and Method Bodies
// ================================================================================================

/// Instruction building
pub use crate::assembly::{InstructionSet, Label, OpCode};

/// Method body structures
pub use crate::metadata::method::{
    ExceptionClause, ExceptionHandlerFlags, ExceptionSection, MethodBody, MethodHeader,
};

/// Signatures
pub use crate::metadata::signatures::{LocalsSignature, SignatureMethod, SignatureParameter};
