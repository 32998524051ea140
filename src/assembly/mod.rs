//! CIL instruction encoding for rewritten method bodies.
//!
//! # Key Components
//!
//! - [`OpCode`] - The instructions the rewriter emits, with their encoding and stack effect
//! - [`InstructionSet`] - Append-only builder with labels, protected regions and stack tracking

mod instructions;
mod opcodes;

pub use instructions::*;
pub use opcodes::*;
