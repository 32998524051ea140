//! The CIL opcodes the rewriter emits (ECMA-335 Partition III).
//!
//! Only the instructions used by the instrumentation primitives are covered. Each opcode knows
//! its encoding, the kind of operand it takes, its effect on the evaluation stack and how it
//! affects control flow. Mnemonics round-trip through [`std::str::FromStr`] and
//! [`std::fmt::Display`].

use strum::{Display, EnumIter, EnumString, IntoStaticStr};

/// Shared first byte of the two-byte opcodes
pub const FE_PREFIX: u8 = 0xFE;

/// Operand encoding following an opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandType {
    /// No operand
    None,
    /// 32-bit signed integer
    Int32,
    /// Unsigned 8-bit argument or local index
    ShortVariable,
    /// Unsigned 16-bit argument or local index
    Variable,
    /// 32-bit branch offset, relative to the start of the next instruction
    BranchTarget,
    /// 32-bit metadata token
    Token,
}

impl OperandType {
    /// Number of bytes the operand occupies
    #[must_use]
    pub fn size(&self) -> usize {
        match self {
            OperandType::None => 0,
            OperandType::ShortVariable => 1,
            OperandType::Variable => 2,
            OperandType::Int32 | OperandType::BranchTarget | OperandType::Token => 4,
        }
    }
}

/// How an instruction affects control flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowType {
    /// Execution continues with the next instruction
    Next,
    /// A method call, stack effect depends on the callee
    Call,
    /// Conditional branch, falls through if not taken
    ConditionalBranch,
    /// Unconditional branch
    Branch,
    /// Leaves a protected region, emptying the evaluation stack
    Leave,
    /// Returns from the method
    Return,
    /// Raises an exception
    Throw,
}

impl FlowType {
    /// Returns `true` if the instruction never falls through to the next one
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlowType::Branch | FlowType::Leave | FlowType::Return | FlowType::Throw
        )
    }
}

/// A CIL instruction the rewriter can encode, named after its mnemonic
#[allow(missing_docs)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, EnumString, IntoStaticStr,
)]
pub enum OpCode {
    #[strum(to_string = "nop")]
    Nop,
    #[strum(to_string = "ldarg.0")]
    Ldarg0,
    #[strum(to_string = "ldarg.1")]
    Ldarg1,
    #[strum(to_string = "ldarg.2")]
    Ldarg2,
    #[strum(to_string = "ldarg.3")]
    Ldarg3,
    #[strum(to_string = "ldloc.0")]
    Ldloc0,
    #[strum(to_string = "ldloc.1")]
    Ldloc1,
    #[strum(to_string = "ldloc.2")]
    Ldloc2,
    #[strum(to_string = "ldloc.3")]
    Ldloc3,
    #[strum(to_string = "stloc.0")]
    Stloc0,
    #[strum(to_string = "stloc.1")]
    Stloc1,
    #[strum(to_string = "stloc.2")]
    Stloc2,
    #[strum(to_string = "stloc.3")]
    Stloc3,
    #[strum(to_string = "ldarg.s")]
    LdargS,
    #[strum(to_string = "ldloc.s")]
    LdlocS,
    #[strum(to_string = "stloc.s")]
    StlocS,
    #[strum(to_string = "ldnull")]
    Ldnull,
    #[strum(to_string = "ldc.i4")]
    LdcI4,
    #[strum(to_string = "dup")]
    Dup,
    #[strum(to_string = "pop")]
    Pop,
    #[strum(to_string = "call")]
    Call,
    #[strum(to_string = "ret")]
    Ret,
    #[strum(to_string = "br")]
    Br,
    #[strum(to_string = "brfalse")]
    Brfalse,
    #[strum(to_string = "brtrue")]
    Brtrue,
    #[strum(to_string = "ldind.ref")]
    LdindRef,
    #[strum(to_string = "callvirt")]
    Callvirt,
    #[strum(to_string = "ldobj")]
    Ldobj,
    #[strum(to_string = "ldstr")]
    Ldstr,
    #[strum(to_string = "newobj")]
    Newobj,
    #[strum(to_string = "castclass")]
    Castclass,
    #[strum(to_string = "throw")]
    Throw,
    #[strum(to_string = "box")]
    Box,
    #[strum(to_string = "newarr")]
    Newarr,
    #[strum(to_string = "stelem.ref")]
    StelemRef,
    #[strum(to_string = "unbox.any")]
    UnboxAny,
    #[strum(to_string = "ldtoken")]
    Ldtoken,
    #[strum(to_string = "leave")]
    Leave,
    #[strum(to_string = "ldarg")]
    Ldarg,
    #[strum(to_string = "ldloc")]
    Ldloc,
    #[strum(to_string = "stloc")]
    Stloc,
    #[strum(to_string = "rethrow")]
    Rethrow,
}

impl OpCode {
    /// The encoding of this opcode; two-byte opcodes are prefixed with [`FE_PREFIX`]
    #[must_use]
    pub fn encoding(&self) -> &'static [u8] {
        match self {
            OpCode::Nop => &[0x00],
            OpCode::Ldarg0 => &[0x02],
            OpCode::Ldarg1 => &[0x03],
            OpCode::Ldarg2 => &[0x04],
            OpCode::Ldarg3 => &[0x05],
            OpCode::Ldloc0 => &[0x06],
            OpCode::Ldloc1 => &[0x07],
            OpCode::Ldloc2 => &[0x08],
            OpCode::Ldloc3 => &[0x09],
            OpCode::Stloc0 => &[0x0A],
            OpCode::Stloc1 => &[0x0B],
            OpCode::Stloc2 => &[0x0C],
            OpCode::Stloc3 => &[0x0D],
            OpCode::LdargS => &[0x0E],
            OpCode::LdlocS => &[0x11],
            OpCode::StlocS => &[0x13],
            OpCode::Ldnull => &[0x14],
            OpCode::LdcI4 => &[0x20],
            OpCode::Dup => &[0x25],
            OpCode::Pop => &[0x26],
            OpCode::Call => &[0x28],
            OpCode::Ret => &[0x2A],
            OpCode::Br => &[0x38],
            OpCode::Brfalse => &[0x39],
            OpCode::Brtrue => &[0x3A],
            OpCode::LdindRef => &[0x50],
            OpCode::Callvirt => &[0x6F],
            OpCode::Ldobj => &[0x71],
            OpCode::Ldstr => &[0x72],
            OpCode::Newobj => &[0x73],
            OpCode::Castclass => &[0x74],
            OpCode::Throw => &[0x7A],
            OpCode::Box => &[0x8C],
            OpCode::Newarr => &[0x8D],
            OpCode::StelemRef => &[0xA2],
            OpCode::UnboxAny => &[0xA5],
            OpCode::Ldtoken => &[0xD0],
            OpCode::Leave => &[0xDD],
            OpCode::Ldarg => &[FE_PREFIX, 0x09],
            OpCode::Ldloc => &[FE_PREFIX, 0x0C],
            OpCode::Stloc => &[FE_PREFIX, 0x0E],
            OpCode::Rethrow => &[FE_PREFIX, 0x1A],
        }
    }

    /// The operand following the opcode
    #[must_use]
    pub fn operand_type(&self) -> OperandType {
        match self {
            OpCode::LdargS | OpCode::LdlocS | OpCode::StlocS => OperandType::ShortVariable,
            OpCode::Ldarg | OpCode::Ldloc | OpCode::Stloc => OperandType::Variable,
            OpCode::LdcI4 => OperandType::Int32,
            OpCode::Br | OpCode::Brfalse | OpCode::Brtrue | OpCode::Leave => {
                OperandType::BranchTarget
            }
            OpCode::Call
            | OpCode::Callvirt
            | OpCode::Newobj
            | OpCode::Ldobj
            | OpCode::Ldstr
            | OpCode::Castclass
            | OpCode::Box
            | OpCode::Newarr
            | OpCode::UnboxAny
            | OpCode::Ldtoken => OperandType::Token,
            _ => OperandType::None,
        }
    }

    /// How this opcode affects control flow
    #[must_use]
    pub fn flow(&self) -> FlowType {
        match self {
            OpCode::Call | OpCode::Callvirt | OpCode::Newobj => FlowType::Call,
            OpCode::Brfalse | OpCode::Brtrue => FlowType::ConditionalBranch,
            OpCode::Br => FlowType::Branch,
            OpCode::Leave => FlowType::Leave,
            OpCode::Ret => FlowType::Return,
            OpCode::Throw | OpCode::Rethrow => FlowType::Throw,
            _ => FlowType::Next,
        }
    }

    /// Number of values popped from and pushed onto the evaluation stack.
    ///
    /// Returns `None` for calls, whose effect depends on the callee signature, and for
    /// `leave`, which empties the stack.
    #[must_use]
    pub fn stack_effect(&self) -> Option<(u8, u8)> {
        match self {
            OpCode::Call | OpCode::Callvirt | OpCode::Newobj | OpCode::Leave => None,
            OpCode::Nop | OpCode::Ret | OpCode::Br | OpCode::Rethrow => Some((0, 0)),
            OpCode::Ldarg0
            | OpCode::Ldarg1
            | OpCode::Ldarg2
            | OpCode::Ldarg3
            | OpCode::Ldloc0
            | OpCode::Ldloc1
            | OpCode::Ldloc2
            | OpCode::Ldloc3
            | OpCode::LdargS
            | OpCode::LdlocS
            | OpCode::Ldarg
            | OpCode::Ldloc
            | OpCode::Ldnull
            | OpCode::LdcI4
            | OpCode::Ldstr
            | OpCode::Ldtoken => Some((0, 1)),
            OpCode::Stloc0
            | OpCode::Stloc1
            | OpCode::Stloc2
            | OpCode::Stloc3
            | OpCode::StlocS
            | OpCode::Stloc
            | OpCode::Pop
            | OpCode::Brfalse
            | OpCode::Brtrue
            | OpCode::Throw => Some((1, 0)),
            OpCode::LdindRef
            | OpCode::Ldobj
            | OpCode::Castclass
            | OpCode::Box
            | OpCode::Newarr
            | OpCode::UnboxAny => Some((1, 1)),
            OpCode::Dup => Some((1, 2)),
            OpCode::StelemRef => Some((3, 0)),
        }
    }
}

/// Stack effect of calling `member`, given as its `ilasm` style signature.
///
/// The member string has the form `[instance] <return type> <owner>::<name>(<parameters>)`.
/// The callee pops one value per parameter, plus the instance for `callvirt` or instance
/// calls, and pushes its return value unless it returns `void`. A `newobj` pops the
/// constructor parameters and always pushes the new object.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] if the member has no parameter list.
pub fn call_stack_effect(opcode: OpCode, member: &str) -> crate::Result<(u8, u8)> {
    let open = member
        .find('(')
        .ok_or_else(|| malformed_error!("Member '{}' has no parameter list", member))?;
    let close = member
        .rfind(')')
        .filter(|close| *close > open)
        .ok_or_else(|| malformed_error!("Member '{}' has no parameter list", member))?;

    let parameters = member[open + 1..close].trim();
    let mut param_count = 0_usize;
    if !parameters.is_empty() {
        param_count = 1;
        let mut nesting = 0_i32;
        for c in parameters.chars() {
            match c {
                '<' | '[' | '(' => nesting += 1,
                '>' | ']' | ')' => nesting -= 1,
                ',' if nesting == 0 => param_count += 1,
                _ => {}
            }
        }
    }

    let head = member[..open].trim_start();
    let is_instance = head.starts_with("instance ");
    let return_type = head.trim_start_matches("instance ").trim_start();
    let returns_void = return_type.starts_with("void ");

    let param_count = u8::try_from(param_count)
        .map_err(|_| malformed_error!("Member '{}' has too many parameters", member))?;

    Ok(match opcode {
        OpCode::Newobj => (param_count, 1),
        _ => (
            param_count + u8::from(is_instance || opcode == OpCode::Callvirt),
            u8::from(!returns_void),
        ),
    })
}
