//! Append-only CIL instruction builder.
//!
//! [`InstructionSet`] accumulates the code of a rewritten method body. Jumps are emitted with
//! 4-byte placeholders and a fixup entry; the offsets are patched once the final layout is
//! known, so labels may be placed before or after the jumps that target them. Protected
//! regions are tracked while they are open and recorded as exception clauses in the owned
//! [`ExceptionSection`] once their handler is closed.
//!
//! The builder tracks the depth of the evaluation stack across everything it emits, both to
//! derive the `max_stack` of the rewritten header and to reject code that leaves the stack
//! inconsistent, e.g. two paths joining at a label with different depths.
//!
//! # Examples
//!
//! ```rust,ignore
//! let mut set = InstructionSet::new(tokenizer, ExceptionSection::empty());
//!
//! set.append(OpCode::Ldarg0)?;
//! let after = set.append_jump(OpCode::Brtrue)?;
//! set.append_string("argument is null")?;
//! set.append_call(OpCode::Newobj, "instance void [mscorlib]System.Exception::.ctor(string)")?;
//! set.append(OpCode::Throw)?;
//! set.append_label(after)?;
//!
//! let code = set.bytes()?;
//! ```

use std::str::FromStr;

use crate::{
    assembly::opcodes::{call_stack_effect, FlowType, OpCode, OperandType},
    function::Tokenizer,
    metadata::{
        method::{ExceptionClause, ExceptionHandlerFlags, ExceptionSection},
        signatures::SignatureParameter,
        token::Token,
    },
    utils::to_u32,
    Error, Result,
};

/// The exception type caught by the handlers this builder emits
pub const CATCH_ALL_TYPE: &str = "[mscorlib]System.Exception";

/// Member used to turn a loaded type handle into a `System.Type`
pub const GET_TYPE_FROM_HANDLE: &str = "class [mscorlib]System.Type [mscorlib]System.Type::GetTypeFromHandle(valuetype [mscorlib]System.RuntimeTypeHandle)";

/// A jump target inside an [`InstructionSet`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(usize);

impl Label {
    /// Index of this label within its instruction set
    #[must_use]
    pub fn index(&self) -> usize {
        self.0
    }
}

/// A jump offset waiting for its label to be placed
#[derive(Debug, Clone)]
struct LabelFixup {
    /// The target label
    label: Label,
    /// Position of the 4-byte offset placeholder
    fixup_position: usize,
    /// Position of the instruction following the jump, offsets are relative to it
    next_instruction: usize,
}

/// A try block that has not been closed by its handler yet
#[derive(Debug, Clone)]
struct ProtectedRegion {
    try_offset: u32,
    try_end: Option<u32>,
    handler_offset: Option<u32>,
}

/// Builder for the code of one rewritten method body.
///
/// Not [`Sync`]; every rewrite owns its own instance.
pub struct InstructionSet<'a> {
    tokenizer: &'a dyn Tokenizer,
    exceptions: ExceptionSection,
    bytecode: Vec<u8>,
    /// Placed positions, indexed by label
    labels: Vec<Option<u32>>,
    /// Expected stack depth at each label, once a path to it has been seen
    label_stack_depths: Vec<Option<i32>>,
    fixups: Vec<LabelFixup>,
    regions: Vec<ProtectedRegion>,
    user_code_offset: Option<u32>,
    current_stack_depth: i32,
    max_stack_depth: u16,
    /// Set after instructions that never fall through; the tracked depth is meaningless
    /// until the next label
    unreachable: bool,
}

impl<'a> InstructionSet<'a> {
    /// Create an empty instruction set.
    ///
    /// # Arguments
    /// * `tokenizer` - Resolves the names used as instruction operands
    /// * `exceptions` - The exception clauses of the original body
    #[must_use]
    pub fn new(tokenizer: &'a dyn Tokenizer, exceptions: ExceptionSection) -> Self {
        InstructionSet {
            tokenizer,
            exceptions,
            bytecode: Vec::new(),
            labels: Vec::new(),
            label_stack_depths: Vec::new(),
            fixups: Vec::new(),
            regions: Vec::new(),
            user_code_offset: None,
            current_stack_depth: 0,
            max_stack_depth: 0,
            unreachable: false,
        }
    }

    /// The tokenizer operands are resolved with
    #[must_use]
    pub fn tokenizer(&self) -> &'a dyn Tokenizer {
        self.tokenizer
    }

    /// Append an instruction without operand.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if `opcode` requires an operand, or
    /// [`crate::Error::StackImbalance`] if it pops more values than there are on the stack.
    pub fn append(&mut self, opcode: OpCode) -> Result<()> {
        let (pops, pushes) = Self::fixed_stack_effect(opcode, OperandType::None)?;
        self.emit(opcode, pops, pushes, &[])
    }

    /// Append an instruction without operand, given by its mnemonic.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidMnemonic`] if the mnemonic is unknown, otherwise see
    /// [`InstructionSet::append`].
    pub fn append_mnemonic(&mut self, mnemonic: &str) -> Result<()> {
        let opcode = OpCode::from_str(mnemonic)
            .map_err(|_| Error::InvalidMnemonic(mnemonic.to_string()))?;
        self.append(opcode)
    }

    /// Append `ldc.i4 value`.
    ///
    /// # Errors
    /// Returns [`crate::Error::StackImbalance`] if the stack depth overflows.
    pub fn append_int(&mut self, value: i32) -> Result<()> {
        let (pops, pushes) = Self::fixed_stack_effect(OpCode::LdcI4, OperandType::Int32)?;
        self.emit(OpCode::LdcI4, pops, pushes, &value.to_le_bytes())
    }

    /// Append an instruction taking a token operand with a fixed stack effect, e.g. `box`.
    ///
    /// Calls have to go through [`InstructionSet::append_call`].
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if `opcode` takes no token or is a call.
    pub fn append_token_op(&mut self, opcode: OpCode, token: Token) -> Result<()> {
        let (pops, pushes) = Self::fixed_stack_effect(opcode, OperandType::Token)?;
        self.emit(opcode, pops, pushes, &token.value().to_le_bytes())
    }

    /// Append an instruction whose operand is the type named `type_name`, e.g. `newarr`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Tokenizer`] if the type can not be resolved, otherwise see
    /// [`InstructionSet::append_token_op`].
    pub fn append_type_op(&mut self, opcode: OpCode, type_name: &str) -> Result<()> {
        let token = self.tokenizer.type_token(type_name)?;
        self.append_token_op(opcode, token)
    }

    /// Append `ldstr` loading `value`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Tokenizer`] if the string can not be interned.
    pub fn append_string(&mut self, value: &str) -> Result<()> {
        let token = self.tokenizer.string_token(value)?;
        self.append_token_op(OpCode::Ldstr, token)
    }

    /// Append `call`, `callvirt` or `newobj` of `member`.
    ///
    /// The stack effect is derived from the member signature, see
    /// [`crate::assembly::call_stack_effect`].
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if `opcode` is no call or the member has no
    /// parameter list, [`crate::Error::Tokenizer`] if it can not be resolved.
    pub fn append_call(&mut self, opcode: OpCode, member: &str) -> Result<()> {
        if opcode.flow() != FlowType::Call {
            return Err(malformed_error!("'{}' is not a call instruction", opcode));
        }

        let (pops, pushes) = call_stack_effect(opcode, member)?;
        let token = self.tokenizer.member_token(member)?;
        self.emit(opcode, pops, pushes, &token.value().to_le_bytes())
    }

    /// Create a label which is not placed yet.
    pub fn create_label(&mut self) -> Label {
        self.labels.push(None);
        self.label_stack_depths.push(None);
        Label(self.labels.len() - 1)
    }

    /// Append a jump to a new label and return the label, to be placed later with
    /// [`InstructionSet::append_label`].
    ///
    /// # Errors
    /// See [`InstructionSet::append_jump_to`].
    pub fn append_jump(&mut self, opcode: OpCode) -> Result<Label> {
        let label = self.create_label();
        self.append_jump_to(opcode, label)?;
        Ok(label)
    }

    /// Append a jump to `label`, which may be placed before or after the jump.
    ///
    /// Jumps always use the long form with a 4-byte offset.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if `opcode` is no jump,
    /// [`crate::Error::UnknownLabel`] if the label does not belong to this set, or
    /// [`crate::Error::StackImbalance`] if the label was reached with a different depth.
    pub fn append_jump_to(&mut self, opcode: OpCode, label: Label) -> Result<()> {
        if opcode.operand_type() != OperandType::BranchTarget {
            return Err(malformed_error!("'{}' is not a jump instruction", opcode));
        }
        if label.0 >= self.labels.len() {
            return Err(Error::UnknownLabel(label.0));
        }

        if opcode.flow() == FlowType::Leave {
            // leave empties the evaluation stack
            self.current_stack_depth = 0;
        } else {
            let (pops, pushes) = Self::fixed_stack_effect(opcode, OperandType::BranchTarget)?;
            self.update_stack_depth(opcode, pops, pushes)?;
        }
        self.record_label_stack_depth(label)?;

        self.bytecode.extend_from_slice(opcode.encoding());
        let fixup_position = self.bytecode.len();
        self.bytecode.extend_from_slice(&[0; 4]);
        self.fixups.push(LabelFixup {
            label,
            fixup_position,
            next_instruction: self.bytecode.len(),
        });

        if opcode.flow().is_terminal() {
            self.unreachable = true;
        }
        Ok(())
    }

    /// Place `label` at the current position.
    ///
    /// # Errors
    /// Returns [`crate::Error::UnknownLabel`] if the label does not belong to this set,
    /// [`crate::Error::Malformed`] if it was placed before, or
    /// [`crate::Error::StackImbalance`] if falling through reaches it with a different depth
    /// than the jumps to it.
    pub fn append_label(&mut self, label: Label) -> Result<()> {
        let Some(placed) = self.labels.get(label.0) else {
            return Err(Error::UnknownLabel(label.0));
        };
        if placed.is_some() {
            return Err(malformed_error!("Label {} is placed twice", label.0));
        }

        match self.label_stack_depths[label.0] {
            Some(expected) if self.unreachable => self.current_stack_depth = expected,
            Some(expected) => {
                if self.current_stack_depth != expected {
                    return Err(Error::StackImbalance(format!(
                        "label {} is reached with depth {} and {}",
                        label.0, expected, self.current_stack_depth
                    )));
                }
            }
            None if self.unreachable => self.current_stack_depth = 0,
            None => self.label_stack_depths[label.0] = Some(self.current_stack_depth),
        }

        self.unreachable = false;
        self.labels[label.0] = Some(self.position()?);
        Ok(())
    }

    /// Open a protected region at the current position.
    ///
    /// # Errors
    /// Returns [`crate::Error::StackImbalance`] if the evaluation stack is not empty.
    pub fn append_try_start(&mut self) -> Result<()> {
        if self.current_stack_depth != 0 && !self.unreachable {
            return Err(Error::StackImbalance(format!(
                "try block entered with depth {}",
                self.current_stack_depth
            )));
        }

        let try_offset = self.position()?;
        self.regions.push(ProtectedRegion {
            try_offset,
            try_end: None,
            handler_offset: None,
        });
        Ok(())
    }

    /// Close the try block of the innermost protected region.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if there is no open try block or it falls through.
    pub fn append_try_end(&mut self) -> Result<()> {
        let position = self.position()?;
        let unreachable = self.unreachable;

        match self.regions.last_mut() {
            Some(region) if region.try_end.is_none() => {
                if !unreachable {
                    return Err(malformed_error!(
                        "Try block at {} must be left explicitly",
                        region.try_offset
                    ));
                }
                region.try_end = Some(position);
                Ok(())
            }
            _ => Err(malformed_error!("No open try block at {}", position)),
        }
    }

    /// Start the handler catching [`CATCH_ALL_TYPE`] of the innermost protected region.
    ///
    /// The exception object is on the stack when the handler is entered.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if there is no closed try block without handler.
    pub fn append_catch_start(&mut self) -> Result<()> {
        let position = self.position()?;

        match self.regions.last_mut() {
            Some(region) if region.try_end.is_some() && region.handler_offset.is_none() => {
                region.handler_offset = Some(position);
            }
            _ => return Err(malformed_error!("No closed try block at {}", position)),
        }

        self.unreachable = false;
        self.current_stack_depth = 0;
        self.update_stack_depth(OpCode::Nop, 0, 1)
    }

    /// Close the handler of the innermost protected region and record its exception clause.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if there is no open handler or it falls through,
    /// [`crate::Error::Tokenizer`] if the exception type can not be resolved.
    pub fn append_catch_end(&mut self) -> Result<()> {
        let position = self.position()?;
        let (try_offset, try_end, handler_offset) = match self.regions.last() {
            Some(ProtectedRegion {
                try_offset,
                try_end: Some(try_end),
                handler_offset: Some(handler_offset),
            }) => (*try_offset, *try_end, *handler_offset),
            _ => return Err(malformed_error!("No open catch block at {}", position)),
        };

        if !self.unreachable {
            return Err(malformed_error!(
                "Catch block at {} must be left explicitly",
                handler_offset
            ));
        }

        let class_token = self.tokenizer.type_token(CATCH_ALL_TYPE)?;
        self.regions.pop();
        self.exceptions.add_clause(ExceptionClause {
            flags: ExceptionHandlerFlags::EXCEPTION,
            try_offset,
            try_length: try_end - try_offset,
            handler_offset,
            handler_length: position - handler_offset,
            class_token_or_filter: class_token.value(),
        });
        Ok(())
    }

    /// Append the shortest form of loading local `index`.
    ///
    /// # Errors
    /// Returns [`crate::Error::StackImbalance`] if the stack depth overflows.
    pub fn append_load_local(&mut self, index: u16) -> Result<()> {
        self.append_variable(
            index,
            [OpCode::Ldloc0, OpCode::Ldloc1, OpCode::Ldloc2, OpCode::Ldloc3],
            OpCode::LdlocS,
            OpCode::Ldloc,
        )
    }

    /// Append the shortest form of storing into local `index`.
    ///
    /// # Errors
    /// Returns [`crate::Error::StackImbalance`] if the stack is empty.
    pub fn append_store_local(&mut self, index: u16) -> Result<()> {
        self.append_variable(
            index,
            [OpCode::Stloc0, OpCode::Stloc1, OpCode::Stloc2, OpCode::Stloc3],
            OpCode::StlocS,
            OpCode::Stloc,
        )
    }

    /// Append the shortest form of loading argument `index`.
    ///
    /// # Errors
    /// Returns [`crate::Error::StackImbalance`] if the stack depth overflows.
    pub fn append_load_argument(&mut self, index: u16) -> Result<()> {
        self.append_variable(
            index,
            [OpCode::Ldarg0, OpCode::Ldarg1, OpCode::Ldarg2, OpCode::Ldarg3],
            OpCode::LdargS,
            OpCode::Ldarg,
        )
    }

    /// Load argument `index` as an object reference.
    ///
    /// Value types are boxed, by-reference arguments are dereferenced first.
    ///
    /// # Errors
    /// Returns [`crate::Error::Tokenizer`] if the type specification of a value type can not
    /// be created.
    pub fn append_load_argument_and_box(
        &mut self,
        index: u16,
        param: &SignatureParameter,
    ) -> Result<()> {
        self.append_load_argument(index)?;

        let requires_boxing = param.base.requires_boxing();
        if param.by_ref && !requires_boxing {
            return self.append(OpCode::LdindRef);
        }

        if requires_boxing {
            let token = self.tokenizer.type_spec_token(&param.type_blob)?;
            if param.by_ref {
                self.append_token_op(OpCode::Ldobj, token)?;
            }
            self.append_token_op(OpCode::Box, token)?;
        }
        Ok(())
    }

    /// Load the `System.Type` of the parameter `param`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Tokenizer`] if the type can not be resolved.
    pub fn append_type_of_argument(&mut self, param: &SignatureParameter) -> Result<()> {
        let token = self.tokenizer.type_spec_token(&param.type_blob)?;
        self.append_token_op(OpCode::Ldtoken, token)?;
        self.append_call(OpCode::Call, GET_TYPE_FROM_HANDLE)
    }

    /// Splice the original code of the method in at the current position.
    ///
    /// The position becomes the user-code offset, by which the original exception clauses are
    /// shifted. The original code ends the reachable flow; code following it must be reached
    /// through a label.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if user code was already appended, or
    /// [`crate::Error::StackImbalance`] if the injected code leaves values on the stack.
    pub fn append_user_code(&mut self, code: &[u8]) -> Result<()> {
        if let Some(offset) = self.user_code_offset {
            return Err(malformed_error!(
                "User code is already placed at offset {}",
                offset
            ));
        }
        if self.current_stack_depth != 0 && !self.unreachable {
            return Err(Error::StackImbalance(format!(
                "user code entered with depth {}",
                self.current_stack_depth
            )));
        }

        self.user_code_offset = Some(self.position()?);
        self.bytecode.extend_from_slice(code);
        self.current_stack_depth = 0;
        self.unreachable = true;
        Ok(())
    }

    /// Produce the final code, with all jump offsets patched.
    ///
    /// # Errors
    /// Returns [`crate::Error::UnknownLabel`] if a jump targets a label that was never
    /// placed, or [`crate::Error::Malformed`] if a protected region is still open.
    pub fn bytes(&self) -> Result<Vec<u8>> {
        if let Some(region) = self.regions.last() {
            return Err(malformed_error!(
                "Protected region at {} is not closed",
                region.try_offset
            ));
        }

        let mut bytecode = self.bytecode.clone();
        for fixup in &self.fixups {
            let target = self
                .labels
                .get(fixup.label.0)
                .copied()
                .flatten()
                .ok_or(Error::UnknownLabel(fixup.label.0))?;

            let offset = i64::from(target) - i64::from(to_u32(fixup.next_instruction)?);
            let offset = i32::try_from(offset)
                .map_err(|_| malformed_error!("Jump offset {} out of range", offset))?;
            bytecode[fixup.fixup_position..fixup.fixup_position + 4]
                .copy_from_slice(&offset.to_le_bytes());
        }

        Ok(bytecode)
    }

    /// Offset at which the original code was spliced in, 0 if it was not
    #[must_use]
    pub fn user_code_offset(&self) -> u32 {
        self.user_code_offset.unwrap_or(0)
    }

    /// Returns `true` once the original code has been appended
    #[must_use]
    pub fn has_user_code(&self) -> bool {
        self.user_code_offset.is_some()
    }

    /// Number of bytes emitted so far
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytecode.len()
    }

    /// Returns `true` if nothing has been emitted yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytecode.is_empty()
    }

    /// The current depth of the evaluation stack
    #[must_use]
    pub fn stack_depth(&self) -> u16 {
        u16::try_from(self.current_stack_depth).unwrap_or(u16::MAX)
    }

    /// Returns `true` if the next instruction can be reached by falling through
    #[must_use]
    pub fn is_reachable(&self) -> bool {
        !self.unreachable
    }

    /// The deepest evaluation stack reached by the emitted instructions
    #[must_use]
    pub fn max_stack(&self) -> u16 {
        self.max_stack_depth
    }

    /// The original and added exception clauses
    #[must_use]
    pub fn exceptions(&self) -> &ExceptionSection {
        &self.exceptions
    }

    /// Returns `true` if the rewritten body will carry any exception clause
    #[must_use]
    pub fn has_exception_clauses(&self) -> bool {
        !self.exceptions.is_empty()
    }

    /// Encode the exception clauses for the current layout.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the original body has exception clauses but its
    /// code was never appended, or the section can not be encoded.
    pub fn extra_section_bytes(&self) -> Result<Vec<u8>> {
        if !self.has_user_code() && !self.exceptions.original_clauses().is_empty() {
            return Err(malformed_error!(
                "Original exception clauses without the original code"
            ));
        }

        self.exceptions
            .extra_section_bytes(self.user_code_offset())
    }

    fn position(&self) -> Result<u32> {
        to_u32(self.bytecode.len())
    }

    fn fixed_stack_effect(opcode: OpCode, operand: OperandType) -> Result<(u8, u8)> {
        if opcode.operand_type() != operand {
            return Err(malformed_error!(
                "'{}' takes a {:?} operand, not {:?}",
                opcode,
                opcode.operand_type(),
                operand
            ));
        }

        opcode
            .stack_effect()
            .ok_or_else(|| malformed_error!("'{}' has no fixed stack effect", opcode))
    }

    fn append_variable(
        &mut self,
        index: u16,
        shorthand: [OpCode; 4],
        short_form: OpCode,
        long_form: OpCode,
    ) -> Result<()> {
        if let Some(opcode) = shorthand.get(usize::from(index)) {
            return self.append(*opcode);
        }

        match u8::try_from(index) {
            Ok(short) => {
                let (pops, pushes) =
                    Self::fixed_stack_effect(short_form, OperandType::ShortVariable)?;
                self.emit(short_form, pops, pushes, &[short])
            }
            Err(_) => {
                let (pops, pushes) = Self::fixed_stack_effect(long_form, OperandType::Variable)?;
                self.emit(long_form, pops, pushes, &index.to_le_bytes())
            }
        }
    }

    /// Emit one instruction, the stack is checked before anything is written
    fn emit(&mut self, opcode: OpCode, pops: u8, pushes: u8, operand: &[u8]) -> Result<()> {
        self.update_stack_depth(opcode, pops, pushes)?;
        self.bytecode.extend_from_slice(opcode.encoding());
        self.bytecode.extend_from_slice(operand);
        if opcode.flow().is_terminal() {
            self.unreachable = true;
        }
        Ok(())
    }

    fn update_stack_depth(&mut self, opcode: OpCode, pops: u8, pushes: u8) -> Result<()> {
        let remaining = self.current_stack_depth - i32::from(pops);

        // In unreachable code the depth is meaningless, keep tracking until the next label
        if remaining < 0 && !self.unreachable {
            return Err(Error::StackImbalance(format!(
                "'{}' pops {} values from a stack of depth {}",
                opcode, pops, self.current_stack_depth
            )));
        }

        self.current_stack_depth = remaining.max(0) + i32::from(pushes);

        let current_depth_u16 = u16::try_from(self.current_stack_depth)
            .map_err(|_| Error::StackImbalance("stack depth exceeds u16 range".to_string()))?;
        self.max_stack_depth = self.max_stack_depth.max(current_depth_u16);
        Ok(())
    }

    fn record_label_stack_depth(&mut self, label: Label) -> Result<()> {
        if self.unreachable {
            return Ok(());
        }

        match self.label_stack_depths[label.0] {
            Some(expected) if expected != self.current_stack_depth => {
                Err(Error::StackImbalance(format!(
                    "jump to label {} with depth {}, expected {}",
                    label.0, self.current_stack_depth, expected
                )))
            }
            Some(_) => Ok(()),
            None => {
                self.label_stack_depths[label.0] = Some(self.current_stack_depth);
                Ok(())
            }
        }
    }
}
