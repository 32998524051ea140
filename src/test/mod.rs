//! Test doubles for the host side of a rewrite and method body factories.

use std::cell::RefCell;

use strum::IntoEnumIterator;

use crate::{
    assembly::{OpCode, OperandType, FE_PREFIX},
    function::{Function, Tokenizer},
    metadata::token::Token,
    utils::compress_uint,
    Error, Result,
};

/// Table of interned values, handing out tokens of one metadata table
struct Interner<T> {
    table: u32,
    entries: RefCell<Vec<T>>,
}

impl<T: PartialEq + Clone> Interner<T> {
    fn new(table: u32) -> Self {
        Interner {
            table,
            entries: RefCell::new(Vec::new()),
        }
    }

    fn intern(&self, value: T) -> Token {
        let mut entries = self.entries.borrow_mut();
        let index = match entries.iter().position(|entry| *entry == value) {
            Some(index) => index,
            None => {
                entries.push(value);
                entries.len() - 1
            }
        };
        Token::new(self.table | (index as u32 + 1))
    }

    fn lookup(&self, token: Token) -> Option<T> {
        if token.value() & 0xFF00_0000 != self.table || token.row() == 0 {
            return None;
        }
        self.entries
            .borrow()
            .get(token.row() as usize - 1)
            .cloned()
    }

    fn len(&self) -> usize {
        self.entries.borrow().len()
    }
}

/// Tokenizer handing out sequential tokens per table, interning repeated names
pub struct MockTokenizer {
    strings: Interner<String>,
    types: Interner<String>,
    members: Interner<String>,
    type_specs: Interner<Vec<u8>>,
    unresolvable: Option<String>,
}

impl MockTokenizer {
    pub fn new() -> Self {
        MockTokenizer {
            strings: Interner::new(0x7000_0000),
            types: Interner::new(0x0100_0000),
            members: Interner::new(0x0A00_0000),
            type_specs: Interner::new(0x1B00_0000),
            unresolvable: None,
        }
    }

    /// A tokenizer which fails to resolve any name containing `name`
    pub fn failing_on(name: &str) -> Self {
        MockTokenizer {
            unresolvable: Some(name.to_string()),
            ..Self::new()
        }
    }

    fn check(&self, name: &str) -> Result<()> {
        match &self.unresolvable {
            Some(unresolvable) if name.contains(unresolvable.as_str()) => {
                Err(Error::Tokenizer(name.to_string()))
            }
            _ => Ok(()),
        }
    }

    pub fn string_value(&self, token: Token) -> Option<String> {
        self.strings.lookup(token)
    }

    pub fn type_name(&self, token: Token) -> Option<String> {
        self.types.lookup(token)
    }

    pub fn member_name(&self, token: Token) -> Option<String> {
        self.members.lookup(token)
    }

    pub fn type_spec(&self, token: Token) -> Option<Vec<u8>> {
        self.type_specs.lookup(token)
    }

    pub fn type_spec_count(&self) -> usize {
        self.type_specs.len()
    }
}

impl Tokenizer for MockTokenizer {
    fn string_token(&self, value: &str) -> Result<Token> {
        self.check(value)?;
        Ok(self.strings.intern(value.to_string()))
    }

    fn type_token(&self, name: &str) -> Result<Token> {
        self.check(name)?;
        Ok(self.types.intern(name.to_string()))
    }

    fn member_token(&self, member: &str) -> Result<Token> {
        self.check(member)?;
        Ok(self.members.intern(member.to_string()))
    }

    fn type_spec_token(&self, signature: &[u8]) -> Result<Token> {
        Ok(self.type_specs.intern(signature.to_vec()))
    }

    fn type_signature(&self, name: &str) -> Result<Vec<u8>> {
        match name {
            "bool" => Ok(vec![0x02]),
            "int32" => Ok(vec![0x08]),
            "string" => Ok(vec![0x0E]),
            "object" => Ok(vec![0x1C]),
            _ => {
                let token = self.type_token(name)?;
                let mut blob = vec![0x12];
                blob.extend(compress_uint((token.row() << 2) | 1));
                Ok(blob)
            }
        }
    }
}

/// A method of a fake host, storing stand-alone signatures and the committed body
pub struct MockFunction {
    name: String,
    body: Vec<u8>,
    signature: Vec<u8>,
    tokenizer: MockTokenizer,
    signatures: RefCell<Vec<Vec<u8>>>,
    written: RefCell<Option<Vec<u8>>>,
    fail_write: bool,
}

impl MockFunction {
    pub fn new(body: Vec<u8>, signature: Vec<u8>) -> Self {
        MockFunction {
            name: "Sample.Class::Method".to_string(),
            body,
            signature,
            tokenizer: MockTokenizer::new(),
            signatures: RefCell::new(Vec::new()),
            written: RefCell::new(None),
            fail_write: false,
        }
    }

    pub fn with_tokenizer(mut self, tokenizer: MockTokenizer) -> Self {
        self.tokenizer = tokenizer;
        self
    }

    pub fn failing_write(mut self) -> Self {
        self.fail_write = true;
        self
    }

    pub fn written(&self) -> Option<Vec<u8>> {
        self.written.borrow().clone()
    }

    pub fn stored_signature(&self, token: Token) -> Option<Vec<u8>> {
        self.signature_from_token(token).ok()
    }

    pub fn mock_tokenizer(&self) -> &MockTokenizer {
        &self.tokenizer
    }
}

impl Function for MockFunction {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn method_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.body.clone())
    }

    fn signature(&self) -> &[u8] {
        &self.signature
    }

    fn signature_from_token(&self, token: Token) -> Result<Vec<u8>> {
        if token.table() != 0x11 || token.row() == 0 {
            return Err(Error::TokenNotFound(token));
        }
        self.signatures
            .borrow()
            .get(token.row() as usize - 1)
            .cloned()
            .ok_or(Error::TokenNotFound(token))
    }

    fn token_from_signature(&self, signature: &[u8]) -> Result<Token> {
        let mut signatures = self.signatures.borrow_mut();
        signatures.push(signature.to_vec());
        Ok(Token::new(0x1100_0000 | signatures.len() as u32))
    }

    fn write_method(&self, bytes: &[u8]) -> Result<()> {
        if self.fail_write {
            return Err(malformed_error!("host rejected the method body"));
        }
        *self.written.borrow_mut() = Some(bytes.to_vec());
        Ok(())
    }

    fn tokenizer(&self) -> &dyn Tokenizer {
        &self.tokenizer
    }
}

/// Build a fat method body; extra sections are appended after padding the code
pub fn fat_body(
    flags: u16,
    max_stack: u16,
    code: &[u8],
    local_var_sig_token: u32,
    sections: &[u8],
) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&(0x3000 | flags).to_le_bytes());
    body.extend_from_slice(&max_stack.to_le_bytes());
    body.extend_from_slice(&(code.len() as u32).to_le_bytes());
    body.extend_from_slice(&local_var_sig_token.to_le_bytes());
    body.extend_from_slice(code);

    if !sections.is_empty() {
        while body.len() % 4 != 0 {
            body.push(0);
        }
        body.extend_from_slice(sections);
    }
    body
}

/// Build a tiny method body
pub fn tiny_body(code: &[u8]) -> Vec<u8> {
    let mut body = vec![((code.len() as u8) << 2) | 0x2];
    body.extend_from_slice(code);
    body
}

/// Decode `bytes` into instructions and their operands
pub fn disassemble(bytes: &[u8]) -> Vec<(OpCode, Option<u32>)> {
    let mut instructions = Vec::new();
    let mut position = 0;

    while position < bytes.len() {
        let width = if bytes[position] == FE_PREFIX { 2 } else { 1 };
        let encoding = &bytes[position..position + width];
        let opcode = OpCode::iter()
            .find(|opcode| opcode.encoding() == encoding)
            .unwrap_or_else(|| panic!("unknown opcode {encoding:02x?} at {position}"));
        position += width;

        let size = opcode.operand_type().size();
        let operand = &bytes[position..position + size];
        position += size;

        let value = match opcode.operand_type() {
            OperandType::None => None,
            OperandType::ShortVariable => Some(u32::from(operand[0])),
            OperandType::Variable => Some(u32::from(u16::from_le_bytes([operand[0], operand[1]]))),
            _ => Some(u32::from_le_bytes([
                operand[0], operand[1], operand[2], operand[3],
            ])),
        };
        instructions.push((opcode, value));
    }

    instructions
}
