//! A minimal in-memory host for rewriting tests.

#![allow(dead_code)]

use std::cell::RefCell;

use ilweave::prelude::*;

/// Install a test logger once per test binary
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Tokens of one module, handed out in order of first use
#[derive(Default)]
pub struct Module {
    names: RefCell<Vec<(u8, String)>>,
    type_specs: RefCell<Vec<Vec<u8>>>,
}

impl Module {
    fn intern(&self, table: u8, name: &str) -> Token {
        let mut names = self.names.borrow_mut();
        let index = names
            .iter()
            .position(|(t, n)| *t == table && n == name)
            .unwrap_or_else(|| {
                names.push((table, name.to_string()));
                names.len() - 1
            });
        Token::new((u32::from(table) << 24) | (index as u32 + 1))
    }

    /// Name behind `token`, if it was handed out by this module
    pub fn resolve(&self, token: Token) -> Option<String> {
        let names = self.names.borrow();
        let (table, name) = names.get(token.row().checked_sub(1)? as usize)?;
        (*table == token.table()).then(|| name.clone())
    }
}

impl Tokenizer for Module {
    fn string_token(&self, value: &str) -> Result<Token> {
        Ok(self.intern(0x70, value))
    }

    fn type_token(&self, name: &str) -> Result<Token> {
        Ok(self.intern(0x01, name))
    }

    fn member_token(&self, member: &str) -> Result<Token> {
        Ok(self.intern(0x0A, member))
    }

    fn type_spec_token(&self, signature: &[u8]) -> Result<Token> {
        let mut specs = self.type_specs.borrow_mut();
        specs.push(signature.to_vec());
        Ok(Token::new(0x1B00_0000 | specs.len() as u32))
    }

    fn type_signature(&self, name: &str) -> Result<Vec<u8>> {
        match name {
            "int32" => Ok(vec![0x08]),
            "string" => Ok(vec![0x0E]),
            "object" => Ok(vec![0x1C]),
            _ => Err(Error::Tokenizer(name.to_string())),
        }
    }
}

/// One method of the in-memory host
pub struct Method {
    pub name: String,
    pub body: Vec<u8>,
    pub signature: Vec<u8>,
    pub module: Module,
    pub stand_alone_sigs: RefCell<Vec<Vec<u8>>>,
    pub committed: RefCell<Option<Vec<u8>>>,
    pub reject_writes: bool,
}

impl Method {
    pub fn new(name: &str, body: Vec<u8>, signature: &[u8]) -> Self {
        Method {
            name: name.to_string(),
            body,
            signature: signature.to_vec(),
            module: Module::default(),
            stand_alone_sigs: RefCell::new(Vec::new()),
            committed: RefCell::new(None),
            reject_writes: false,
        }
    }

    pub fn committed(&self) -> Vec<u8> {
        self.committed
            .borrow()
            .clone()
            .expect("no method body was committed")
    }
}

impl Function for Method {
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
        token
            .row()
            .checked_sub(1)
            .and_then(|index| self.stand_alone_sigs.borrow().get(index as usize).cloned())
            .ok_or(Error::TokenNotFound(token))
    }

    fn token_from_signature(&self, signature: &[u8]) -> Result<Token> {
        let mut sigs = self.stand_alone_sigs.borrow_mut();
        sigs.push(signature.to_vec());
        Ok(Token::new(0x1100_0000 | sigs.len() as u32))
    }

    fn write_method(&self, bytes: &[u8]) -> Result<()> {
        if self.reject_writes {
            return Err(Error::Tokenizer("method body is locked".to_string()));
        }
        *self.committed.borrow_mut() = Some(bytes.to_vec());
        Ok(())
    }

    fn tokenizer(&self) -> &dyn Tokenizer {
        &self.module
    }
}

/// A fat method body without extra sections
pub fn fat_body(max_stack: u16, code: &[u8], locals: u32) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&0x3013_u16.to_le_bytes());
    body.extend_from_slice(&max_stack.to_le_bytes());
    body.extend_from_slice(&(code.len() as u32).to_le_bytes());
    body.extend_from_slice(&locals.to_le_bytes());
    body.extend_from_slice(code);
    body
}
