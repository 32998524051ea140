//! The host side of a rewrite.
//!
//! The rewriter never touches metadata directly. Everything that needs the live metadata
//! store of the host (reading the original method body, resolving names into tokens,
//! interning new signatures and committing the rewritten body) goes through the two traits
//! in this module.

use crate::{metadata::token::Token, Result};

/// Resolves names and blobs into metadata tokens of the module being rewritten.
///
/// Member and type names use `ilasm` syntax, e.g.
/// `"class [mscorlib]System.Type [mscorlib]System.Type::GetTypeFromHandle(valuetype [mscorlib]System.RuntimeTypeHandle)"`
/// or `"[mscorlib]System.Exception"`.
pub trait Tokenizer {
    /// Returns the user string token for `value`, creating the string if needed.
    ///
    /// # Errors
    /// Returns [`crate::Error::Tokenizer`] if the string can not be added.
    fn string_token(&self, value: &str) -> Result<Token>;

    /// Returns the `TypeDef`/`TypeRef` token for the type named `name`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Tokenizer`] if the type can not be resolved.
    fn type_token(&self, name: &str) -> Result<Token>;

    /// Returns the `MethodDef`/`MemberRef` token for the member described by `member`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Tokenizer`] if the member can not be resolved.
    fn member_token(&self, member: &str) -> Result<Token>;

    /// Returns the `TypeSpec` token for the type signature `signature`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Tokenizer`] if the type specification can not be added.
    fn type_spec_token(&self, signature: &[u8]) -> Result<Token>;

    /// Returns the signature blob encoding the type named `name`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Tokenizer`] if the type can not be resolved.
    fn type_signature(&self, name: &str) -> Result<Vec<u8>>;
}

/// One method of the host, the subject of exactly one rewrite.
pub trait Function {
    /// Diagnostic name of the method, used in log records
    fn name(&self) -> String;

    /// Returns the raw bytes of the current method body, starting at its header.
    ///
    /// # Errors
    /// Returns an error if the body can not be read.
    fn method_bytes(&self) -> Result<Vec<u8>>;

    /// Returns the signature blob of the method
    fn signature(&self) -> &[u8];

    /// Returns the signature blob referenced by `token`.
    ///
    /// # Errors
    /// Returns [`crate::Error::TokenNotFound`] if there is no such signature.
    fn signature_from_token(&self, token: Token) -> Result<Vec<u8>>;

    /// Interns `signature` as a stand-alone signature and returns its token.
    ///
    /// # Errors
    /// Returns an error if the signature can not be added.
    fn token_from_signature(&self, signature: &[u8]) -> Result<Token>;

    /// Replaces the body of the method with `bytes`.
    ///
    /// A failed call may leave the method in an unusable state.
    ///
    /// # Errors
    /// Returns an error if the body could not be committed.
    fn write_method(&self, bytes: &[u8]) -> Result<()>;

    /// Returns the tokenizer of the module this method belongs to
    fn tokenizer(&self) -> &dyn Tokenizer;
}
