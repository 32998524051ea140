//! Metadata token handling.
//!
//! A token is an opaque 32-bit handle the hosting metadata store resolves to a concrete
//! type, method, string or signature. The high byte names the table (or heap), the low
//! 24 bits the row. Tokens appear as instruction operands (`call`, `ldstr`, `newarr`, ...),
//! as the local signature reference in the fat method header, and as the class reference of
//! a typed exception clause.
//!
//! # Examples
//!
//! ```rust
//! use ilweave::Token;
//!
//! let token = Token::new(0x1100_0059);
//! assert_eq!(token.table(), 0x11); // StandAloneSig
//! assert_eq!(token.row(), 0x59);
//! assert!(!token.is_null());
//! ```

use std::fmt;

/// A metadata token referencing an entry of a metadata table or heap.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Token(pub u32);

impl Token {
    /// The null token, used in method headers without local variables.
    pub const NULL: Token = Token(0);

    /// Create a new token from its raw value
    #[must_use]
    pub fn new(value: u32) -> Self {
        Token(value)
    }

    /// Returns the raw value of this token
    #[must_use]
    pub fn value(&self) -> u32 {
        self.0
    }

    /// Returns the table (or heap) identifier stored in the high byte
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn table(&self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// Returns the row index stored in the low 24 bits
    #[must_use]
    pub fn row(&self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    /// Returns true if this is the null token
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl From<u32> for Token {
    fn from(value: u32) -> Self {
        Token(value)
    }
}

impl From<Token> for u32 {
    fn from(token: Token) -> Self {
        token.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Token(0x{:08x}, table: 0x{:02x}, row: {})",
            self.0,
            self.table(),
            self.row()
        )
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}
