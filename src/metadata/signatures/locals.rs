//! Growable local variable signatures (II.23.2.6).
//!
//! A local variable signature is a blob consisting of the `LOCAL_SIG` tag, a compressed
//! local count and one type per local. Rewrites append their own locals behind the existing
//! ones; the count in front of the types is re-encoded after each append and may change its
//! width when crossing the 1/2 byte (128) or 2/4 byte (16384) boundaries.

use crate::{
    file::parser::Parser,
    utils::compress_uint,
    Error::{self, OutOfBounds},
    FatalReason, Result,
};

/// Leading tag byte of every local variable signature
pub const LOCAL_SIG_TAG: u8 = 0x07;

/// The local count a signature must stay below
pub const LOCAL_COUNT_LIMIT: u32 = 0xfffe;

/// A local variable signature which can be extended one local at a time.
///
/// # Examples
///
/// ```rust
/// use ilweave::metadata::signatures::LocalsSignature;
///
/// let mut locals = LocalsSignature::new();
/// assert_eq!(locals.as_bytes(), &[0x07, 0x00]);
///
/// let index = locals.append(&[0x08])?; // int32
/// assert_eq!(index, 0);
/// assert_eq!(locals.as_bytes(), &[0x07, 0x01, 0x08]);
/// # Ok::<(), ilweave::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalsSignature {
    data: Vec<u8>,
    modified: bool,
}

impl LocalsSignature {
    /// Create the signature of a method without locals
    #[must_use]
    pub fn new() -> Self {
        LocalsSignature {
            data: vec![LOCAL_SIG_TAG, 0x00],
            modified: false,
        }
    }

    /// Take an existing signature blob as the base to extend.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the blob does not start with the local signature
    /// tag or carries no readable count.
    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        let mut parser = Parser::new(blob);
        let tag = parser.read_le::<u8>()?;
        if tag != LOCAL_SIG_TAG {
            return Err(malformed_error!(
                "Local variable signature has invalid tag - 0x{:02x}",
                tag
            ));
        }
        parser.read_compressed_uint()?;

        Ok(LocalsSignature {
            data: blob.to_vec(),
            modified: false,
        })
    }

    /// Decoded local count and the width of its encoding
    fn read_count(&self) -> Result<(u32, usize)> {
        let mut parser = Parser::new(&self.data);
        parser.advance()?;
        let count = parser.read_compressed_uint()?;
        Ok((count, parser.pos() - 1))
    }

    /// Returns the number of locals this signature declares.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the count can not be decoded.
    pub fn count(&self) -> Result<u32> {
        Ok(self.read_count()?.0)
    }

    /// Append a local of the type encoded by `type_bytes` and return its index.
    ///
    /// The count is checked before the signature is touched: if it already reached
    /// [`LOCAL_COUNT_LIMIT`], the signature stays unchanged and a fatal error is returned.
    ///
    /// # Errors
    /// Returns [`crate::Error::Fatal`] with [`FatalReason::LocalCountOverflow`] if no further
    /// local can be added.
    pub fn append(&mut self, type_bytes: &[u8]) -> Result<u16> {
        if type_bytes.is_empty() {
            return Err(malformed_error!("Local variable type must not be empty"));
        }

        let (count, width) = self.read_count()?;
        if count >= LOCAL_COUNT_LIMIT {
            return Err(Error::Fatal(FatalReason::LocalCountOverflow(count)));
        }

        let new_count = count + 1;
        self.data.extend_from_slice(type_bytes);
        self.data.splice(1..1 + width, compress_uint(new_count));
        self.modified = true;

        // count < LOCAL_COUNT_LIMIT, the index always fits
        u16::try_from(count).map_err(|_| OutOfBounds)
    }

    /// Returns the encoded signature
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Returns `true` if at least one local was appended
    #[must_use]
    pub fn is_modified(&self) -> bool {
        self.modified
    }
}

impl Default for LocalsSignature {
    fn default() -> Self {
        Self::new()
    }
}
