//! Decoding and encoding of CIL method headers.
//!
//! A method body starts with either a one byte tiny header or a twelve byte fat header
//! (ECMA-335 II.25.4.2, II.25.4.3). The rewriter always works on the fat representation:
//! tiny headers are promoted on decomposition, and only the explicit tiny finalize path ever
//! emits a tiny header again.
//!
//! # Examples
//!
//! ```rust
//! use ilweave::metadata::method::{MethodBody, MethodBodyFlags};
//!
//! // Tiny header: 3 bytes of code (nop, nop, ret)
//! let body = MethodBody::decompose(&[0x0E, 0x00, 0x00, 0x2A])?;
//!
//! assert_eq!(body.header.max_stack, 8);
//! assert_eq!(body.header.code_size, 3);
//! assert!(body.header.flags.contains(MethodBodyFlags::INIT_LOCALS));
//! assert_eq!(body.code, vec![0x00, 0x00, 0x2A]);
//! # Ok::<(), ilweave::Error>(())
//! ```
//!
//! # References
//! - ECMA-335 6th Edition, Partition II, Section 25.4 - Method Header Format

use crate::{
    file::io::read_le,
    metadata::{
        method::{
            ExceptionSection, HeaderFormat, MethodBodyFlags, FAT_HEADER_FLAGS_MASK,
            FAT_HEADER_SIZE, FAT_HEADER_SIZE_WORDS, TINY_CODE_SIZE_MAX, TINY_MAX_STACK,
        },
        token::Token,
    },
    utils::align_to_4,
    Error::{self, OutOfBounds},
    FatalReason, Result,
};

/// The fat method header, the representation every rewrite operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodHeader {
    /// The 12 flag bits of the first header word, including the format tag
    pub flags: MethodBodyFlags,
    /// Maximum number of items on the operand stack
    pub max_stack: u16,
    /// Size of the code in bytes, not counting the header
    pub code_size: u32,
    /// `StandAloneSig` token of the local variable signature, null if there are no locals
    pub local_var_sig_token: Token,
}

impl MethodHeader {
    /// Read a fat header from the first twelve bytes of `data`.
    ///
    /// Unknown flag bits are retained, so that [`MethodHeader::to_bytes`] reproduces the
    /// input exactly.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `data` is shorter than a fat header, or
    /// [`crate::Error::Malformed`] if the header declares less than three words.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < FAT_HEADER_SIZE {
            return Err(OutOfBounds);
        }

        let first_duo = read_le::<u16>(data)?;
        let size_words = first_duo >> 12;
        if size_words < u16::from(FAT_HEADER_SIZE_WORDS) {
            return Err(malformed_error!(
                "Fat method header declares {} words, at least {} are required",
                size_words,
                FAT_HEADER_SIZE_WORDS
            ));
        }

        Ok(MethodHeader {
            flags: MethodBodyFlags::from_bits_retain(first_duo & FAT_HEADER_FLAGS_MASK),
            max_stack: read_le::<u16>(&data[2..])?,
            code_size: read_le::<u32>(&data[4..])?,
            local_var_sig_token: Token::new(read_le::<u32>(&data[8..])?),
        })
    }

    /// Synthesize the fat equivalent of a tiny header describing `code_size` bytes.
    ///
    /// Tiny bodies have an implicit max stack of 8, no locals and no extra sections.
    #[must_use]
    pub fn promote_tiny(code_size: u8) -> Self {
        MethodHeader {
            flags: MethodBodyFlags::FAT_FORMAT | MethodBodyFlags::INIT_LOCALS,
            max_stack: TINY_MAX_STACK,
            code_size: u32::from(code_size),
            local_var_sig_token: Token::NULL,
        }
    }

    /// Returns `true` if extra data sections follow the code.
    #[must_use]
    pub fn has_more_sections(&self) -> bool {
        self.flags.contains(MethodBodyFlags::MORE_SECTS)
    }

    /// Encode this header into its twelve byte fat form.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; FAT_HEADER_SIZE] {
        let first_duo = (u16::from(FAT_HEADER_SIZE_WORDS) << 12)
            | (self.flags.bits() & FAT_HEADER_FLAGS_MASK);

        let mut bytes = [0_u8; FAT_HEADER_SIZE];
        bytes[0..2].copy_from_slice(&first_duo.to_le_bytes());
        bytes[2..4].copy_from_slice(&self.max_stack.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.code_size.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.local_var_sig_token.value().to_le_bytes());
        bytes
    }
}

/// Pack a tiny header byte for `code_len` bytes of code.
///
/// # Errors
/// Returns [`crate::Error::TinyBodyTooLarge`] if the code does not fit into six bits.
pub fn encode_tiny_header(code_len: usize) -> Result<u8> {
    if code_len > TINY_CODE_SIZE_MAX {
        return Err(Error::TinyBodyTooLarge(code_len));
    }

    // Bounded by TINY_CODE_SIZE_MAX above
    #[allow(clippy::cast_possible_truncation)]
    let header = ((code_len as u8) << 2) | MethodBodyFlags::TINY_FORMAT.bits() as u8;
    Ok(header)
}

/// A method body split into its parts.
#[derive(Debug, Clone)]
pub struct MethodBody {
    /// The format the body was stored in
    pub format: HeaderFormat,
    /// The fat header; synthesized if the body used a tiny header
    pub header: MethodHeader,
    /// The CIL instruction bytes
    pub code: Vec<u8>,
    /// The exception handling clauses of the body
    pub exceptions: ExceptionSection,
    /// Offset of the first extra section, if the body has any
    pub extra_section_offset: Option<usize>,
}

impl MethodBody {
    /// Split the raw bytes of a method body into header, code and exception handling data.
    ///
    /// # Arguments
    /// * `data` - The method body, starting at its header
    ///
    /// # Errors
    /// Returns [`crate::Error::Fatal`] with [`FatalReason::UnknownHeaderFormat`] if the format
    /// tag is neither tiny nor fat, [`crate::Error::OutOfBounds`] if the body is truncated, or
    /// [`crate::Error::Malformed`] for a damaged extra section.
    pub fn decompose(data: &[u8]) -> Result<MethodBody> {
        let first_byte = read_le::<u8>(data)?;

        match HeaderFormat::detect(first_byte) {
            Some(HeaderFormat::Tiny) => {
                let code_size = first_byte >> 2;
                let code_end = 1 + usize::from(code_size);
                if data.len() < code_end {
                    return Err(OutOfBounds);
                }

                Ok(MethodBody {
                    format: HeaderFormat::Tiny,
                    header: MethodHeader::promote_tiny(code_size),
                    code: data[1..code_end].to_vec(),
                    exceptions: ExceptionSection::empty(),
                    extra_section_offset: None,
                })
            }
            Some(HeaderFormat::Fat) => {
                let header = MethodHeader::from_bytes(data)?;
                // Code starts after the declared header size, which may exceed the 12 bytes read
                let code_start = usize::from(read_le::<u16>(data)? >> 12) * 4;
                let code_end = code_start
                    .checked_add(header.code_size as usize)
                    .ok_or(OutOfBounds)?;
                if data.len() < code_end {
                    return Err(OutOfBounds);
                }

                // Exception Handling -> II.25.4.5
                let (exceptions, extra_section_offset) = if header.has_more_sections() {
                    let offset = align_to_4(code_end);
                    if data.len() < offset {
                        return Err(OutOfBounds);
                    }

                    (ExceptionSection::parse(&data[offset..])?, Some(offset))
                } else {
                    (ExceptionSection::empty(), None)
                };

                Ok(MethodBody {
                    format: HeaderFormat::Fat,
                    header,
                    code: data[code_start..code_end].to_vec(),
                    exceptions,
                    extra_section_offset,
                })
            }
            None => Err(Error::Fatal(FatalReason::UnknownHeaderFormat(first_byte))),
        }
    }
}
