//! Method body and section flags for CIL method bodies.
//!
//! # Key Types
//! - [`MethodBodyFlags`]: flags of the tiny and fat method header
//! - [`SectionFlags`]: flags of an extra data section following the code

use bitflags::bitflags;

/// Bitmask for the 2-bit header format tag shared by tiny and fat headers
pub const METHOD_HEADER_FORMAT_MASK: u8 = 0b_0000_0011;

/// Bitmask for the 12 flag bits of the first word of a fat header
pub const FAT_HEADER_FLAGS_MASK: u16 = 0x0FFF;

/// Size of a fat method header in bytes
pub const FAT_HEADER_SIZE: usize = 12;

/// Size of a fat method header in 4-byte words, as stored in its size nibble
pub const FAT_HEADER_SIZE_WORDS: u8 = 3;

/// Largest code size a tiny header can describe
pub const TINY_CODE_SIZE_MAX: usize = 63;

/// Max stack implied by a tiny header
pub const TINY_MAX_STACK: u16 = 8;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// Flags that a method body can have
    pub struct MethodBodyFlags: u16 {
        /// Tiny method header format
        const TINY_FORMAT = 0x2;
        /// Fat method header format
        const FAT_FORMAT = 0x3;
        /// Flag of the fat method header, showing that there are more data sections appended to the header
        const MORE_SECTS = 0x8;
        /// Flag to indicate that this method should call the default constructor on all local variables
        const INIT_LOCALS = 0x10;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// Flags that a method body section can have
    pub struct SectionFlags: u8 {
        /// Indicates that this section contains exception handling data
        const EHTABLE = 0x1;
        /// Reserved, shall be 0
        const OPT_ILTABLE = 0x2;
        /// Indicates that the data section format is fat
        const FAT_FORMAT = 0x40;
        /// Indicates that the data section is followed by another one
        const MORE_SECTS = 0x80;
    }
}

/// The two mutually exclusive method header encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderFormat {
    /// One byte: 2-bit format tag, 6-bit code size
    Tiny,
    /// Twelve bytes: flags, size, max stack, code size, local signature token
    Fat,
}

impl HeaderFormat {
    /// Detects the format from the first byte of a method body.
    ///
    /// Returns `None` if the format tag is neither tiny nor fat.
    #[must_use]
    pub fn detect(first_byte: u8) -> Option<Self> {
        match u16::from(first_byte & METHOD_HEADER_FORMAT_MASK) {
            tag if tag == MethodBodyFlags::FAT_FORMAT.bits() => Some(HeaderFormat::Fat),
            tag if tag == MethodBodyFlags::TINY_FORMAT.bits() => Some(HeaderFormat::Tiny),
            _ => None,
        }
    }
}
