//! Exception handling sections of CIL method bodies.
//!
//! This module decodes the extra data sections that follow the code of a fat method body
//! (ECMA-335 II.25.4.5 / II.25.4.6), keeps track of the clauses a rewrite adds, and
//! re-encodes everything into a single fat exception handling section once the final
//! layout of the rewritten code is known.
//!
//! Clauses parsed from the original body carry offsets relative to the original code. When
//! the rewrite places injected instructions in front of the original code, those offsets are
//! shifted by the user-code offset while encoding. Clauses added by the rewrite are recorded
//! with offsets already relative to the rewritten code.
//!
//! # Examples
//!
//! ```rust
//! use ilweave::metadata::method::{ExceptionClause, ExceptionHandlerFlags, ExceptionSection};
//!
//! let mut section = ExceptionSection::empty();
//! section.add_clause(ExceptionClause {
//!     flags: ExceptionHandlerFlags::EXCEPTION,
//!     try_offset: 0,
//!     try_length: 10,
//!     handler_offset: 10,
//!     handler_length: 6,
//!     class_token_or_filter: 0x0100_0001,
//! });
//!
//! let bytes = section.extra_section_bytes(0)?;
//! assert_eq!(bytes.len(), 4 + 24);
//! assert_eq!(bytes[0], 0x41); // EHTABLE | FAT_FORMAT
//! # Ok::<(), ilweave::Error>(())
//! ```

use bitflags::bitflags;

use crate::{
    file::io::{read_le, read_le_at, write_le_at},
    metadata::method::SectionFlags,
    utils::to_u32,
    Result,
};

/// Size of one clause inside a fat exception handling section
const FAT_CLAUSE_SIZE: usize = 24;
/// Size of one clause inside a small exception handling section
const SMALL_CLAUSE_SIZE: usize = 12;
/// Size of the section header (kind + data size)
const SECTION_HEADER_SIZE: usize = 4;
/// Largest data size a fat section can declare (24-bit field)
const FAT_SECTION_SIZE_MAX: usize = 0x00FF_FFFF;

bitflags! {
    /// Exception handler flags defining the type of exception handling clause.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExceptionHandlerFlags: u16 {
        /// A typed exception clause.
        ///
        /// The `class_token_or_filter` field contains the metadata token of the exception type
        /// that this handler catches.
        const EXCEPTION = 0x0000;

        /// An exception filter and handler clause.
        ///
        /// The `class_token_or_filter` field contains the offset of the filter code.
        const FILTER = 0x0001;

        /// A finally clause.
        const FINALLY = 0x0002;

        /// A fault clause (finally that executes only on exception).
        const FAULT = 0x0004;
    }
}

/// One exception handling clause: a protected region and its handler.
///
/// # Layout in IL
///
/// ```text
/// try {
///     // try_offset -> try_offset + try_length
/// }
/// catch (ExceptionType) {
///     // handler_offset -> handler_offset + handler_length
/// }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionClause {
    /// Flags describing the type of exception handler (catch, filter, finally, fault).
    pub flags: ExceptionHandlerFlags,
    /// Offset in bytes of try block from start of the code.
    pub try_offset: u32,
    /// Length in bytes of the try block.
    pub try_length: u32,
    /// Offset in bytes of the handler from start of the code.
    pub handler_offset: u32,
    /// Size of the handler code in bytes.
    pub handler_length: u32,
    /// Class token for typed clauses, filter offset for filter clauses, 0 otherwise.
    pub class_token_or_filter: u32,
}

impl ExceptionClause {
    /// Returns a copy of this clause with all code offsets moved by `delta` bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if an offset overflows.
    pub fn shifted(&self, delta: u32) -> Result<ExceptionClause> {
        let shift = |value: u32| {
            value
                .checked_add(delta)
                .ok_or_else(|| malformed_error!("Exception clause offset overflow - {}", value))
        };

        Ok(ExceptionClause {
            flags: self.flags,
            try_offset: shift(self.try_offset)?,
            try_length: self.try_length,
            handler_offset: shift(self.handler_offset)?,
            handler_length: self.handler_length,
            class_token_or_filter: if self.flags.contains(ExceptionHandlerFlags::FILTER) {
                shift(self.class_token_or_filter)?
            } else {
                self.class_token_or_filter
            },
        })
    }
}

/// The exception handling data of one method body.
///
/// Holds the clauses of the original body and the ones a rewrite adds, see the module
/// documentation for how their offsets are treated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExceptionSection {
    original: Vec<ExceptionClause>,
    added: Vec<ExceptionClause>,
}

impl ExceptionSection {
    /// Create a section without any clauses, for bodies that carry no extra sections.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse the extra sections starting at the first byte of `data`.
    ///
    /// Both small and fat sections are understood; parsing follows the `MORE_SECTS` chain and
    /// stops at the first section which is not an exception handling table.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if a declared clause lies past the data.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut original = Vec::new();
        let mut cursor = 0_usize;

        while data.len() >= cursor + SECTION_HEADER_SIZE {
            let section_flags = SectionFlags::from_bits_truncate(read_le::<u8>(&data[cursor..])?);
            if !section_flags.contains(SectionFlags::EHTABLE) {
                break;
            }

            if section_flags.contains(SectionFlags::FAT_FORMAT) {
                let section_size = (read_le::<u32>(&data[cursor..])? >> 8) as usize;
                if section_size < SECTION_HEADER_SIZE || data.len() < cursor + section_size {
                    return Err(malformed_error!(
                        "Fat exception section of {} bytes exceeds the method body",
                        section_size
                    ));
                }

                let mut clause_cursor = cursor + SECTION_HEADER_SIZE;
                for _ in 0..(section_size - SECTION_HEADER_SIZE) / FAT_CLAUSE_SIZE {
                    original.push(ExceptionClause {
                        // Upper 16 bits of the flags are reserved
                        #[allow(clippy::cast_possible_truncation)]
                        flags: ExceptionHandlerFlags::from_bits_truncate(
                            read_le_at::<u32>(data, &mut clause_cursor)? as u16,
                        ),
                        try_offset: read_le_at::<u32>(data, &mut clause_cursor)?,
                        try_length: read_le_at::<u32>(data, &mut clause_cursor)?,
                        handler_offset: read_le_at::<u32>(data, &mut clause_cursor)?,
                        handler_length: read_le_at::<u32>(data, &mut clause_cursor)?,
                        class_token_or_filter: read_le_at::<u32>(data, &mut clause_cursor)?,
                    });
                }

                cursor += section_size;
            } else {
                let section_size = usize::from(read_le::<u8>(&data[cursor + 1..])?);
                if section_size < SECTION_HEADER_SIZE || data.len() < cursor + section_size {
                    return Err(malformed_error!(
                        "Small exception section of {} bytes exceeds the method body",
                        section_size
                    ));
                }

                let mut clause_cursor = cursor + SECTION_HEADER_SIZE;
                for _ in 0..(section_size - SECTION_HEADER_SIZE) / SMALL_CLAUSE_SIZE {
                    original.push(ExceptionClause {
                        flags: ExceptionHandlerFlags::from_bits_truncate(read_le_at::<u16>(
                            data,
                            &mut clause_cursor,
                        )?),
                        try_offset: u32::from(read_le_at::<u16>(data, &mut clause_cursor)?),
                        try_length: u32::from(read_le_at::<u8>(data, &mut clause_cursor)?),
                        handler_offset: u32::from(read_le_at::<u16>(data, &mut clause_cursor)?),
                        handler_length: u32::from(read_le_at::<u8>(data, &mut clause_cursor)?),
                        class_token_or_filter: read_le_at::<u32>(data, &mut clause_cursor)?,
                    });
                }

                // Small sections are padded to the next 4-byte boundary
                cursor += (section_size + 3) & !3;
            }

            if !section_flags.contains(SectionFlags::MORE_SECTS) {
                break;
            }
        }

        Ok(ExceptionSection {
            original,
            added: Vec::new(),
        })
    }

    /// The clauses of the original method body, relative to the original code.
    #[must_use]
    pub fn original_clauses(&self) -> &[ExceptionClause] {
        &self.original
    }

    /// The clauses added by the rewrite, relative to the rewritten code.
    #[must_use]
    pub fn added_clauses(&self) -> &[ExceptionClause] {
        &self.added
    }

    /// Record a clause whose offsets are relative to the rewritten code.
    ///
    /// Nested regions must be added innermost first.
    pub fn add_clause(&mut self, clause: ExceptionClause) {
        self.added.push(clause);
    }

    /// Returns `true` if neither the original body nor the rewrite carry any clause.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.original.is_empty() && self.added.is_empty()
    }

    /// Encode all clauses into one fat exception handling section.
    ///
    /// Original clauses are shifted by `user_code_offset`, the offset in the rewritten code at
    /// which the original instructions begin. They are emitted before the added clauses, as
    /// injected regions can only enclose original code, never the other way round. Returns an
    /// empty buffer if there is no clause at all.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the section would not fit the 24-bit size field
    /// or a shifted offset overflows.
    pub fn extra_section_bytes(&self, user_code_offset: u32) -> Result<Vec<u8>> {
        if self.is_empty() {
            return Ok(Vec::new());
        }

        let clause_count = self.original.len() + self.added.len();
        let section_size = SECTION_HEADER_SIZE + clause_count * FAT_CLAUSE_SIZE;
        if section_size > FAT_SECTION_SIZE_MAX {
            return Err(malformed_error!(
                "Exception section with {} clauses is too large",
                clause_count
            ));
        }

        let mut bytes = vec![0_u8; section_size];
        let mut cursor = 0_usize;
        let kind = SectionFlags::EHTABLE | SectionFlags::FAT_FORMAT;
        write_le_at(
            &mut bytes,
            &mut cursor,
            (to_u32(section_size)? << 8) | u32::from(kind.bits()),
        )?;

        let shifted = self
            .original
            .iter()
            .map(|clause| clause.shifted(user_code_offset))
            .collect::<Result<Vec<_>>>()?;

        for clause in shifted.iter().chain(self.added.iter()) {
            write_le_at(&mut bytes, &mut cursor, u32::from(clause.flags.bits()))?;
            write_le_at(&mut bytes, &mut cursor, clause.try_offset)?;
            write_le_at(&mut bytes, &mut cursor, clause.try_length)?;
            write_le_at(&mut bytes, &mut cursor, clause.handler_offset)?;
            write_le_at(&mut bytes, &mut cursor, clause.handler_length)?;
            write_le_at(&mut bytes, &mut cursor, clause.class_token_or_filter)?;
        }

        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_section() -> Vec<u8> {
        vec![
            0x01, 0x10, 0x00, 0x00, // EHTABLE, 16 bytes
            0x02, 0x00, // FINALLY
            0x08, 0x00, 0x1B, // try 0x08 + 0x1B
            0x23, 0x00, 0x0A, // handler 0x23 + 0x0A
            0x00, 0x00, 0x00, 0x00,
        ]
    }

    #[test]
    fn parse_small_section() {
        let section = ExceptionSection::parse(&small_section()).unwrap();

        assert_eq!(section.original_clauses().len(), 1);
        let clause = section.original_clauses()[0];
        assert!(clause.flags.contains(ExceptionHandlerFlags::FINALLY));
        assert_eq!(clause.try_offset, 0x8);
        assert_eq!(clause.try_length, 0x1B);
        assert_eq!(clause.handler_offset, 0x23);
        assert_eq!(clause.handler_length, 0xA);
        assert_eq!(clause.class_token_or_filter, 0);
    }

    #[test]
    fn parse_fat_section_two_clauses() {
        let mut data = vec![0x41, 52, 0x00, 0x00];
        for (flags, try_offset, try_length, handler_offset, handler_length, extra) in [
            (2_u32, 0x145_u32, 0x28_u32, 0x16D_u32, 0xE_u32, 0_u32),
            (0, 0x9, 0x18A, 0x193, 0xA, 0x0100_003F),
        ] {
            for value in [flags, try_offset, try_length, handler_offset, handler_length, extra] {
                data.extend_from_slice(&value.to_le_bytes());
            }
        }

        let section = ExceptionSection::parse(&data).unwrap();
        let clauses = section.original_clauses();
        assert_eq!(clauses.len(), 2);
        assert!(clauses[0].flags.contains(ExceptionHandlerFlags::FINALLY));
        assert_eq!(clauses[0].try_offset, 0x145);
        assert_eq!(clauses[1].flags, ExceptionHandlerFlags::EXCEPTION);
        assert_eq!(clauses[1].handler_length, 0xA);
        assert_eq!(clauses[1].class_token_or_filter, 0x0100_003F);
    }

    #[test]
    fn parse_truncated_section() {
        let mut data = small_section();
        data.truncate(10);
        assert!(ExceptionSection::parse(&data).is_err());
    }

    #[test]
    fn empty_section_encodes_to_nothing() {
        let section = ExceptionSection::empty();
        assert!(section.is_empty());
        assert!(section.extra_section_bytes(32).unwrap().is_empty());
    }

    #[test]
    fn reencode_shifts_original_clauses() {
        let mut section = ExceptionSection::parse(&small_section()).unwrap();
        section.add_clause(ExceptionClause {
            flags: ExceptionHandlerFlags::EXCEPTION,
            try_offset: 0,
            try_length: 0x40,
            handler_offset: 0x40,
            handler_length: 0x8,
            class_token_or_filter: 0x0100_0002,
        });

        let bytes = section.extra_section_bytes(0x10).unwrap();
        assert_eq!(bytes.len(), 4 + 2 * 24);
        assert_eq!(&bytes[..4], &[0x41, 52, 0x00, 0x00]);

        let reparsed = ExceptionSection::parse(&bytes).unwrap();
        let clauses = reparsed.original_clauses();
        assert_eq!(clauses.len(), 2);
        assert_eq!(clauses[0].try_offset, 0x18);
        assert_eq!(clauses[0].try_length, 0x1B);
        assert_eq!(clauses[0].handler_offset, 0x33);
        assert_eq!(clauses[1].try_offset, 0);
        assert_eq!(clauses[1].handler_offset, 0x40);
        assert_eq!(clauses[1].class_token_or_filter, 0x0100_0002);
    }

    #[test]
    fn filter_offsets_are_shifted() {
        let clause = ExceptionClause {
            flags: ExceptionHandlerFlags::FILTER,
            try_offset: 0,
            try_length: 4,
            handler_offset: 10,
            handler_length: 2,
            class_token_or_filter: 4,
        };

        let shifted = clause.shifted(8).unwrap();
        assert_eq!(shifted.try_offset, 8);
        assert_eq!(shifted.handler_offset, 18);
        assert_eq!(shifted.class_token_or_filter, 12);
    }
}
