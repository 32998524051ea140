//! Assembling and committing the rewritten method body.
//!
//! The fat layout written by [`MethodRewriter::instrument`]:
//!
//! ```text
//! +----------------------+ 0
//! | fat header (12)      |
//! +----------------------+ 12
//! | code                 |
//! +----------------------+ 12 + code size
//! | zero padding (0..=3) |
//! +----------------------+ align4(12 + code size)
//! | fat EH section       |  only if MORE_SECTS is set
//! +----------------------+
//! ```

use crate::{
    function::Function,
    metadata::method::{encode_tiny_header, MethodBodyFlags, TINY_MAX_STACK},
    rewriter::MethodRewriter,
    utils::{align_to_4, to_u32},
    Error, FatalReason, Result,
};

impl<'a, F: Function + ?Sized> MethodRewriter<'a, F> {
    /// Assemble the rewritten body with a fat header and commit it to the host.
    ///
    /// The code size and max stack of the header are taken from the built instructions, the
    /// local signature token is replaced if locals were appended, and the exception clauses
    /// follow the code on the next 4-byte boundary.
    ///
    /// # Errors
    /// Returns [`crate::Error::Fatal`] with [`FatalReason::WriteBack`] if the host fails to
    /// commit the body, or the error of encoding the instructions or exception clauses.
    pub fn instrument(mut self) -> Result<()> {
        log::trace!("[{}] assembling fat method body", self.name);

        let code = self.instructions.bytes()?;
        let extra_sections = self.instructions.extra_section_bytes()?;

        self.header.code_size = to_u32(code.len())?;
        self.header.max_stack = self.header.max_stack.max(self.instructions.max_stack());
        self.header
            .flags
            .set(MethodBodyFlags::MORE_SECTS, !extra_sections.is_empty());
        self.write_locals_to_header()?;

        let header = self.header.to_bytes();
        let mut body = Vec::with_capacity(
            align_to_4(header.len() + code.len()) + extra_sections.len(),
        );
        body.extend_from_slice(&header);
        body.extend_from_slice(&code);
        if !extra_sections.is_empty() {
            body.resize(align_to_4(body.len()), 0);
            body.extend_from_slice(&extra_sections);
        }

        self.write_back(&body)
    }

    /// Assemble the rewritten body with a tiny header and commit it to the host.
    ///
    /// Only usable for code of at most 63 bytes, without locals, exception clauses or an
    /// evaluation stack deeper than 8.
    ///
    /// # Errors
    /// Returns [`crate::Error::TinyBodyTooLarge`] or [`crate::Error::TinyBodyUnsupported`]
    /// before anything is written if the body does not fit, [`crate::Error::Fatal`] with
    /// [`FatalReason::WriteBack`] if the host fails to commit it.
    pub fn instrument_tiny(self) -> Result<()> {
        log::trace!("[{}] assembling tiny method body", self.name);

        if self.locals.is_modified() || !self.header.local_var_sig_token.is_null() {
            return Err(Error::TinyBodyUnsupported("local variables"));
        }
        if self.instructions.has_exception_clauses() {
            return Err(Error::TinyBodyUnsupported("exception handling clauses"));
        }
        if self.instructions.max_stack() > TINY_MAX_STACK
            || (self.instructions.has_user_code() && self.header.max_stack > TINY_MAX_STACK)
        {
            return Err(Error::TinyBodyUnsupported("an evaluation stack deeper than 8"));
        }

        let code = self.instructions.bytes()?;
        let mut body = Vec::with_capacity(1 + code.len());
        body.push(encode_tiny_header(code.len())?);
        body.extend_from_slice(&code);

        self.write_back(&body)
    }

    /// Intern the grown local variable signature and reference it from the header.
    ///
    /// The original token is kept if no local was appended.
    fn write_locals_to_header(&mut self) -> Result<()> {
        if !self.locals.is_modified() {
            return Ok(());
        }

        let token = self.function.token_from_signature(self.locals.as_bytes())?;
        log::trace!(
            "[{}] local variable signature {} -> {}",
            self.name,
            self.header.local_var_sig_token,
            token
        );
        self.header.local_var_sig_token = token;
        Ok(())
    }

    fn write_back(&self, body: &[u8]) -> Result<()> {
        log::trace!("[{}] writing {} bytes", self.name, body.len());

        self.function.write_method(body).map_err(|error| {
            let error = Error::Fatal(FatalReason::WriteBack(error.to_string()));
            log::error!("[{}] {error}", self.name);
            error
        })
    }
}
