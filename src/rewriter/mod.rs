//! Rewriting one method body.
//!
//! A [`MethodRewriter`] is created per target method. Creating it decomposes the current body
//! of the method and extracts its local variable signature; afterwards any number of
//! emission primitives (see the `emitter` methods on [`MethodRewriter`]) build the new code
//! in the owned [`InstructionSet`], and exactly one of [`MethodRewriter::instrument`] or
//! [`MethodRewriter::instrument_tiny`] assembles the result and commits it to the host.
//! Both consume the rewriter.
//!
//! # Examples
//!
//! ```rust,ignore
//! use ilweave::{MethodRewriter, RewriterConfig};
//!
//! let mut rewriter = MethodRewriter::new(&function, RewriterConfig::from_env())?;
//!
//! rewriter.write_line_to_console("entering method")?;
//! rewriter.append_user_code()?;
//! rewriter.instrument()?;
//! ```
//!
//! # Errors
//!
//! Conditions that leave the target method in an undefined state surface as
//! [`crate::Error::Fatal`] and are logged at error level with the name of the method before
//! they are returned.

mod assembler;
mod cache;
mod config;
mod emitter;

pub use cache::{MethodInfoCache, MethodInfoCacheKey, MethodLookup};
pub use config::{RewriterConfig, DEFAULT_CACHE_HELPER, DISABLE_METHOD_CACHE_ENV};
pub use emitter::{
    emit_return, generator, throw_exception, throw_exception_if_null, Generator,
    EXCEPTION_CTOR, WRITE_LINE,
};

use crate::{
    assembly::InstructionSet,
    function::Function,
    metadata::{
        method::{HeaderFormat, MethodBody, MethodHeader},
        signatures::{parse_method_signature, LocalsSignature, SignatureMethod},
    },
    Error, Result,
};

/// The rewrite of one method body.
///
/// Not shared between threads; every method gets its own instance, only the
/// [`MethodInfoCache`] is shared.
pub struct MethodRewriter<'a, F: Function + ?Sized> {
    function: &'a F,
    config: RewriterConfig,
    cache: &'a MethodInfoCache<MethodLookup>,
    name: String,
    format: HeaderFormat,
    header: MethodHeader,
    code: Vec<u8>,
    locals: LocalsSignature,
    signature: SignatureMethod,
    instructions: InstructionSet<'a>,
}

impl<'a, F: Function + ?Sized> MethodRewriter<'a, F> {
    /// Start the rewrite of `function`, using the process-wide method info cache.
    ///
    /// # Errors
    /// Returns [`crate::Error::Fatal`] if the method header is neither tiny nor fat, or the
    /// error of the host or parser if body, local variable signature or method signature can
    /// not be read.
    pub fn new(function: &'a F, config: RewriterConfig) -> Result<Self> {
        Self::with_cache(function, config, MethodInfoCache::global())
    }

    /// Start the rewrite of `function`, registering cached lookups in `cache`.
    ///
    /// # Errors
    /// See [`MethodRewriter::new`].
    pub fn with_cache(
        function: &'a F,
        config: RewriterConfig,
        cache: &'a MethodInfoCache<MethodLookup>,
    ) -> Result<Self> {
        let name = function.name();

        log::trace!("[{name}] decomposing method body");
        let bytes = function.method_bytes()?;
        let body = MethodBody::decompose(&bytes).map_err(|error| log_fatal(&name, error))?;

        log::trace!("[{name}] extracting local variable signature");
        let locals = if body.header.local_var_sig_token.is_null() {
            LocalsSignature::new()
        } else {
            let blob = function.signature_from_token(body.header.local_var_sig_token)?;
            LocalsSignature::from_blob(&blob)?
        };

        let signature = parse_method_signature(function.signature())?;

        log::trace!(
            "[{name}] {:?} header, {} code bytes, {} exception clauses",
            body.format,
            body.code.len(),
            body.exceptions.original_clauses().len()
        );

        Ok(MethodRewriter {
            function,
            config,
            cache,
            name,
            format: body.format,
            header: body.header,
            code: body.code,
            locals,
            signature,
            instructions: InstructionSet::new(function.tokenizer(), body.exceptions),
        })
    }

    /// Append a local of the type encoded by `type_bytes` and return its index.
    ///
    /// # Errors
    /// Returns [`crate::Error::Fatal`] if the signature can not take another local; it is
    /// left unchanged in that case.
    pub fn append_local(&mut self, type_bytes: &[u8]) -> Result<u16> {
        let index = self
            .locals
            .append(type_bytes)
            .map_err(|error| log_fatal(&self.name, error))?;
        log::trace!("[{}] added local {index}", self.name);
        Ok(index)
    }

    /// Append a local of the type named `type_name`, e.g. `"int32"` or
    /// `"[mscorlib]System.Exception"`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Tokenizer`] if the type can not be resolved, otherwise see
    /// [`MethodRewriter::append_local`].
    pub fn append_local_type(&mut self, type_name: &str) -> Result<u16> {
        let type_bytes = self.function.tokenizer().type_signature(type_name)?;
        self.append_local(&type_bytes)
    }

    /// Append a local holding the return value of the method.
    ///
    /// Returns `None` for methods returning `void`.
    ///
    /// # Errors
    /// See [`MethodRewriter::append_local`].
    pub fn append_return_type_local(&mut self) -> Result<Option<u16>> {
        if self.signature.return_type.is_void() {
            return Ok(None);
        }

        let type_bytes = self.signature.return_type.blob.clone();
        self.append_local(&type_bytes).map(Some)
    }

    /// Splice the original code of the method in at the current position.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the original code was already appended.
    pub fn append_user_code(&mut self) -> Result<()> {
        log::trace!(
            "[{}] original code placed at {}",
            self.name,
            self.instructions.len()
        );
        self.instructions.append_user_code(&self.code)
    }

    /// Returns `true` if the method has exactly the signature `signature`
    #[must_use]
    pub fn has_signature(&self, signature: &[u8]) -> bool {
        self.function.signature() == signature
    }

    /// The instructions built so far, for emitting code directly
    pub fn instructions(&mut self) -> &mut InstructionSet<'a> {
        &mut self.instructions
    }

    /// The method being rewritten
    #[must_use]
    pub fn function(&self) -> &'a F {
        self.function
    }

    /// The configuration this rewriter was created with
    #[must_use]
    pub fn config(&self) -> &RewriterConfig {
        &self.config
    }

    /// The format of the original header
    #[must_use]
    pub fn format(&self) -> HeaderFormat {
        self.format
    }

    /// The header as it will be written, in fat layout
    #[must_use]
    pub fn header(&self) -> &MethodHeader {
        &self.header
    }

    /// The original code of the method
    #[must_use]
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// The local variable signature, including appended locals
    #[must_use]
    pub fn locals(&self) -> &LocalsSignature {
        &self.locals
    }

    /// The parsed signature of the method
    #[must_use]
    pub fn signature(&self) -> &SignatureMethod {
        &self.signature
    }
}

/// Log `error` with the method name if it is fatal, and hand it back
fn log_fatal(name: &str, error: Error) -> Error {
    if error.is_fatal() {
        log::error!("[{name}] {error}");
    }
    error
}
