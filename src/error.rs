use thiserror::Error;

use crate::metadata::token::Token;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The unrecoverable conditions of a rewrite.
///
/// Every reason in here means the target routine must not be touched any further. The
/// write-back reason is special, as the routine may already have been left in an unusable
/// state by the partial write attempt of the host.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FatalReason {
    /// The method header is neither in the tiny nor in the fat format.
    ///
    /// The associated value is the first byte of the method body.
    #[error("method header is neither tiny nor fat - 0x{0:02x}")]
    UnknownHeaderFormat(u8),

    /// The local variable signature already holds too many locals to add another one.
    ///
    /// The associated value is the decoded local count at the time of the append.
    #[error("extracted local count (0x{0:x}) is too big to add locals to (>= 0xfffe)")]
    LocalCountOverflow(u32),

    /// The host failed to commit the rewritten method body.
    #[error("writing the method body failed, the method may no longer be valid - {0}")]
    WriteBack(String),
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// # Error Categories
///
/// ## Fatal
/// - [`Error::Fatal`] - The one non-recoverable kind; see [`FatalReason`]
///
/// ## Parsing Errors
/// - [`Error::Malformed`] - Corrupted or invalid method body, section or signature
/// - [`Error::OutOfBounds`] - Attempted to read beyond the provided data
/// - [`Error::RecursionLimit`] - Signature nesting too deep
///
/// ## Encoding Errors
/// - [`Error::InvalidMnemonic`] - Unknown instruction mnemonic
/// - [`Error::UnknownLabel`] - A jump targets a label that was never placed
/// - [`Error::StackImbalance`] - Emitted code leaves an inconsistent evaluation stack
/// - [`Error::TinyBodyTooLarge`] / [`Error::TinyBodyUnsupported`] - Tiny finalize preconditions
///
/// ## Collaborator Errors
/// - [`Error::Tokenizer`] - The host could not resolve a name to a metadata token
/// - [`Error::TokenNotFound`] - The host has no signature for a token
///
/// # Examples
///
/// ```rust,no_run
/// use ilweave::{Error, FatalReason};
///
/// fn report(error: &Error) {
///     match error {
///         Error::Fatal(FatalReason::WriteBack(message)) => {
///             eprintln!("method is potentially corrupted: {message}");
///         }
///         e if e.is_fatal() => eprintln!("rewrite aborted: {e}"),
///         e => eprintln!("rewrite skipped: {e}"),
///     }
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// A non-recoverable rewrite condition.
    ///
    /// Callers must never continue with the routine after receiving this error.
    #[error("Fatal method rewrite failure - {0}")]
    Fatal(FatalReason),

    /// The data is damaged and could not be parsed.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while parsing.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,

    /// Recursion limit reached while parsing a nested signature.
    #[error("Reach the maximum recursion level allowed - {0}")]
    RecursionLimit(usize),

    /// The mnemonic does not name an instruction this encoder knows.
    #[error("Invalid instruction mnemonic - {0}")]
    InvalidMnemonic(String),

    /// A jump references a label that was never placed in the stream.
    #[error("Jump to label {0} which was never placed")]
    UnknownLabel(usize),

    /// The emitted code leaves the evaluation stack in an inconsistent state.
    #[error("Evaluation stack imbalance - {0}")]
    StackImbalance(String),

    /// The code is too large to be described by a tiny header.
    #[error("Code of {0} bytes does not fit into a tiny method header (max 63)")]
    TinyBodyTooLarge(usize),

    /// The rewrite needs locals or exception handling, which a tiny header can not carry.
    #[error("Tiny method bodies can not carry {0}")]
    TinyBodyUnsupported(&'static str),

    /// The host failed to resolve a name into a metadata token.
    #[error("Failed to tokenize '{0}'")]
    Tokenizer(String),

    /// The host has no signature blob for the given token.
    #[error("No signature found for token {0}")]
    TokenNotFound(Token),
}

impl Error {
    /// Returns `true` if this error must be treated as fatal for the target routine.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }
}
