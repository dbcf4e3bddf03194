//! Error Module - rtfm Error Types
//!
//! Two families of failure live here.
//!
//! ## Transaction outcomes
//! [`Abort`] is the control-flow error of transactional code. Every
//! transactional operation returns [`Transactional<T>`] and an abort travels
//! back to the nearest checkpoint with `?`:
//! - `ByRequest` - user code asked to abort
//! - `ByLanguage` - the runtime cannot continue transactionally
//! - `FailedLockAcquisition` - a commit lock was unavailable (retried)
//! - `Cascade` - abort every nesting level
//!
//! ## Runtime errors
//! [`RtfmError`] covers fallible operations outside a transaction:
//! configuration, function registration and ABI descriptor decoding.
//!
//! Precondition violations are neither: they go through [`fatal!`] and
//! terminate the thread.

use thiserror::Error;

/// Reason a transaction attempt stopped before committing
///
/// # Examples
///
/// ```rust
/// use rtfm::{Abort, Context, TransactionResult};
///
/// let mut ctx = Context::with_defaults();
/// let result = ctx.transact(|_tx| Err(Abort::ByRequest));
/// assert_eq!(result, TransactionResult::AbortedByRequest);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[must_use]
pub enum Abort {
    /// User code requested the abort
    #[error("transaction aborted by request")]
    ByRequest,

    /// The runtime hit something it cannot run transactionally
    ///
    /// **When returned:** missing function redirection, unsupported library
    /// call, explicit `abort_by_language`.
    #[error("transaction aborted by language")]
    ByLanguage,

    /// A lock required for commit could not be taken
    ///
    /// **Recovery strategy:** the outer transaction undoes, resets and retries
    /// with lock pre-acquisition enabled.
    #[error("transaction aborted by failed lock acquisition")]
    FailedLockAcquisition,

    /// Abort requested for the whole transaction stack
    #[error("transaction aborted by cascade")]
    Cascade,
}

/// Result type of transactional code
pub type Transactional<T> = std::result::Result<T, Abort>;

/// Main error type for runtime operations outside a transaction
#[derive(Debug, Error)]
pub enum RtfmError {
    /// Configuration error
    ///
    /// **When returned:** invalid config values or unreadable config source
    ///
    /// **Recovery strategy:** fall back to `RuntimeConfig::default()`
    #[error("Configuration error: {0}")]
    Configuration(#[from] crate::config::ConfigError),

    /// A function was registered twice with different substitutes
    ///
    /// **Recovery strategy:** fix the registration site; the first mapping wins
    #[error(
        "Conflicting registration for {original:#x}: already mapped to {existing:#x}, refused {requested:#x}"
    )]
    ConflictingRegistration {
        original: usize,
        existing: usize,
        requested: usize,
    },

    /// Invalid argument
    ///
    /// **Example scenarios:**
    /// - Null function pointer passed to the registry
    /// - ABI blob with the wrong length
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Internal error - indicates a bug in rtfm
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error while reading a config file
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RtfmError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(self, RtfmError::Configuration(_) | RtfmError::Io(_))
    }

    /// Check if this error indicates a bug in the code
    pub fn is_bug(&self) -> bool {
        matches!(self, RtfmError::Internal(_))
    }
}

/// Result type alias for rtfm operations
pub type Result<T> = std::result::Result<T, RtfmError>;

/// Terminate on a violated runtime precondition
///
/// Logs through `log::error!` first so the message survives even when the
/// panic is caught by a test harness or an FFI boundary.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        let message = format!($($arg)*);
        $crate::__log::error!("rtfm fatal: {}", message);
        panic!("rtfm fatal: {}", message)
    }};
}
