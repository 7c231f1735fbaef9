//! Error types shared across the engine and the control API.

use fuser::Errno;
use thiserror::Error;

/// Errors the operations engine can surface.
///
/// Host I/O failures and injected [`crate::fault::Fault`] failures both carry
/// a POSIX errno and are reported back to the kernel through the normal FUSE
/// reply channel. `Invariant` is reserved for bookkeeping contradictions that
/// should never happen given a correctly implemented engine (for example, an
/// inode that is open but missing from the path map); these are logged at
/// error level and still answered with `EIO`, since the only alternative for
/// a userspace filesystem is aborting the whole mount.
#[derive(Debug, Error)]
pub enum CharybdisError {
    /// A host syscall failed; carries the raw errno from the OS.
    #[error("host I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An injected [`crate::fault::ErrorFault`] fired for this call.
    #[error("injected fault errno {0}")]
    Injected(i32),

    /// A bookkeeping invariant was violated (duplicate fd for an inode,
    /// forgetting an inode with an open descriptor, replacing a path that
    /// was never recorded, ...).
    #[error("invariant violation: {0}")]
    Invariant(String),
}

impl CharybdisError {
    /// The errno this error should be reported to the kernel as.
    pub fn errno(&self) -> Errno {
        match self {
            CharybdisError::Io(err) => Errno::from_i32(err.raw_os_error().unwrap_or(libc::EIO)),
            CharybdisError::Injected(no) => Errno::from_i32(*no),
            CharybdisError::Invariant(_) => Errno::from_i32(libc::EIO),
        }
    }
}

impl From<nix::Error> for CharybdisError {
    fn from(err: nix::Error) -> Self {
        CharybdisError::Io(std::io::Error::from_raw_os_error(err as i32))
    }
}

/// Result type used throughout the operations engine.
pub type CharybdisResult<T> = Result<T, CharybdisError>;

/// Errors the control API maps to a 4xx JSON response instead of a crash.
#[derive(Debug, Error)]
pub enum ControlApiError {
    /// The request body wasn't valid JSON, or was valid JSON of the wrong shape.
    #[error("malformed request body: {0}")]
    MalformedBody(String),

    /// The JSON named a fault type this build doesn't know about.
    #[error("unknown fault type: {0}")]
    UnknownFaultType(String),

    /// Adding the fault would exceed the 100% probability budget for its syscall.
    #[error("probability budget exceeded for {sys_call}: {existing} + {requested} > 100")]
    ProbabilityBudgetExceeded {
        /// The syscall tag the new rule targets.
        sys_call: String,
        /// Probability already committed to that tag (including `ALL` rules).
        existing: u8,
        /// Probability the rejected rule asked for.
        requested: u8,
    },

    /// The referenced fault id doesn't exist.
    #[error("no such fault: {0}")]
    NotFound(String),

    /// A rule is already registered under this id.
    #[error("fault id already in use: {0}")]
    DuplicateId(String),
}

impl ControlApiError {
    /// HTTP status code this error should be reported with.
    pub fn status_code(&self) -> u16 {
        match self {
            ControlApiError::NotFound(_) => 404,
            _ => 400,
        }
    }
}
