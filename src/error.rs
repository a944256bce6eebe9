use std::io;

/// A specialized `Result` type for evio operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for evio operations.
///
/// System-level failures are carried through transparently as [`io::Error`]
/// (the original `errno` stays reachable via [`io::Error::raw_os_error`]);
/// everything else is a library-defined condition. Caller contract
/// violations surface as [`Error::InvalidInput`] immediately and are never
/// logged as critical.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// An argument violated the caller contract.
    #[error("invalid argument")]
    InvalidInput,
    /// A length or offset fell outside the valid range.
    #[error("out of range")]
    OutOfRange,
    /// Fewer bytes are buffered than the operation requires.
    #[error("no data")]
    NoData,
    /// The operation is not permitted in the current state.
    #[error("operation not permitted")]
    NotPermitted,
    /// The supplied buffer is too small for the result.
    #[error("buffer too small")]
    BufferTooSmall,
    /// The operation timed out.
    #[error("timed out")]
    TimedOut,
    /// A configured limit was reached.
    #[error("limit reached")]
    LimitReached,
    /// The entry already exists.
    #[error("duplicate entry")]
    Duplicate,
    /// The entry was not found.
    #[error("not found")]
    NotFound,
    /// The operation is not supported on this platform or backend.
    #[error("not supported")]
    Unsupported,
    /// The connection is not in a connected state.
    #[error("not connected")]
    NotConnected,
    /// The operation is already in progress.
    #[error("operation in progress")]
    InProgress,
    /// The component is not running.
    #[error("not running")]
    NotRunning,
    /// The input was malformed.
    #[error("format error")]
    Format,
    /// An operating system error.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Returns the OS error code if this is an [`Error::Io`] carrying one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Io(err) => err.raw_os_error(),
            _ => None,
        }
    }
}

impl From<io::ErrorKind> for Error {
    fn from(kind: io::ErrorKind) -> Error {
        Error::Io(kind.into())
    }
}
