//! Error codes and Result alias.
//!
//! Every fallible operation in the crate returns [`Result`]. An [`Error`]
//! carries an [`ErrorCode`] plus an optional human-readable message; the
//! code is the stable, public part.

use std::fmt;
use std::io;

// ============================================================================
// Error Codes
// ============================================================================

/// Public error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    /// Operation completed
    Ok = 0,
    /// Key size does not fit the database configuration
    InvalidKeysize = -3,
    /// Page size is not a power of two, not a multiple of 512, or too small
    InvalidPagesize = -4,
    /// A function parameter is out of range or inconsistent
    InvalidParameter = -8,
    /// The file is not a database file
    InvalidFileHeader = -9,
    /// The file was created by an incompatible library version
    InvalidFileVersion = -10,
    /// Key was not found
    KeyNotFound = -11,
    /// Key already exists and neither OVERWRITE nor DUPLICATE was set
    DuplicateKey = -12,
    /// A structural invariant of the database is violated
    IntegrityViolated = -13,
    /// Unexpected internal state
    InternalError = -14,
    /// Database or environment was opened read-only
    ReadOnly = -15,
    /// A blob id did not resolve to a blob header
    BlobNotFound = -16,
    /// The prefix comparator requested the full key
    PrefixRequestFullkey = -17,
    /// A device read or write failed
    IoError = -18,
    /// The cache is full and strict mode forbids growth
    CacheFull = -19,
    /// The requested feature is not compiled in or not supported
    NotImplemented = -20,
    /// File does not exist
    FileNotFound = -21,
    /// A lock or a transaction slot is held by somebody else
    WouldBlock = -22,
    /// The object is not initialized or was shut down after corruption
    NotReady = -23,
    /// An OS or file-format limit was hit
    LimitsReached = -24,
    /// The OS denied access
    AccessDenied = -25,
    /// The object was initialized twice
    AlreadyInitialized = -27,
    /// The log contains uncommitted changes; reopen with AUTO_RECOVERY
    NeedRecovery = -28,
    /// A transaction cannot commit while cursors are attached to it
    CursorStillOpen = -29,
    /// The configured key size is too small for the page layout
    KeysizeTooSmall = -30,
    /// The configured record size is too small
    RecordsizeTooSmall = -31,
    /// Reserved for the remote protocol
    NetworkError = -32,
}

impl ErrorCode {
    /// Short, stable description of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Ok => "success",
            ErrorCode::InvalidKeysize => "invalid key size",
            ErrorCode::InvalidPagesize => "invalid page size",
            ErrorCode::InvalidParameter => "invalid parameter",
            ErrorCode::InvalidFileHeader => "invalid database file header",
            ErrorCode::InvalidFileVersion => "invalid database file version",
            ErrorCode::KeyNotFound => "key not found",
            ErrorCode::DuplicateKey => "duplicate key",
            ErrorCode::IntegrityViolated => "internal integrity violated",
            ErrorCode::InternalError => "internal error",
            ErrorCode::ReadOnly => "database opened in read-only mode",
            ErrorCode::BlobNotFound => "data blob not found",
            ErrorCode::PrefixRequestFullkey => "prefix comparison requested full key",
            ErrorCode::IoError => "system I/O error",
            ErrorCode::CacheFull => "database cache is full",
            ErrorCode::NotImplemented => "not implemented",
            ErrorCode::FileNotFound => "file not found",
            ErrorCode::WouldBlock => "operation would block",
            ErrorCode::NotReady => "object was not initialized correctly",
            ErrorCode::LimitsReached => "database limits reached",
            ErrorCode::AccessDenied => "access denied",
            ErrorCode::AlreadyInitialized => "object was already initialized",
            ErrorCode::NeedRecovery => "database needs recovery",
            ErrorCode::CursorStillOpen => "cursor must be closed first",
            ErrorCode::KeysizeTooSmall => "configured key size is too small",
            ErrorCode::RecordsizeTooSmall => "configured record size is too small",
            ErrorCode::NetworkError => "remote I/O error",
        }
    }
}

// ============================================================================
// Error
// ============================================================================

/// An error with an [`ErrorCode`] and an optional message.
#[derive(Debug, Clone)]
pub struct Error {
    code: ErrorCode,
    message: Option<String>,
}

impl Error {
    /// Create an error from a bare code.
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            message: None,
        }
    }

    /// Create an error carrying an additional message.
    pub fn with_message<S: Into<String>>(code: ErrorCode, message: S) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    /// The error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{}: {}", self.code.as_str(), msg),
            None => f.write_str(self.code.as_str()),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        let code = match e.kind() {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::PermissionDenied => ErrorCode::AccessDenied,
            io::ErrorKind::WouldBlock => ErrorCode::WouldBlock,
            io::ErrorKind::AlreadyExists => ErrorCode::AlreadyInitialized,
            _ => ErrorCode::IoError,
        };
        Error::with_message(code, e.to_string())
    }
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_with_and_without_message() {
        let e = Error::new(ErrorCode::KeyNotFound);
        assert_eq!(e.to_string(), "key not found");

        let e = Error::with_message(ErrorCode::IoError, "pread failed");
        assert_eq!(e.to_string(), "system I/O error: pread failed");
    }

    #[test]
    fn test_io_error_mapping() {
        let e: Error = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert_eq!(e.code(), ErrorCode::FileNotFound);

        let e: Error = io::Error::new(io::ErrorKind::PermissionDenied, "no").into();
        assert_eq!(e.code(), ErrorCode::AccessDenied);

        let e: Error = io::Error::new(io::ErrorKind::Other, "misc").into();
        assert_eq!(e.code(), ErrorCode::IoError);
    }
}
