//! Status codes and error types.

use core::fmt;
use std::io;

/// Binder status codes.
///
/// These travel on the wire inside replies, so the discriminants are fixed.
/// Negative errno values line up with the kernel's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum StatusCode {
    Ok = 0,
    UnknownError = i32::MIN,
    BadType = i32::MIN + 1,
    FailedTransaction = i32::MIN + 2,
    FdsNotAllowed = i32::MIN + 7,
    UnexpectedNull = i32::MIN + 8,
    BadObject = i32::MIN + 9,

    PermissionDenied = -1,
    NameNotFound = -2,
    WouldBlock = -11,
    NoMemory = -12,
    AlreadyExists = -17,
    NoInit = -19,
    BadValue = -22,
    DeadObject = -32,
    InvalidOperation = -38,
    NotEnoughData = -61,
    UnknownTransaction = -74,
    BadIndex = -75,
    TimedOut = -110,
}

impl StatusCode {
    pub fn from_i32(value: i32) -> Option<Self> {
        let code = match value {
            0 => Self::Ok,
            v if v == i32::MIN => Self::UnknownError,
            v if v == i32::MIN + 1 => Self::BadType,
            v if v == i32::MIN + 2 => Self::FailedTransaction,
            v if v == i32::MIN + 7 => Self::FdsNotAllowed,
            v if v == i32::MIN + 8 => Self::UnexpectedNull,
            v if v == i32::MIN + 9 => Self::BadObject,
            -1 => Self::PermissionDenied,
            -2 => Self::NameNotFound,
            -11 => Self::WouldBlock,
            -12 => Self::NoMemory,
            -17 => Self::AlreadyExists,
            -19 => Self::NoInit,
            -22 => Self::BadValue,
            -32 => Self::DeadObject,
            -38 => Self::InvalidOperation,
            -61 => Self::NotEnoughData,
            -74 => Self::UnknownTransaction,
            -75 => Self::BadIndex,
            -110 => Self::TimedOut,
            _ => return None,
        };
        Some(code)
    }

    /// Decode a status from the wire, folding unknown values into `UnknownError`.
    pub fn from_wire(value: i32) -> Self {
        Self::from_i32(value).unwrap_or(Self::UnknownError)
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::UnknownError => write!(f, "unknown error"),
            Self::BadType => write!(f, "bad type"),
            Self::FailedTransaction => write!(f, "failed transaction"),
            Self::FdsNotAllowed => write!(f, "file descriptors not allowed"),
            Self::UnexpectedNull => write!(f, "unexpected null"),
            Self::BadObject => write!(f, "bad object"),
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::NameNotFound => write!(f, "name not found"),
            Self::WouldBlock => write!(f, "would block"),
            Self::NoMemory => write!(f, "no memory"),
            Self::AlreadyExists => write!(f, "already exists"),
            Self::NoInit => write!(f, "not initialized"),
            Self::BadValue => write!(f, "bad value"),
            Self::DeadObject => write!(f, "dead object"),
            Self::InvalidOperation => write!(f, "invalid operation"),
            Self::NotEnoughData => write!(f, "not enough data"),
            Self::UnknownTransaction => write!(f, "unknown transaction"),
            Self::BadIndex => write!(f, "bad index"),
            Self::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Errors produced by transports, sessions and servers.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The peer went away, or the operation was cancelled by a trigger.
    #[error("dead object")]
    DeadObject,
    #[error("operation would block")]
    WouldBlock,
    #[error("malformed data: {0}")]
    Malformed(String),
    #[error("bad value: {0}")]
    BadValue(String),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("no session with id {0}")]
    UnknownSession(String),
    #[error("unsupported protocol version {version} (supported {min}..={max})")]
    UnsupportedVersion { version: u32, min: u32, max: u32 },
    #[error("file descriptors are not allowed on this session")]
    FdsNotAllowed,
    #[error("too many file descriptors: {count} (max {max})")]
    TooManyFds { count: usize, max: usize },
    #[error("no object at address {address:#x}")]
    BadObject { address: u64 },
    /// The remote side answered with a non-OK status.
    #[error("remote returned {0}")]
    Status(StatusCode),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
}

pub type Result<T, E = RpcError> = std::result::Result<T, E>;

impl RpcError {
    /// Map this error onto the status carried in a reply.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::DeadObject => StatusCode::DeadObject,
            Self::WouldBlock => StatusCode::WouldBlock,
            Self::Malformed(_) => StatusCode::BadValue,
            Self::BadValue(_) => StatusCode::BadValue,
            Self::InvalidOperation(_) => StatusCode::InvalidOperation,
            Self::UnknownSession(_) => StatusCode::NameNotFound,
            Self::UnsupportedVersion { .. } => StatusCode::BadValue,
            Self::FdsNotAllowed => StatusCode::FdsNotAllowed,
            Self::TooManyFds { .. } => StatusCode::BadValue,
            Self::BadObject { .. } => StatusCode::BadObject,
            Self::Status(code) => *code,
            Self::Io(e) => match e.kind() {
                io::ErrorKind::BrokenPipe
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::NotConnected => StatusCode::DeadObject,
                io::ErrorKind::WouldBlock => StatusCode::WouldBlock,
                _ => StatusCode::UnknownError,
            },
            Self::Tls(_) => StatusCode::DeadObject,
        }
    }

    pub fn is_dead_object(&self) -> bool {
        self.status() == StatusCode::DeadObject
    }

    /// Build the error a caller sees for a non-OK reply status.
    pub(crate) fn from_status(code: StatusCode) -> Self {
        match code {
            StatusCode::DeadObject => Self::DeadObject,
            other => Self::Status(other),
        }
    }

    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }
}

impl From<StatusCode> for RpcError {
    fn from(code: StatusCode) -> Self {
        Self::from_status(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_survive_the_wire() {
        for code in [
            StatusCode::Ok,
            StatusCode::UnknownError,
            StatusCode::BadObject,
            StatusCode::DeadObject,
            StatusCode::UnknownTransaction,
        ] {
            assert_eq!(StatusCode::from_i32(code.as_i32()), Some(code));
        }
        assert_eq!(StatusCode::from_wire(12345), StatusCode::UnknownError);
    }

    #[test]
    fn broken_pipe_is_dead_object() {
        let err = RpcError::from(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(err.is_dead_object());
        assert!(!RpcError::WouldBlock.is_dead_object());
    }
}
