//! # Status Codes and Faults
//!
//! A `Fault` is the only error shape that crosses the wire. It carries a coarse
//! `Status` a caller can branch on, and a human-readable detail string.

use serde::Deserialize;
use serde::Serialize;

/// Outcome classes for a failed call.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl Status {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        let status = match code {
            1 => Self::Cancelled,
            2 => Self::Unknown,
            3 => Self::InvalidArgument,
            4 => Self::DeadlineExceeded,
            5 => Self::NotFound,
            6 => Self::AlreadyExists,
            7 => Self::PermissionDenied,
            8 => Self::ResourceExhausted,
            9 => Self::FailedPrecondition,
            10 => Self::Aborted,
            11 => Self::OutOfRange,
            12 => Self::Unimplemented,
            13 => Self::Internal,
            14 => Self::Unavailable,
            15 => Self::DataLoss,
            16 => Self::Unauthenticated,
            _ => return None,
        };
        Some(status)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
            Self::InvalidArgument => "invalid_argument",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::PermissionDenied => "permission_denied",
            Self::ResourceExhausted => "resource_exhausted",
            Self::FailedPrecondition => "failed_precondition",
            Self::Aborted => "aborted",
            Self::OutOfRange => "out_of_range",
            Self::Unimplemented => "unimplemented",
            Self::Internal => "internal",
            Self::Unavailable => "unavailable",
            Self::DataLoss => "data_loss",
            Self::Unauthenticated => "unauthenticated",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured remote failure.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fault {
    pub status: Status,
    pub detail: String,
}

impl Fault {
    pub fn new(status: Status, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    /// Flattens an error that is not a `Fault` into one.
    ///
    /// Only the type name and message are kept. No backtrace reaches the wire.
    pub fn internal(type_name: &str, message: impl std::fmt::Display) -> Self {
        Self::new(Status::Internal, format!("{}: {}", type_name, message))
    }

    pub fn invalid_argument(detail: impl Into<String>) -> Self {
        Self::new(Status::InvalidArgument, detail)
    }

    pub fn unimplemented(detail: impl Into<String>) -> Self {
        Self::new(Status::Unimplemented, detail)
    }

    pub fn session_closing() -> Self {
        Self::new(Status::Unavailable, "session closing")
    }

    pub fn session_closed() -> Self {
        Self::new(Status::Unavailable, "session closed")
    }

    pub fn timeout() -> Self {
        Self::new(Status::DeadlineExceeded, "call timed out")
    }

    pub fn cancelled() -> Self {
        Self::new(Status::Cancelled, "call cancelled")
    }

    pub fn is_session_closed(&self) -> bool {
        *self == Self::session_closed()
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.status, self.detail)
    }
}

impl std::error::Error for Fault {}
