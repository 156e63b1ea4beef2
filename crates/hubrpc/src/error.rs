//! # Error Definitions
//!
//! Failures of the framing layer itself. Remote failures travel as `Fault`s instead.

/// Operational failures while packing or unpacking frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The envelope bytes could not be encoded or decoded.
    Codec(hubpack::Error),
    /// A well-formed frame arrived where the protocol expects another kind.
    UnexpectedFrame { expected: &'static str, found: &'static str },
    /// The peer speaks a protocol revision this build does not understand.
    VersionMismatch { local: u16, remote: u16 },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Codec(e) => write!(f, "Frame codec error: {}", e),
            Self::UnexpectedFrame { expected, found } => {
                write!(f, "Unexpected frame: expected {}, found {}", expected, found)
            }
            Self::VersionMismatch { local, remote } => {
                write!(f, "Protocol version mismatch: local {}, remote {}", local, remote)
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<hubpack::Error> for Error {
    fn from(e: hubpack::Error) -> Self {
        Self::Codec(e)
    }
}

/// A specialized Result type for framing operations.
pub type Result<T> = std::result::Result<T, Error>;
