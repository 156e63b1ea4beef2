//! # Hubpack
//!
//! Typed payload codec for hub calls and sessions.
//!
//! ## Philosophy
//!
//! - **Pluggable Encoding**: One `Codec` value decides the wire bytes. Swapping the
//!   encoding never changes the shape of the values that flow through a call.
//! - **Stateless**: A `Codec` is `Copy`. Sharing one across tasks needs no locking.
//! - **Nil Is Nothing**: The `Nil` sentinel encodes to zero bytes and decodes without
//!   looking at the buffer, so "no payload" costs nothing in either encoding.
//!
//! ## Encodings
//!
//! - **Binary**: `postcard`, compact and schema-driven.
//! - **Text**: `serde_json`, optionally pretty-printed.

use std::any::Any;
use std::any::TypeId;

use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;


/// Upper bound applied to a single payload unless configured otherwise.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Codec failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The binary encoder or decoder rejected the value or the bytes.
    Binary(String),
    /// The text encoder or decoder rejected the value or the bytes.
    Text(String),
    /// The payload is larger than the configured limit.
    PayloadTooLarge { len: usize, max: usize },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Binary(msg) => write!(f, "Binary codec error: {}", msg),
            Self::Text(msg) => write!(f, "Text codec error: {}", msg),
            Self::PayloadTooLarge { len, max } => {
                write!(f, "Payload of {} bytes exceeds limit of {} bytes", len, max)
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<postcard::Error> for Error {
    fn from(e: postcard::Error) -> Self {
        Self::Binary(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Text(e.to_string())
    }
}

/// Specialized `Result` for codec operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The "no payload" type.
///
/// Methods that take or return nothing declare `Nil`. It occupies zero bytes on the
/// wire under every encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Nil;

/// Returns true when `T` is the `Nil` sentinel.
pub fn is_nil<T: 'static>() -> bool {
    TypeId::of::<T>() == TypeId::of::<Nil>()
}

/// Wire encoding selected by a codec.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// Packed binary (`postcard`).
    #[default]
    Binary,
    /// Textual (`serde_json`).
    Text,
}

impl Encoding {
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Binary => "application/x-postcard",
            Self::Text => "application/json",
        }
    }
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Binary => write!(f, "binary"),
            Self::Text => write!(f, "text"),
        }
    }
}

/// Codec configuration, as read from a config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecOptions {
    pub encoding: Encoding,
    /// Pretty-print text output. Ignored by the binary encoding.
    pub pretty: bool,
    pub max_payload: usize,
}

impl Default for CodecOptions {
    fn default() -> Self {
        Self {
            encoding: Encoding::Binary,
            pretty: false,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

/// Converts typed values to bytes and back for one encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Codec {
    options: CodecOptions,
}

impl Codec {
    pub fn new(encoding: Encoding) -> Self {
        Self::with_options(CodecOptions {
            encoding,
            ..CodecOptions::default()
        })
    }

    pub fn with_options(options: CodecOptions) -> Self {
        Self { options }
    }

    pub fn binary() -> Self {
        Self::new(Encoding::Binary)
    }

    pub fn text() -> Self {
        Self::new(Encoding::Text)
    }

    pub fn pretty(mut self, pretty: bool) -> Self {
        self.options.pretty = pretty;
        self
    }

    pub fn max_payload(mut self, max: usize) -> Self {
        self.options.max_payload = max;
        self
    }

    pub fn encoding(&self) -> Encoding {
        self.options.encoding
    }

    pub fn options(&self) -> CodecOptions {
        self.options
    }

    pub fn content_type(&self) -> &'static str {
        self.options.encoding.content_type()
    }

    /// Encodes `value` into a fresh buffer.
    pub fn encode<T: Serialize + 'static>(&self, value: &T) -> Result<Vec<u8>> {
        if is_nil::<T>() {
            return Ok(Vec::new());
        }

        let bytes = match self.options.encoding {
            Encoding::Binary => postcard::to_allocvec(value)?,
            Encoding::Text if self.options.pretty => serde_json::to_vec_pretty(value)?,
            Encoding::Text => serde_json::to_vec(value)?,
        };

        self.check_len(bytes.len())?;
        Ok(bytes)
    }

    /// Decodes a `T` from `bytes`.
    ///
    /// Decoding `Nil` never inspects the buffer.
    pub fn decode<T: DeserializeOwned + 'static>(&self, bytes: &[u8]) -> Result<T> {
        if is_nil::<T>() {
            let nil: Box<dyn Any> = Box::new(Nil);
            if let Ok(value) = nil.downcast::<T>() {
                return Ok(*value);
            }
        }

        self.check_len(bytes.len())?;

        match self.options.encoding {
            Encoding::Binary => Ok(postcard::from_bytes(bytes)?),
            Encoding::Text => Ok(serde_json::from_slice(bytes)?),
        }
    }

    fn check_len(&self, len: usize) -> Result<()> {
        let max = self.options.max_payload;
        if len > max {
            return Err(Error::PayloadTooLarge { len, max });
        }
        Ok(())
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::with_options(CodecOptions::default())
    }
}

impl From<CodecOptions> for Codec {
    fn from(options: CodecOptions) -> Self {
        Self::with_options(options)
    }
}
