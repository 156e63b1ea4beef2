//! Runtime configuration for sessions and servers.

use std::net::SocketAddr;
use std::time::Duration;

use hubpack::CodecOptions;
use serde::Deserialize;

use crate::transport::DEFAULT_MAX_FRAME_LEN;

#[derive(Debug)]
pub enum Error {
    Parse(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Limits for one duplex session.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Awaited calls allowed in flight before new ones are refused.
    pub max_pending: usize,
    /// How long a closing session waits for in-flight work to drain.
    pub close_timeout_ms: u64,
    pub max_frame_len: usize,
}

impl SessionConfig {
    pub fn standard() -> Self {
        Self {
            max_pending: 4096,
            close_timeout_ms: 5_000,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout_ms = timeout.as_millis() as u64;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::standard()
    }
}

/// Listener addresses and defaults for a hub server.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Where the HTTP binder listens, if enabled.
    pub http_addr: Option<SocketAddr>,
    /// Where the framed binder listens, if enabled.
    pub frame_addr: Option<SocketAddr>,
    pub codec: CodecOptions,
    /// Limits for every hub session the server accepts.
    pub session: SessionConfig,
}

impl ServerConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Parse(e.to_string()))
    }
}
