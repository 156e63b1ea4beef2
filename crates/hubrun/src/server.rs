//! # Hub Server
//!
//! Runs the shipped binders from a `ServerConfig`: every method on the framed
//! listener, unary methods also on the HTTP listener.
//!
//! `ServerConfig::session` governs every hub session served, in place of the
//! hub's own `HubBuilder::config`.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;

use hubpack::Codec;

use crate::bind;
use crate::bind::Binder;
use crate::bind::BoundMethod;
use crate::bind::frame::FrameBinder;
use crate::bind::frame::FrameServer;
use crate::bind::http::HttpBinder;
use crate::config::ServerConfig;
use crate::hub::HubDefinition;
use crate::method::ServiceDefinition;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    Bind(bind::Error),
    Io(String),
    /// Neither listener address is configured.
    NothingToServe,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bind(e) => write!(f, "Bind error: {}", e),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
            Self::NothingToServe => write!(f, "No listener address configured"),
        }
    }
}

impl std::error::Error for Error {}

impl From<bind::Error> for Error {
    fn from(e: bind::Error) -> Self {
        Self::Bind(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub struct Server {
    config: ServerConfig,
    methods: Vec<BoundMethod>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            methods: Vec::new(),
        }
    }

    pub fn service(mut self, service: &ServiceDefinition) -> Self {
        self.methods.extend(service.methods().iter().cloned());
        self
    }

    pub fn hub(mut self, hub: &Arc<HubDefinition>) -> Self {
        self.methods.push(hub.bound());
        self
    }

    /// Binds every route and opens the configured listeners.
    pub async fn listen(self) -> Result<Listening> {
        let config = self.config;
        if config.http_addr.is_none() && config.frame_addr.is_none() {
            return Err(Error::NothingToServe);
        }

        let frame = match config.frame_addr {
            Some(addr) => {
                let mut binder = FrameBinder::new(Codec::from(config.codec))
                    .max_frame_len(config.session.max_frame_len)
                    .session_config(config.session.clone());
                bind::bind_all(&mut binder, &self.methods)?;
                Some((binder.into_server(), TcpListener::bind(addr).await?))
            }
            None => None,
        };

        let http = match config.http_addr {
            Some(addr) => {
                let codec = Codec::text().max_payload(config.codec.max_payload);
                let mut binder = HttpBinder::new(codec);
                for method in &self.methods {
                    if !binder.supports(method.kind()) {
                        tracing::debug!(method = %method.descriptor(), "not served over http");
                        continue;
                    }
                    binder.bind(method)?;
                }
                Some((binder, TcpListener::bind(addr).await?))
            }
            None => None,
        };

        Ok(Listening { frame, http })
    }
}

/// Listeners bound and routes registered; nothing accepted yet.
pub struct Listening {
    frame: Option<(FrameServer, TcpListener)>,
    http: Option<(HttpBinder, TcpListener)>,
}

impl Listening {
    pub fn frame_addr(&self) -> Option<SocketAddr> {
        self.frame.as_ref().and_then(|(_, l)| l.local_addr().ok())
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http.as_ref().and_then(|(_, l)| l.local_addr().ok())
    }

    /// Serves until a listener fails.
    pub async fn run(self) -> Result<()> {
        let Listening { frame, http } = self;
        let frame = async move {
            match frame {
                Some((server, listener)) => server.serve(listener).await,
                None => Ok(()),
            }
        };
        let http = async move {
            match http {
                Some((binder, listener)) => binder.serve(listener).await,
                None => Ok(()),
            }
        };
        tokio::try_join!(frame, http)?;
        Ok(())
    }
}
