//! # Method Binders
//!
//! A binder exposes built methods on exactly one wire transport. Binders own their
//! route namespace, so the same method may be bound by several of them at once.
//!
//! ## Invariants
//! - **Fail At Registration**: a binder that cannot carry a method kind rejects it in
//!   `bind`, before anything is served.
//! - **One Completion**: each call writes its response state exactly once.
//! - **Flattened Errors**: only `Fault`s reach the wire. Anything else becomes
//!   `Status::Internal` with the error's type name and message.

pub mod frame;
pub mod http;

use std::sync::Arc;

use hubpack::Encoding;
use hubrpc::Fault;

use crate::descriptor::MethodDescriptor;
use crate::descriptor::MethodKind;
use crate::failure::Failure;
use crate::hub::HubDefinition;
use crate::method::MethodHandler;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The transport cannot carry this kind of method.
    UnsupportedKind {
        transport: &'static str,
        kind: MethodKind,
        method: String,
    },
    /// The route is already taken on this binder.
    DuplicateRoute { transport: &'static str, route: String },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedKind { transport, kind, method } => write!(
                f,
                "Unsupported method kind for this transport: {} cannot bind {} method {}",
                transport, kind, method
            ),
            Self::DuplicateRoute { transport, route } => {
                write!(f, "Route {} is already bound on {}", route, transport)
            }
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// A built method, in the form binders consume.
#[derive(Clone)]
pub enum BoundMethod {
    /// Unary or streaming call.
    Call(Arc<MethodHandler>),
    /// Hub reached through a session-connect handshake.
    Session(Arc<HubDefinition>),
}

impl BoundMethod {
    pub fn descriptor(&self) -> &Arc<MethodDescriptor> {
        match self {
            Self::Call(handler) => handler.descriptor(),
            Self::Session(hub) => hub.descriptor(),
        }
    }

    pub fn kind(&self) -> MethodKind {
        self.descriptor().kind
    }
}

impl From<Arc<HubDefinition>> for BoundMethod {
    fn from(hub: Arc<HubDefinition>) -> Self {
        Self::Session(hub)
    }
}

/// What a successful `bind` registered.
#[derive(Debug, Clone)]
pub struct Registration {
    pub descriptor: Arc<MethodDescriptor>,
    pub route: String,
    pub encoding: Encoding,
}

/// Per-transport adapter from built methods to network entry points.
pub trait Binder {
    /// Short transport name for errors and logs.
    fn transport(&self) -> &'static str;

    fn supports(&self, kind: MethodKind) -> bool;

    /// Registers a live route for `method`.
    fn bind(&mut self, method: &BoundMethod) -> Result<Registration>;

    /// Rejects kinds this binder cannot carry.
    fn check(&self, descriptor: &MethodDescriptor) -> Result<()> {
        if self.supports(descriptor.kind) {
            return Ok(());
        }
        Err(Error::UnsupportedKind {
            transport: self.transport(),
            kind: descriptor.kind,
            method: descriptor.path(),
        })
    }
}

/// Binds every method, or none: all kinds are checked before the first route is added.
pub fn bind_all<B: Binder + ?Sized>(binder: &mut B, methods: &[BoundMethod]) -> Result<Vec<Registration>> {
    for method in methods {
        binder.check(method.descriptor())?;
    }
    methods.iter().map(|method| binder.bind(method)).collect()
}

/// The fault a binder writes for a failed call.
pub(crate) fn wire_fault(descriptor: &MethodDescriptor, failure: Failure) -> Fault {
    if let Failure::Unexpected { type_name, message } = &failure {
        tracing::warn!(method = %descriptor, type_name, message = %message, "call failed unexpectedly");
    }
    failure.into_fault()
}
