//! # Call Contexts
//!
//! One context value travels down a filter chain and back up again. There are two
//! shapes:
//!
//! - `CallContext`: one call on a binder (unary, streaming, or the session-connect
//!   handshake). Carries the transport's native call object.
//! - `HubContext`: one hub-method invocation inside an open session.
//!
//! Request and response slots are type-erased so filters can be written once for any
//! payload type. Filters that want to share state with each other use the typed item
//! bag, keyed by type.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use hubpack::Codec;
use hubrpc::MethodId;

use crate::descriptor::MethodDescriptor;
use crate::session::DuplexSession;

type Items = anymap::Map<dyn anymap::any::Any + Send + Sync>;

/// A single type-erased value.
#[derive(Default)]
struct Slot(Option<Box<dyn Any + Send>>);

impl Slot {
    fn set<T: Send + 'static>(&mut self, value: T) {
        self.0 = Some(Box::new(value));
    }

    fn get<T: 'static>(&self) -> Option<&T> {
        self.0.as_ref()?.downcast_ref::<T>()
    }

    fn get_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.0.as_mut()?.downcast_mut::<T>()
    }

    fn take<T: 'static>(&mut self) -> Option<T> {
        let boxed = self.0.take()?;
        match boxed.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(boxed) => {
                self.0 = Some(boxed);
                None
            }
        }
    }

    fn is_set(&self) -> bool {
        self.0.is_some()
    }
}

/// Per-call state for a method bound on a transport.
pub struct CallContext {
    descriptor: Arc<MethodDescriptor>,
    codec: Codec,
    request: Slot,
    response: Slot,
    native: Slot,
    items: Items,
    started: Instant,
}

impl CallContext {
    pub fn new(descriptor: Arc<MethodDescriptor>, codec: Codec) -> Self {
        Self {
            descriptor,
            codec,
            request: Slot::default(),
            response: Slot::default(),
            native: Slot::default(),
            items: anymap::Map::new(),
            started: Instant::now(),
        }
    }

    /// Attaches the transport's own representation of the call.
    pub fn with_native<T: Send + 'static>(mut self, native: T) -> Self {
        self.native.set(native);
        self
    }

    pub fn descriptor(&self) -> &MethodDescriptor {
        &self.descriptor
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// The transport's native call object, if it is a `T`.
    pub fn native<T: 'static>(&self) -> Option<&T> {
        self.native.get::<T>()
    }

    pub fn request<T: 'static>(&self) -> Option<&T> {
        self.request.get::<T>()
    }

    pub fn request_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.request.get_mut::<T>()
    }

    pub fn set_request<T: Send + 'static>(&mut self, request: T) {
        self.request.set(request);
    }

    pub fn take_request<T: 'static>(&mut self) -> Option<T> {
        self.request.take::<T>()
    }

    pub fn response<T: 'static>(&self) -> Option<&T> {
        self.response.get::<T>()
    }

    pub fn response_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.response.get_mut::<T>()
    }

    pub fn set_response<T: Send + 'static>(&mut self, response: T) {
        self.response.set(response);
    }

    pub fn take_response<T: 'static>(&mut self) -> Option<T> {
        self.response.take::<T>()
    }

    pub fn has_response(&self) -> bool {
        self.response.is_set()
    }

    pub fn insert<T: Send + Sync + 'static>(&mut self, val: T) {
        self.items.insert(val);
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.items.get::<T>()
    }

    pub fn get_mut<T: Send + Sync + 'static>(&mut self) -> Option<&mut T> {
        self.items.get_mut::<T>()
    }

    pub fn remove<T: Send + Sync + 'static>(&mut self) -> Option<T> {
        self.items.remove::<T>()
    }
}

/// Per-invocation state for a hub method running inside a session.
pub struct HubContext {
    session: DuplexSession,
    method_id: MethodId,
    method: Arc<str>,
    request: Slot,
    response: Slot,
    items: Items,
    started: Instant,
}

impl HubContext {
    pub fn new(session: DuplexSession, method_id: MethodId, method: Arc<str>) -> Self {
        Self {
            session,
            method_id,
            method,
            request: Slot::default(),
            response: Slot::default(),
            items: anymap::Map::new(),
            started: Instant::now(),
        }
    }

    /// The session this invocation arrived on.
    pub fn session(&self) -> &DuplexSession {
        &self.session
    }

    pub fn method_id(&self) -> MethodId {
        self.method_id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn request<T: 'static>(&self) -> Option<&T> {
        self.request.get::<T>()
    }

    pub fn request_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.request.get_mut::<T>()
    }

    pub fn set_request<T: Send + 'static>(&mut self, request: T) {
        self.request.set(request);
    }

    pub fn take_request<T: 'static>(&mut self) -> Option<T> {
        self.request.take::<T>()
    }

    pub fn response<T: 'static>(&self) -> Option<&T> {
        self.response.get::<T>()
    }

    pub fn set_response<T: Send + 'static>(&mut self, response: T) {
        self.response.set(response);
    }

    pub fn take_response<T: 'static>(&mut self) -> Option<T> {
        self.response.take::<T>()
    }

    pub fn insert<T: Send + Sync + 'static>(&mut self, val: T) {
        self.items.insert(val);
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.items.get::<T>()
    }

    pub fn get_mut<T: Send + Sync + 'static>(&mut self) -> Option<&mut T> {
        self.items.get_mut::<T>()
    }

    pub fn remove<T: Send + Sync + 'static>(&mut self) -> Option<T> {
        self.items.remove::<T>()
    }
}
