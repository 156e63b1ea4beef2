//! # Hubs
//!
//! A hub is a service whose methods are invoked over a duplex session. Clients
//! connect through a `SessionConnect` method bound like any other; once the
//! handshake passes the connect filter chain, the connection becomes a
//! `DuplexSession` that dispatches inbound requests by `MethodId`.
//!
//! ## Invariants
//! - **Static Dispatch Table**: the `MethodId -> method` map is built once and never
//!   changes while sessions run.
//! - **Two Chains**: the connect handshake runs through the call-shaped chain;
//!   each hub method runs through its own session-shaped chain.
//! - **Membership Follows Liveness**: a closed session leaves every group.

use std::collections::HashMap;
use std::collections::HashSet;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;

use hubpack::Codec;
use hubpack::Nil;
use hubrpc::Fault;
use hubrpc::MethodId;
use hubrpc::Status;

use crate::bind::BoundMethod;
use crate::config::SessionConfig;
use crate::context::CallContext;
use crate::context::HubContext;
use crate::descriptor::MethodDescriptor;
use crate::descriptor::MethodKind;
use crate::failure::Failure;
use crate::filter;
use crate::filter::Endpoint;
use crate::filter::FilterDescriptor;
use crate::filter::InstanceResolver;
use crate::filter::Pipeline;
use crate::session::DuplexSession;
use crate::session::SessionBuilder;
use crate::session::SessionId;
use crate::session::SessionState;
use crate::transport::Transport;

/// Method name of the handshake route every hub exposes.
pub const CONNECT_METHOD: &str = "Connect";

#[derive(Debug, Clone)]
pub enum Error {
    DuplicateMethod { hub: String, method_id: MethodId },
    UnknownMethod { hub: String, method_id: MethodId },
    Filter(filter::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateMethod { hub, method_id } => {
                write!(f, "Hub {} registers method {} twice", hub, method_id)
            }
            Self::UnknownMethod { hub, method_id } => {
                write!(f, "Filters attached to unknown method {} of hub {}", method_id, hub)
            }
            Self::Filter(e) => write!(f, "Filter error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<filter::Error> for Error {
    fn from(e: filter::Error) -> Self {
        Self::Filter(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

trait HubMarshal: Send + Sync {
    fn decode_request(&self, ctx: &mut HubContext, bytes: &[u8]) -> std::result::Result<(), Failure>;
    fn encode_response(&self, ctx: &mut HubContext) -> std::result::Result<Vec<u8>, Failure>;
}

struct Typed<Req, Resp>(PhantomData<fn(Req) -> Resp>);

impl<Req, Resp> HubMarshal for Typed<Req, Resp>
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    fn decode_request(&self, ctx: &mut HubContext, bytes: &[u8]) -> std::result::Result<(), Failure> {
        let request: Req = ctx
            .session()
            .codec()
            .decode(bytes)
            .map_err(|e| Failure::Fault(Fault::invalid_argument(format!("malformed request: {}", e))))?;
        ctx.set_request(request);
        Ok(())
    }

    fn encode_response(&self, ctx: &mut HubContext) -> std::result::Result<Vec<u8>, Failure> {
        let response = ctx
            .take_response::<Resp>()
            .ok_or_else(|| Failure::new(Status::Internal, "hub method produced no response"))?;
        Ok(ctx.session().codec().encode(&response)?)
    }
}

type HubFn<Req, Resp> =
    Box<dyn Fn(DuplexSession, Req) -> BoxFuture<'static, std::result::Result<Resp, Failure>> + Send + Sync>;

struct HubEndpoint<Req, Resp>(HubFn<Req, Resp>);

#[async_trait]
impl<Req, Resp> Endpoint<HubContext> for HubEndpoint<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    async fn call(&self, ctx: &mut HubContext) -> std::result::Result<(), Failure> {
        let request = ctx
            .take_request::<Req>()
            .ok_or_else(|| Failure::new(Status::Internal, "request missing from hub context"))?;
        let response = (self.0)(ctx.session().clone(), request).await?;
        ctx.set_response(response);
        Ok(())
    }
}

/// The handshake body: accepting is all it does. Filters decide whether it runs.
struct ConnectEndpoint;

#[async_trait]
impl Endpoint<CallContext> for ConnectEndpoint {
    async fn call(&self, ctx: &mut CallContext) -> std::result::Result<(), Failure> {
        ctx.set_response(Nil);
        Ok(())
    }
}

/// One dispatchable hub method.
pub(crate) struct HubMethod {
    name: Arc<str>,
    pipeline: Pipeline<HubContext>,
    marshal: Box<dyn HubMarshal>,
}

impl HubMethod {
    pub(crate) fn name(&self) -> Arc<str> {
        self.name.clone()
    }

    pub(crate) fn decode_request(&self, ctx: &mut HubContext, bytes: &[u8]) -> std::result::Result<(), Failure> {
        self.marshal.decode_request(ctx, bytes)
    }

    pub(crate) async fn invoke(&self, ctx: &mut HubContext) -> std::result::Result<(), Failure> {
        self.pipeline.invoke(ctx).await
    }

    pub(crate) fn encode_response(&self, ctx: &mut HubContext) -> std::result::Result<Vec<u8>, Failure> {
        self.marshal.encode_response(ctx)
    }
}

type SessionHook = Arc<dyn Fn(DuplexSession) -> BoxFuture<'static, ()> + Send + Sync>;

/// What a server session needs at runtime: methods, groups, lifecycle hooks.
pub(crate) struct HubDispatch {
    name: String,
    methods: HashMap<MethodId, Arc<HubMethod>>,
    groups: Groups,
    on_connect: Option<SessionHook>,
    on_disconnect: Option<SessionHook>,
}

impl HubDispatch {
    pub(crate) fn method(&self, method_id: MethodId) -> Option<Arc<HubMethod>> {
        self.methods.get(&method_id).cloned()
    }

    pub(crate) fn groups(&self) -> &Groups {
        &self.groups
    }

    pub(crate) fn disconnected(&self, session: DuplexSession) {
        self.groups.leave_all(session.id());
        if let Some(hook) = &self.on_disconnect {
            tokio::spawn(hook(session));
        }
    }
}

struct Registration {
    method_id: MethodId,
    name: String,
    endpoint: Arc<dyn Endpoint<HubContext>>,
    marshal: Box<dyn HubMarshal>,
}

/// Fluent builder for a hub.
pub struct HubBuilder {
    name: String,
    filters: Vec<FilterDescriptor>,
    method_filters: HashMap<MethodId, Vec<FilterDescriptor>>,
    methods: Vec<Registration>,
    on_connect: Option<SessionHook>,
    on_disconnect: Option<SessionHook>,
    config: SessionConfig,
}

impl HubBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filters: Vec::new(),
            method_filters: HashMap::new(),
            methods: Vec::new(),
            on_connect: None,
            on_disconnect: None,
            config: SessionConfig::standard(),
        }
    }

    /// Attaches a filter to the hub.
    ///
    /// Call-shaped filters wrap the connect handshake; session-shaped filters wrap
    /// every hub method.
    pub fn filter(mut self, descriptor: FilterDescriptor) -> Self {
        self.filters.push(descriptor);
        self
    }

    pub fn method_filter(mut self, method_id: MethodId, descriptor: FilterDescriptor) -> Self {
        self.method_filters.entry(method_id).or_default().push(descriptor);
        self
    }

    /// Session limits when the hub is bound directly. A `Server` applies its own.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers a hub method. The handler receives the session it was called on.
    pub fn method<Req, Resp, F, Fut>(mut self, method_id: MethodId, name: impl Into<String>, handler: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(DuplexSession, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Resp, Failure>> + Send + 'static,
    {
        let body: HubFn<Req, Resp> = Box::new(move |session, req| handler(session, req).boxed());
        self.methods.push(Registration {
            method_id,
            name: name.into(),
            endpoint: Arc::new(HubEndpoint(body)),
            marshal: Box::new(Typed::<Req, Resp>(PhantomData)),
        });
        self
    }

    /// Runs once a session is open. Requests that arrive meanwhile wait for it to
    /// return. A panicking hook closes the session.
    pub fn on_connect<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(DuplexSession) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_connect = Some(Arc::new(move |session| hook(session).boxed()));
        self
    }

    /// Runs once a session is closed.
    pub fn on_disconnect<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(DuplexSession) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_disconnect = Some(Arc::new(move |session| hook(session).boxed()));
        self
    }

    pub fn build(mut self, resolver: &dyn InstanceResolver) -> Result<HubDefinition> {
        let mut seen = HashSet::with_capacity(self.methods.len());
        for registration in &self.methods {
            if !seen.insert(registration.method_id) {
                return Err(Error::DuplicateMethod {
                    hub: self.name.clone(),
                    method_id: registration.method_id,
                });
            }
        }
        if let Some(method_id) = self.method_filters.keys().find(|id| !seen.contains(*id)) {
            return Err(Error::UnknownMethod {
                hub: self.name.clone(),
                method_id: *method_id,
            });
        }

        let mut table = HashMap::with_capacity(self.methods.len());
        for registration in self.methods {
            let own = self
                .method_filters
                .remove(&registration.method_id)
                .unwrap_or_default();
            let descriptors = filter::attach(&self.filters, &own);
            let chain = filter::build::<HubContext>(&descriptors, resolver)?;

            tracing::debug!(
                hub = %self.name,
                method = %registration.name,
                method_id = %registration.method_id,
                filters = chain.len(),
                "hub method built"
            );

            table.insert(
                registration.method_id,
                Arc::new(HubMethod {
                    name: Arc::from(registration.name),
                    pipeline: Pipeline::new(chain, registration.endpoint),
                    marshal: registration.marshal,
                }),
            );
        }

        let connect_chain = filter::build::<CallContext>(&self.filters, resolver)?;
        let descriptor = MethodDescriptor::new::<Nil, Nil>(self.name.clone(), CONNECT_METHOD, MethodKind::SessionConnect);

        Ok(HubDefinition {
            descriptor: Arc::new(descriptor),
            connect: Pipeline::new(connect_chain, Arc::new(ConnectEndpoint)),
            dispatch: Arc::new(HubDispatch {
                name: self.name,
                methods: table,
                groups: Groups::default(),
                on_connect: self.on_connect,
                on_disconnect: self.on_disconnect,
            }),
            config: self.config,
        })
    }
}

/// A built hub, ready to be bound.
pub struct HubDefinition {
    descriptor: Arc<MethodDescriptor>,
    connect: Pipeline<CallContext>,
    dispatch: Arc<HubDispatch>,
    config: SessionConfig,
}

impl HubDefinition {
    pub fn name(&self) -> &str {
        &self.dispatch.name
    }

    /// The `SessionConnect` descriptor binders route on.
    pub fn descriptor(&self) -> &Arc<MethodDescriptor> {
        &self.descriptor
    }

    pub fn groups(&self) -> &Groups {
        &self.dispatch.groups
    }

    pub fn method_ids(&self) -> impl Iterator<Item = MethodId> + '_ {
        self.dispatch.methods.keys().copied()
    }

    /// The hub as a bindable method.
    pub fn bound(self: &Arc<Self>) -> BoundMethod {
        BoundMethod::Session(self.clone())
    }

    /// Runs the connect handshake through the call-shaped filter chain.
    pub async fn accept(&self, ctx: &mut CallContext) -> std::result::Result<(), Failure> {
        self.connect.invoke(ctx).await
    }

    /// Opens a server session over an upgraded connection.
    pub fn open_session(&self, transport: Arc<dyn Transport>, codec: Codec) -> DuplexSession {
        self.open_session_with(transport, codec, self.config.clone())
    }

    /// Like `open_session`, with `config` in place of the hub's own.
    pub fn open_session_with(&self, transport: Arc<dyn Transport>, codec: Codec, config: SessionConfig) -> DuplexSession {
        let session = SessionBuilder::new(self.dispatch.name.clone())
            .codec(codec)
            .config(config)
            .hub(self.dispatch.clone())
            .connecting(transport);

        match &self.dispatch.on_connect {
            Some(hook) => session.start_with(hook(session.clone())),
            None => session.start(),
        };
        session
    }
}

/// Named broadcast sets of sessions, scoped to one hub.
///
/// A group lives as long as its hub, so a `Group` handle stays valid after it empties.
#[derive(Default)]
pub struct Groups {
    groups: DashMap<String, Group>,
}

impl Groups {
    /// Returns the group, creating it if needed.
    pub fn group(&self, name: &str) -> Group {
        self.groups
            .entry(name.to_string())
            .or_insert_with(|| Group::new(name))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Group> {
        self.groups.get(name).map(|g| g.value().clone())
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    fn leave_all(&self, id: SessionId) {
        for group in self.groups.iter() {
            group.remove(id);
        }
    }
}

/// A named set of sessions. Cheap to clone.
#[derive(Clone)]
pub struct Group {
    name: Arc<str>,
    members: Arc<DashMap<SessionId, DuplexSession>>,
}

impl Group {
    fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            members: Arc::new(DashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a member. False if the session is already closed.
    pub fn add(&self, session: &DuplexSession) -> bool {
        if session.state() == SessionState::Closed {
            return false;
        }
        self.members.insert(session.id(), session.clone());

        // the session may have left its groups between the check and the insert
        if session.state() == SessionState::Closed {
            self.members.remove(&session.id());
            return false;
        }
        true
    }

    pub fn remove(&self, id: SessionId) -> bool {
        self.members.remove(&id).is_some()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.members.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Pushes `event` to every member. Returns how many pushes were written.
    pub async fn broadcast<T: Serialize + 'static>(&self, method_id: MethodId, event: &T) -> usize {
        self.broadcast_filtered(method_id, event, None).await
    }

    /// Pushes `event` to every member except `skip`.
    pub async fn broadcast_except<T: Serialize + 'static>(&self, method_id: MethodId, event: &T, skip: SessionId) -> usize {
        self.broadcast_filtered(method_id, event, Some(skip)).await
    }

    async fn broadcast_filtered<T: Serialize + 'static>(
        &self,
        method_id: MethodId,
        event: &T,
        skip: Option<SessionId>,
    ) -> usize {
        // snapshot first; no map guard may live across an await
        let members: Vec<DuplexSession> = self
            .members
            .iter()
            .filter(|m| Some(*m.key()) != skip)
            .map(|m| m.value().clone())
            .collect();

        let mut delivered = 0;
        for member in members {
            match member.push(method_id, event).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::debug!(group = %self.name, session = %member.id(), error = %e, "broadcast skipped member");
                }
            }
        }
        delivered
    }
}
