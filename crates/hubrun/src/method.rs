//! # Methods and Services
//!
//! Typed method bodies adapted to the type-erased `Endpoint<CallContext>` stage, and
//! the `ServiceBuilder` that groups them under one service name.
//!
//! ## Invariants
//! - **Built Once**: every method's filter chain is resolved in `build()`. Resolver
//!   failures, duplicate names and filters aimed at unknown methods fail the build.
//! - **Type Erasure At The Edge**: binders only ever see bytes and `CallContext`.
//!   Decoding into `Req` and encoding `Resp` happens through the method's handler.

use std::collections::HashMap;
use std::collections::HashSet;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;

use async_trait::async_trait;
use futures::FutureExt;
use futures::Stream;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

use hubpack::Codec;
use hubrpc::Fault;
use hubrpc::Status;

use crate::bind::BoundMethod;
use crate::context::CallContext;
use crate::descriptor::MethodDescriptor;
use crate::descriptor::MethodKind;
use crate::failure::Failure;
use crate::filter;
use crate::filter::Endpoint;
use crate::filter::FilterDescriptor;
use crate::filter::InstanceResolver;
use crate::filter::Pipeline;

#[derive(Debug, Clone)]
pub enum Error {
    DuplicateMethod { service: String, method: String },
    UnknownMethod { service: String, method: String },
    Filter(filter::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateMethod { service, method } => {
                write!(f, "Method {}/{} is registered twice", service, method)
            }
            Self::UnknownMethod { service, method } => {
                write!(f, "Filters attached to unknown method {}/{}", service, method)
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

/// Capacity of the per-call channels between a binder and a streaming body.
pub(crate) const STREAM_BUFFER: usize = 32;

fn malformed(e: hubpack::Error) -> Failure {
    Failure::Fault(Fault::invalid_argument(format!("malformed request: {}", e)))
}

fn decode_item<T: DeserializeOwned + 'static>(codec: Codec, item: RequestItem) -> std::result::Result<T, Failure> {
    match item {
        Ok(bytes) => codec.decode(&bytes).map_err(malformed),
        Err(fault) => Err(Failure::Fault(fault)),
    }
}

fn missing(what: &str) -> Failure {
    Failure::new(Status::Internal, format!("{} missing from call context", what))
}

/// One inbound request message, or the fault that ended the stream early.
pub type RequestItem = std::result::Result<Vec<u8>, Fault>;

/// Inbound messages of a client- or duplex-streaming call.
pub struct RequestStream<T> {
    rx: mpsc::Receiver<RequestItem>,
    codec: Codec,
    _item: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned + 'static> RequestStream<T> {
    pub fn new(codec: Codec, rx: mpsc::Receiver<RequestItem>) -> Self {
        Self {
            rx,
            codec,
            _item: PhantomData,
        }
    }

    /// The next message, or `None` once the caller half-closed. A protocol error
    /// or a lost caller yields one failure before the end.
    pub async fn recv(&mut self) -> Option<std::result::Result<T, Failure>> {
        let item = self.rx.recv().await?;
        Some(decode_item(self.codec, item))
    }
}

impl<T: DeserializeOwned + 'static> Stream for RequestStream<T> {
    type Item = std::result::Result<T, Failure>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let codec = self.codec;
        self.rx
            .poll_recv(cx)
            .map(|item| item.map(|item| decode_item(codec, item)))
    }
}

/// Outbound messages of a server- or duplex-streaming call.
pub struct ResponseSink<T> {
    tx: mpsc::Sender<Vec<u8>>,
    codec: Codec,
    _item: PhantomData<fn(T)>,
}

impl<T> Clone for ResponseSink<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            codec: self.codec,
            _item: PhantomData,
        }
    }
}

impl<T: Serialize + 'static> ResponseSink<T> {
    pub fn new(codec: Codec, tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            tx,
            codec,
            _item: PhantomData,
        }
    }

    pub async fn send(&self, item: &T) -> std::result::Result<(), Failure> {
        let bytes = self.codec.encode(item)?;
        self.tx
            .send(bytes)
            .await
            .map_err(|_| Failure::new(Status::Cancelled, "response stream closed"))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Moves payloads between bytes and the typed slots of a `CallContext`.
trait Marshal: Send + Sync {
    fn decode_request(&self, ctx: &mut CallContext, bytes: &[u8]) -> std::result::Result<(), Failure>;
    fn attach_request_stream(&self, ctx: &mut CallContext, rx: mpsc::Receiver<RequestItem>);
    fn attach_response_sink(&self, ctx: &mut CallContext, tx: mpsc::Sender<Vec<u8>>);
    fn encode_response(&self, ctx: &mut CallContext) -> std::result::Result<Vec<u8>, Failure>;
}

struct Typed<Req, Resp>(PhantomData<fn(Req) -> Resp>);

impl<Req, Resp> Marshal for Typed<Req, Resp>
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    fn decode_request(&self, ctx: &mut CallContext, bytes: &[u8]) -> std::result::Result<(), Failure> {
        let request: Req = ctx.codec().decode(bytes).map_err(malformed)?;
        ctx.set_request(request);
        Ok(())
    }

    fn attach_request_stream(&self, ctx: &mut CallContext, rx: mpsc::Receiver<RequestItem>) {
        let stream = RequestStream::<Req>::new(ctx.codec(), rx);
        ctx.set_request(stream);
    }

    fn attach_response_sink(&self, ctx: &mut CallContext, tx: mpsc::Sender<Vec<u8>>) {
        let sink = ResponseSink::<Resp>::new(ctx.codec(), tx);
        ctx.insert(sink);
    }

    fn encode_response(&self, ctx: &mut CallContext) -> std::result::Result<Vec<u8>, Failure> {
        let response = ctx.take_response::<Resp>().ok_or_else(|| missing("response"))?;
        Ok(ctx.codec().encode(&response)?)
    }
}

type UnaryFn<Req, Resp> = Box<dyn Fn(Req) -> BoxFuture<'static, std::result::Result<Resp, Failure>> + Send + Sync>;
type ServerStreamFn<Req, Resp> =
    Box<dyn Fn(Req, ResponseSink<Resp>) -> BoxFuture<'static, std::result::Result<(), Failure>> + Send + Sync>;
type ClientStreamFn<Req, Resp> =
    Box<dyn Fn(RequestStream<Req>) -> BoxFuture<'static, std::result::Result<Resp, Failure>> + Send + Sync>;
type DuplexStreamFn<Req, Resp> = Box<
    dyn Fn(RequestStream<Req>, ResponseSink<Resp>) -> BoxFuture<'static, std::result::Result<(), Failure>>
        + Send
        + Sync,
>;

struct UnaryEndpoint<Req, Resp>(UnaryFn<Req, Resp>);

#[async_trait]
impl<Req, Resp> Endpoint<CallContext> for UnaryEndpoint<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    async fn call(&self, ctx: &mut CallContext) -> std::result::Result<(), Failure> {
        let request = ctx.take_request::<Req>().ok_or_else(|| missing("request"))?;
        let response = (self.0)(request).await?;
        ctx.set_response(response);
        Ok(())
    }
}

struct ServerStreamEndpoint<Req, Resp>(ServerStreamFn<Req, Resp>);

#[async_trait]
impl<Req, Resp> Endpoint<CallContext> for ServerStreamEndpoint<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    async fn call(&self, ctx: &mut CallContext) -> std::result::Result<(), Failure> {
        let request = ctx.take_request::<Req>().ok_or_else(|| missing("request"))?;
        let sink = ctx.remove::<ResponseSink<Resp>>().ok_or_else(|| missing("response sink"))?;
        (self.0)(request, sink).await
    }
}

struct ClientStreamEndpoint<Req, Resp>(ClientStreamFn<Req, Resp>);

#[async_trait]
impl<Req, Resp> Endpoint<CallContext> for ClientStreamEndpoint<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    async fn call(&self, ctx: &mut CallContext) -> std::result::Result<(), Failure> {
        let requests = ctx
            .take_request::<RequestStream<Req>>()
            .ok_or_else(|| missing("request stream"))?;
        let response = (self.0)(requests).await?;
        ctx.set_response(response);
        Ok(())
    }
}

struct DuplexStreamEndpoint<Req, Resp>(DuplexStreamFn<Req, Resp>);

#[async_trait]
impl<Req, Resp> Endpoint<CallContext> for DuplexStreamEndpoint<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    async fn call(&self, ctx: &mut CallContext) -> std::result::Result<(), Failure> {
        let requests = ctx
            .take_request::<RequestStream<Req>>()
            .ok_or_else(|| missing("request stream"))?;
        let sink = ctx.remove::<ResponseSink<Resp>>().ok_or_else(|| missing("response sink"))?;
        (self.0)(requests, sink).await
    }
}

/// A method with its built pipeline, ready for any binder.
pub struct MethodHandler {
    descriptor: Arc<MethodDescriptor>,
    pipeline: Pipeline<CallContext>,
    marshal: Box<dyn Marshal>,
}

impl MethodHandler {
    pub fn descriptor(&self) -> &Arc<MethodDescriptor> {
        &self.descriptor
    }

    pub fn pipeline(&self) -> &Pipeline<CallContext> {
        &self.pipeline
    }

    /// A fresh context for one call of this method.
    pub fn context(&self, codec: Codec) -> CallContext {
        CallContext::new(self.descriptor.clone(), codec)
    }

    pub fn decode_request(&self, ctx: &mut CallContext, bytes: &[u8]) -> std::result::Result<(), Failure> {
        self.marshal.decode_request(ctx, bytes)
    }

    pub fn attach_request_stream(&self, ctx: &mut CallContext, rx: mpsc::Receiver<RequestItem>) {
        self.marshal.attach_request_stream(ctx, rx);
    }

    pub fn attach_response_sink(&self, ctx: &mut CallContext, tx: mpsc::Sender<Vec<u8>>) {
        self.marshal.attach_response_sink(ctx, tx);
    }

    pub fn encode_response(&self, ctx: &mut CallContext) -> std::result::Result<Vec<u8>, Failure> {
        self.marshal.encode_response(ctx)
    }

    /// Runs the filter chain and the body.
    pub async fn invoke(&self, ctx: &mut CallContext) -> std::result::Result<(), Failure> {
        self.pipeline.invoke(ctx).await
    }
}

struct Registration {
    descriptor: MethodDescriptor,
    endpoint: Arc<dyn Endpoint<CallContext>>,
    marshal: Box<dyn Marshal>,
}

/// Fluent builder for a service of calls.
pub struct ServiceBuilder {
    name: String,
    filters: Vec<FilterDescriptor>,
    method_filters: HashMap<String, Vec<FilterDescriptor>>,
    methods: Vec<Registration>,
}

impl ServiceBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filters: Vec::new(),
            method_filters: HashMap::new(),
            methods: Vec::new(),
        }
    }

    /// Attaches a filter to every method of the service.
    pub fn filter(mut self, descriptor: FilterDescriptor) -> Self {
        self.filters.push(descriptor);
        self
    }

    /// Attaches a filter to one method. Runs after service-level filters of equal priority.
    pub fn method_filter(mut self, method: impl Into<String>, descriptor: FilterDescriptor) -> Self {
        self.method_filters.entry(method.into()).or_default().push(descriptor);
        self
    }

    fn register<Req, Resp>(mut self, name: String, kind: MethodKind, endpoint: Arc<dyn Endpoint<CallContext>>) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
    {
        self.methods.push(Registration {
            descriptor: MethodDescriptor::new::<Req, Resp>(self.name.clone(), name, kind),
            endpoint,
            marshal: Box::new(Typed::<Req, Resp>(PhantomData)),
        });
        self
    }

    pub fn unary<Req, Resp, F, Fut>(self, name: impl Into<String>, handler: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Resp, Failure>> + Send + 'static,
    {
        let body: UnaryFn<Req, Resp> = Box::new(move |req| handler(req).boxed());
        self.register::<Req, Resp>(name.into(), MethodKind::Unary, Arc::new(UnaryEndpoint(body)))
    }

    pub fn server_stream<Req, Resp, F, Fut>(self, name: impl Into<String>, handler: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req, ResponseSink<Resp>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), Failure>> + Send + 'static,
    {
        let body: ServerStreamFn<Req, Resp> = Box::new(move |req, sink| handler(req, sink).boxed());
        self.register::<Req, Resp>(name.into(), MethodKind::ServerStream, Arc::new(ServerStreamEndpoint(body)))
    }

    pub fn client_stream<Req, Resp, F, Fut>(self, name: impl Into<String>, handler: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(RequestStream<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Resp, Failure>> + Send + 'static,
    {
        let body: ClientStreamFn<Req, Resp> = Box::new(move |requests| handler(requests).boxed());
        self.register::<Req, Resp>(name.into(), MethodKind::ClientStream, Arc::new(ClientStreamEndpoint(body)))
    }

    pub fn duplex_stream<Req, Resp, F, Fut>(self, name: impl Into<String>, handler: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(RequestStream<Req>, ResponseSink<Resp>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), Failure>> + Send + 'static,
    {
        let body: DuplexStreamFn<Req, Resp> = Box::new(move |requests, sink| handler(requests, sink).boxed());
        self.register::<Req, Resp>(name.into(), MethodKind::DuplexStream, Arc::new(DuplexStreamEndpoint(body)))
    }

    /// Resolves every method's filter chain.
    pub fn build(mut self, resolver: &dyn InstanceResolver) -> Result<ServiceDefinition> {
        let mut seen = HashSet::new();
        for registration in &self.methods {
            if !seen.insert(registration.descriptor.method.clone()) {
                return Err(Error::DuplicateMethod {
                    service: self.name.clone(),
                    method: registration.descriptor.method.clone(),
                });
            }
        }
        if let Some(method) = self.method_filters.keys().find(|m| !seen.contains(*m)) {
            return Err(Error::UnknownMethod {
                service: self.name.clone(),
                method: method.clone(),
            });
        }

        let mut methods = Vec::with_capacity(self.methods.len());
        for registration in self.methods {
            let own = self
                .method_filters
                .remove(&registration.descriptor.method)
                .unwrap_or_default();
            let descriptors = filter::attach(&self.filters, &own);
            let chain = filter::build::<CallContext>(&descriptors, resolver)?;

            tracing::debug!(
                method = %registration.descriptor,
                filters = chain.len(),
                "method built"
            );

            methods.push(BoundMethod::Call(Arc::new(MethodHandler {
                descriptor: Arc::new(registration.descriptor),
                pipeline: Pipeline::new(chain, registration.endpoint),
                marshal: registration.marshal,
            })));
        }

        Ok(ServiceDefinition {
            name: self.name,
            methods,
        })
    }
}

/// A built service: its methods, each with a frozen pipeline.
pub struct ServiceDefinition {
    name: String,
    methods: Vec<BoundMethod>,
}

impl ServiceDefinition {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn methods(&self) -> &[BoundMethod] {
        &self.methods
    }

    pub fn method(&self, name: &str) -> Option<&BoundMethod> {
        self.methods.iter().find(|m| m.descriptor().method == name)
    }
}
