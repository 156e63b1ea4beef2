//! # Framed Binder
//!
//! Serves bound methods over any `Transport`, one call per connection.
//!
//! ## Protocol
//!
//! ```text
//! client: Open{service, method}  Message*  HalfClose
//! server:                        Message*  Trailer{fault?}
//! ```
//!
//! A session-connect route answers `Upgraded` instead of a trailer. From then on the
//! connection carries `HubFrame`s and belongs to a `DuplexSession`.
//!
//! Every method kind is supported.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use hubpack::Codec;
use hubrpc::CallFrame;
use hubrpc::Fault;
use hubrpc::PROTOCOL_VERSION;

use crate::bind::Binder;
use crate::bind::BoundMethod;
use crate::bind::Error;
use crate::bind::Registration;
use crate::bind::Result;
use crate::bind::wire_fault;
use crate::config::SessionConfig;
use crate::context::CallContext;
use crate::descriptor::MethodKind;
use crate::hub::CONNECT_METHOD;
use crate::hub::HubDefinition;
use crate::method::MethodHandler;
use crate::method::RequestItem;
use crate::method::STREAM_BUFFER;
use crate::session;
use crate::session::DuplexSession;
use crate::session::SessionBuilder;
use crate::transport;
use crate::transport::DEFAULT_MAX_FRAME_LEN;
use crate::transport::StreamTransport;
use crate::transport::Transport;

/// Native call object of the framed binder, available through `CallContext::native`.
#[derive(Debug, Clone)]
pub struct FrameCall {
    pub route: String,
    pub peer: Option<SocketAddr>,
}

/// Collects routes for a `FrameServer`.
pub struct FrameBinder {
    codec: Codec,
    max_frame_len: usize,
    session: Option<SessionConfig>,
    routes: HashMap<String, BoundMethod>,
}

impl FrameBinder {
    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            session: None,
            routes: HashMap::new(),
        }
    }

    /// Frame size limit for connections accepted by `FrameServer::serve`.
    pub fn max_frame_len(mut self, max: usize) -> Self {
        self.max_frame_len = max;
        self
    }

    /// Session limits for every hub served here, in place of each hub's own.
    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.session = Some(config);
        self
    }

    pub fn into_server(self) -> FrameServer {
        FrameServer {
            inner: Arc::new(ServerInner {
                codec: self.codec,
                max_frame_len: self.max_frame_len,
                session: self.session,
                routes: self.routes,
            }),
        }
    }
}

impl Default for FrameBinder {
    fn default() -> Self {
        Self::new(Codec::binary())
    }
}

impl Binder for FrameBinder {
    fn transport(&self) -> &'static str {
        "frame"
    }

    fn supports(&self, _kind: MethodKind) -> bool {
        true
    }

    fn bind(&mut self, method: &BoundMethod) -> Result<Registration> {
        let descriptor = method.descriptor().clone();
        self.check(&descriptor)?;

        let route = descriptor.path();
        if self.routes.contains_key(&route) {
            return Err(Error::DuplicateRoute {
                transport: self.transport(),
                route,
            });
        }
        self.routes.insert(route.clone(), method.clone());

        tracing::debug!(method = %descriptor, %route, encoding = %self.codec.encoding(), "bound on frame");
        Ok(Registration {
            descriptor,
            route,
            encoding: self.codec.encoding(),
        })
    }
}

struct ServerInner {
    codec: Codec,
    max_frame_len: usize,
    session: Option<SessionConfig>,
    routes: HashMap<String, BoundMethod>,
}

/// Serves the routes of a `FrameBinder`. Cheap to clone.
#[derive(Clone)]
pub struct FrameServer {
    inner: Arc<ServerInner>,
}

impl FrameServer {
    /// Accepts TCP connections until the listener fails.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        tracing::info!(addr = ?listener.local_addr().ok(), routes = self.inner.routes.len(), "frame server listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            let transport = StreamTransport::tcp(stream).max_frame_len(self.inner.max_frame_len);
            let server = self.clone();
            tokio::spawn(async move { server.serve_peer(Arc::new(transport), Some(peer)).await });
        }
    }

    /// Serves the one call carried by `transport`.
    pub async fn serve_connection(&self, transport: Arc<dyn Transport>) {
        self.serve_peer(transport, None).await;
    }

    async fn serve_peer(&self, transport: Arc<dyn Transport>, peer: Option<SocketAddr>) {
        if let Err(e) = self.dispatch(transport.clone(), peer).await {
            tracing::error!(peer = ?peer, error = %e, "frame connection failed");
            transport.close().await;
        }
    }

    async fn dispatch(&self, transport: Arc<dyn Transport>, peer: Option<SocketAddr>) -> session::Result<()> {
        let Some(first) = transport.recv().await? else {
            return Ok(());
        };
        let (service, method) = match CallFrame::decode(&first)? {
            CallFrame::Open { service, method } => (service, method),
            other => return Err(other.unexpected("Open").into()),
        };

        let route = format!("{}/{}", service, method);
        let Some(bound) = self.inner.routes.get(&route) else {
            tracing::debug!(%route, "no such route");
            let fault = Fault::unimplemented(format!("no method bound at {}", route));
            write(&*transport, &CallFrame::Trailer { fault: Some(fault) }).await?;
            transport.close().await;
            return Ok(());
        };

        let call = FrameCall { route, peer };
        match bound {
            BoundMethod::Call(handler) => self.serve_call(handler, transport, call).await,
            BoundMethod::Session(hub) => self.serve_upgrade(hub, transport, call).await,
        }
    }

    async fn serve_call(&self, handler: &MethodHandler, transport: Arc<dyn Transport>, call: FrameCall) -> session::Result<()> {
        let kind = handler.descriptor().kind;
        let mut ctx = handler.context(self.inner.codec).with_native(call);

        let reader = if kind.streams_requests() {
            let (tx, rx) = mpsc::channel(STREAM_BUFFER);
            handler.attach_request_stream(&mut ctx, rx);
            Some(tokio::spawn(pump_requests(transport.clone(), tx)))
        } else {
            let decoded = match read_request(&*transport).await? {
                Ok(payload) => handler.decode_request(&mut ctx, &payload),
                Err(fault) => Err(fault.into()),
            };
            if let Err(failure) = decoded {
                let fault = wire_fault(handler.descriptor(), failure);
                return finish(&*transport, Some(fault)).await;
            }
            None
        };

        let forwarder = if kind.streams_responses() {
            let (tx, rx) = mpsc::channel(STREAM_BUFFER);
            handler.attach_response_sink(&mut ctx, tx);
            Some(tokio::spawn(forward_responses(transport.clone(), rx)))
        } else {
            None
        };

        let outcome = match handler.invoke(&mut ctx).await {
            Ok(()) if kind.streams_responses() => Ok(None),
            Ok(()) => handler.encode_response(&mut ctx).map(Some),
            Err(failure) => Err(failure),
        };
        tracing::debug!(
            method = %handler.descriptor(),
            ok = outcome.is_ok(),
            elapsed_us = ctx.elapsed().as_micros() as u64,
            "frame call finished"
        );
        // a sink left in the context would keep the forwarder waiting
        drop(ctx);

        if let Some(forwarder) = forwarder {
            let _ = forwarder.await;
        }
        if let Some(reader) = reader {
            reader.abort();
        }

        match outcome {
            Ok(Some(payload)) => {
                write(&*transport, &CallFrame::Message { payload }).await?;
                finish(&*transport, None).await
            }
            Ok(None) => finish(&*transport, None).await,
            Err(failure) => finish(&*transport, Some(wire_fault(handler.descriptor(), failure))).await,
        }
    }

    async fn serve_upgrade(&self, hub: &HubDefinition, transport: Arc<dyn Transport>, call: FrameCall) -> session::Result<()> {
        let mut ctx = CallContext::new(hub.descriptor().clone(), self.inner.codec).with_native(call);
        if let Err(failure) = hub.accept(&mut ctx).await {
            let fault = wire_fault(hub.descriptor(), failure);
            tracing::info!(hub = %hub.name(), fault = %fault, "session refused");
            return finish(&*transport, Some(fault)).await;
        }
        drop(ctx);

        write(
            &*transport,
            &CallFrame::Upgraded {
                protocol: PROTOCOL_VERSION,
            },
        )
        .await?;
        let session = match &self.inner.session {
            Some(config) => hub.open_session_with(transport, self.inner.codec, config.clone()),
            None => hub.open_session(transport, self.inner.codec),
        };
        session.closed().await;
        Ok(())
    }
}

async fn write(transport: &dyn Transport, frame: &CallFrame) -> session::Result<()> {
    transport.send(&frame.encode()?).await?;
    Ok(())
}

/// Writes the trailer and ends the connection.
async fn finish(transport: &dyn Transport, fault: Option<Fault>) -> session::Result<()> {
    let written = write(transport, &CallFrame::Trailer { fault }).await;
    transport.close().await;
    written
}

async fn next_frame(transport: &dyn Transport) -> session::Result<CallFrame> {
    let Some(bytes) = transport.recv().await? else {
        return Err(transport::Error::ConnectionLost("call ended before half-close".into()).into());
    };
    Ok(CallFrame::decode(&bytes)?)
}

/// Reads the single request message of a unary or server-streaming call, through
/// the client's half-close.
async fn read_request(transport: &dyn Transport) -> session::Result<std::result::Result<Vec<u8>, Fault>> {
    let payload = match next_frame(transport).await? {
        CallFrame::Message { payload } => payload,
        CallFrame::HalfClose => return Ok(Err(Fault::invalid_argument("request message missing"))),
        other => return Err(other.unexpected("Message").into()),
    };
    match next_frame(transport).await? {
        CallFrame::HalfClose => Ok(Ok(payload)),
        CallFrame::Message { .. } => Ok(Err(Fault::invalid_argument("more than one request message"))),
        other => Err(other.unexpected("HalfClose").into()),
    }
}

/// Feeds request messages to the body until half-close. Anything else ends the
/// stream with a fault item, never a clean end.
async fn pump_requests(transport: Arc<dyn Transport>, tx: mpsc::Sender<RequestItem>) {
    let fault = loop {
        let bytes = match transport.recv().await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => break Fault::cancelled(),
            Err(e) => {
                tracing::debug!(error = %e, "request stream read failed");
                break Fault::cancelled();
            }
        };
        match CallFrame::decode(&bytes) {
            Ok(CallFrame::Message { payload }) => {
                // the body stopped reading
                if tx.send(Ok(payload)).await.is_err() {
                    return;
                }
            }
            Ok(CallFrame::HalfClose) => return,
            Ok(other) => {
                tracing::warn!(frame = other.kind(), "unexpected frame in request stream");
                break Fault::invalid_argument(format!("unexpected {} frame in request stream", other.kind()));
            }
            Err(e) => {
                tracing::warn!(error = %e, "undecodable frame in request stream");
                break Fault::invalid_argument(format!("malformed request stream: {}", e));
            }
        }
    };
    let _ = tx.send(Err(fault)).await;
}

async fn forward_responses(transport: Arc<dyn Transport>, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(payload) = rx.recv().await {
        if let Err(e) = write(&*transport, &CallFrame::Message { payload }).await {
            tracing::debug!(error = %e, "response stream write failed");
            break;
        }
    }
}

/// Client side of the framed protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameClient {
    codec: Codec,
}

impl FrameClient {
    pub fn new(codec: Codec) -> Self {
        Self { codec }
    }

    /// Opens a call on its own connection.
    pub async fn open(&self, transport: Arc<dyn Transport>, service: &str, method: &str) -> session::Result<ClientCall> {
        let open = CallFrame::Open {
            service: service.to_string(),
            method: method.to_string(),
        };
        write(&*transport, &open).await?;
        Ok(ClientCall {
            transport,
            codec: self.codec,
            done: false,
        })
    }

    pub async fn unary<Req, Resp>(
        &self,
        transport: Arc<dyn Transport>,
        service: &str,
        method: &str,
        request: &Req,
    ) -> session::Result<Resp>
    where
        Req: Serialize + 'static,
        Resp: DeserializeOwned + 'static,
    {
        let mut call = self.open(transport, service, method).await?;
        if let Err(e) = call.send_last(request).await {
            return Err(call.early_trailer(e).await);
        }
        let Some(response) = call.message::<Resp>().await? else {
            return Err(hubrpc::Error::UnexpectedFrame {
                expected: "Message",
                found: "Trailer",
            }
            .into());
        };
        call.finish().await?;
        Ok(response)
    }

    /// Sends one request and collects every streamed response.
    pub async fn server_stream<Req, Resp>(
        &self,
        transport: Arc<dyn Transport>,
        service: &str,
        method: &str,
        request: &Req,
    ) -> session::Result<Vec<Resp>>
    where
        Req: Serialize + 'static,
        Resp: DeserializeOwned + 'static,
    {
        let mut call = self.open(transport, service, method).await?;
        if let Err(e) = call.send_last(request).await {
            return Err(call.early_trailer(e).await);
        }
        let mut responses = Vec::new();
        while let Some(response) = call.message().await? {
            responses.push(response);
        }
        Ok(responses)
    }

    /// Streams every request, then waits for the single response.
    pub async fn client_stream<Req, Resp, I>(
        &self,
        transport: Arc<dyn Transport>,
        service: &str,
        method: &str,
        requests: I,
    ) -> session::Result<Resp>
    where
        Req: Serialize + 'static,
        Resp: DeserializeOwned + 'static,
        I: IntoIterator<Item = Req>,
    {
        let mut call = self.open(transport, service, method).await?;
        for request in requests {
            if let Err(e) = call.send(&request).await {
                return Err(call.early_trailer(e).await);
            }
        }
        if let Err(e) = call.half_close().await {
            return Err(call.early_trailer(e).await);
        }
        let Some(response) = call.message::<Resp>().await? else {
            return Err(hubrpc::Error::UnexpectedFrame {
                expected: "Message",
                found: "Trailer",
            }
            .into());
        };
        call.finish().await?;
        Ok(response)
    }

    /// Performs the session-connect handshake and starts a client session.
    ///
    /// `builder` carries push handlers and limits; its codec is replaced by this
    /// client's.
    pub async fn connect_session(
        &self,
        transport: Arc<dyn Transport>,
        hub: &str,
        builder: SessionBuilder,
    ) -> session::Result<DuplexSession> {
        let session = builder.codec(self.codec).connecting(transport.clone());
        match self.handshake(&*transport, hub).await {
            Ok(()) => {
                session.start();
                Ok(session)
            }
            Err(e) => {
                session.close().await;
                Err(e)
            }
        }
    }

    async fn handshake(&self, transport: &dyn Transport, hub: &str) -> session::Result<()> {
        let open = CallFrame::Open {
            service: hub.to_string(),
            method: CONNECT_METHOD.to_string(),
        };
        write(transport, &open).await?;

        let Some(bytes) = transport.recv().await? else {
            return Err(transport::Error::ConnectionLost("handshake ended early".into()).into());
        };
        match CallFrame::decode(&bytes)? {
            CallFrame::Upgraded { protocol } if protocol == PROTOCOL_VERSION => Ok(()),
            CallFrame::Upgraded { protocol } => Err(hubrpc::Error::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: protocol,
            }
            .into()),
            CallFrame::Trailer { fault: Some(fault) } => Err(fault.into()),
            other => Err(other.unexpected("Upgraded").into()),
        }
    }
}

/// One open call on the client side.
pub struct ClientCall {
    transport: Arc<dyn Transport>,
    codec: Codec,
    done: bool,
}

impl ClientCall {
    pub async fn send<T: Serialize + 'static>(&self, message: &T) -> session::Result<()> {
        let payload = self.codec.encode(message)?;
        write(&*self.transport, &CallFrame::Message { payload }).await
    }

    pub async fn half_close(&self) -> session::Result<()> {
        write(&*self.transport, &CallFrame::HalfClose).await
    }

    /// Sends the only request message and half-closes.
    pub async fn send_last<T: Serialize + 'static>(&self, message: &T) -> session::Result<()> {
        self.send(message).await?;
        self.half_close().await
    }

    /// A failed write may mean the server already answered with a fault trailer.
    async fn early_trailer(&mut self, error: session::Error) -> session::Error {
        match self.finish().await {
            Err(fault @ session::Error::Fault(_)) => fault,
            _ => error,
        }
    }

    /// The next response message. `None` once a successful trailer arrived; a fault
    /// trailer is returned as `Error::Fault`.
    pub async fn message<T: DeserializeOwned + 'static>(&mut self) -> session::Result<Option<T>> {
        if self.done {
            return Ok(None);
        }
        let Some(bytes) = self.transport.recv().await? else {
            self.done = true;
            return Err(transport::Error::ConnectionLost("call ended without a trailer".into()).into());
        };
        match CallFrame::decode(&bytes)? {
            CallFrame::Message { payload } => Ok(Some(self.codec.decode(&payload)?)),
            CallFrame::Trailer { fault } => {
                self.done = true;
                self.transport.close().await;
                match fault {
                    None => Ok(None),
                    Some(fault) => Err(fault.into()),
                }
            }
            other => Err(other.unexpected("Message").into()),
        }
    }

    /// Waits for the trailer, rejecting any further message.
    pub async fn finish(&mut self) -> session::Result<()> {
        if self.done {
            return Ok(());
        }
        let Some(bytes) = self.transport.recv().await? else {
            self.done = true;
            return Err(transport::Error::ConnectionLost("call ended without a trailer".into()).into());
        };
        match CallFrame::decode(&bytes)? {
            CallFrame::Trailer { fault } => {
                self.done = true;
                self.transport.close().await;
                match fault {
                    None => Ok(()),
                    Some(fault) => Err(fault.into()),
                }
            }
            other => Err(other.unexpected("Trailer").into()),
        }
    }
}
