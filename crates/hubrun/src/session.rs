//! # Duplex Sessions
//!
//! One long-lived connection carrying many correlated calls and push events.
//!
//! ## Philosophy
//!
//! - **One Pump**: a single task reads the transport and routes every frame. Push
//!   handlers and hub requests run on their own tasks, so a slow handler never
//!   stalls demultiplexing.
//! - **One Writer At A Time**: "encode frame, send" runs under a per-session lock.
//! - **No Orphans**: every awaited call is resolved exactly once, by its completion,
//!   by a local timeout or cancellation, or by the session closing.
//!
//! ## Lifecycle
//!
//! `Connecting -> Open -> Closing -> Closed`. Calls are refused outside `Open`.
//! A closing session keeps routing completions until nothing is in flight or the
//! close timeout elapses, then becomes `Closed` and fails whatever is still pending.
//!
//! ## Invariants
//! - **Unique Ids**: a correlation id is never shared by two calls awaiting completion.
//! - **Fire-And-Forget Is Stateless**: it never creates a pending entry.
//! - **Stale Frames**: completions for unknown ids and pushes for unknown method ids
//!   are dropped.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Notify;
use tokio::sync::oneshot;
use tokio::sync::watch;

use hubpack::Codec;
use hubrpc::Fault;
use hubrpc::HubFrame;
use hubrpc::MethodId;
use hubrpc::Status;

use crate::config::SessionConfig;
use crate::context::HubContext;
use crate::hub::Groups;
use crate::hub::HubDispatch;
use crate::transport;
use crate::transport::Transport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The call failed remotely, or was resolved locally with a fault.
    Fault(Fault),
    /// The operation has no meaning for a fire-and-forget call.
    FireAndForget(&'static str),
    Transport(transport::Error),
    Frame(hubrpc::Error),
    Codec(hubpack::Error),
}

impl Error {
    pub fn fault(&self) -> Option<&Fault> {
        match self {
            Self::Fault(fault) => Some(fault),
            _ => None,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fault(fault) => write!(f, "Call failed: {}", fault),
            Self::FireAndForget(op) => {
                write!(f, "{} is not supported in fire-and-forget mode", op)
            }
            Self::Transport(e) => write!(f, "Transport error: {}", e),
            Self::Frame(e) => write!(f, "Frame error: {}", e),
            Self::Codec(e) => write!(f, "Codec error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<Fault> for Error {
    fn from(fault: Fault) -> Self {
        Self::Fault(fault)
    }
}

impl From<transport::Error> for Error {
    fn from(e: transport::Error) -> Self {
        Self::Transport(e)
    }
}

impl From<hubrpc::Error> for Error {
    fn from(e: hubrpc::Error) -> Self {
        Self::Frame(e)
    }
}

impl From<hubpack::Error> for Error {
    fn from(e: hubpack::Error) -> Self {
        Self::Codec(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Whether the caller tracks completion of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    Awaited,
    FireAndForget,
}

/// Process-unique session identity, for logs and group membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl SessionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

type Completion = std::result::Result<Vec<u8>, Fault>;

struct PendingCall {
    method_id: MethodId,
    tx: oneshot::Sender<Completion>,
    created: Instant,
}

type PushFn = Arc<dyn Fn(Codec, &[u8]) -> hubpack::Result<BoxFuture<'static, ()>> + Send + Sync>;

struct Inner {
    id: SessionId,
    label: String,
    transport: Arc<dyn Transport>,
    codec: Codec,
    config: SessionConfig,
    lifecycle: watch::Sender<SessionState>,
    admitted: watch::Sender<bool>,
    pending: DashMap<u32, PendingCall>,
    receivers: DashMap<MethodId, PushFn>,
    hub: Option<Arc<HubDispatch>>,
    next_id: AtomicU32,
    serving: AtomicUsize,
    settled: Notify,
    write_lock: tokio::sync::Mutex<()>,
}

/// Fluent builder for a session.
pub struct SessionBuilder {
    label: String,
    codec: Codec,
    config: SessionConfig,
    hub: Option<Arc<HubDispatch>>,
    receivers: Vec<(MethodId, PushFn)>,
}

impl SessionBuilder {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            codec: Codec::binary(),
            config: SessionConfig::standard(),
            hub: None,
            receivers: Vec::new(),
        }
    }

    pub fn codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub(crate) fn hub(mut self, hub: Arc<HubDispatch>) -> Self {
        self.hub = Some(hub);
        self
    }

    /// Registers a push handler before the session starts.
    pub fn on_push<T, F, Fut>(mut self, method_id: MethodId, handler: F) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.receivers.push((method_id, push_fn(handler)));
        self
    }

    /// Builds the session in `Connecting`. Nothing is read until `start`.
    pub fn connecting(self, transport: Arc<dyn Transport>) -> DuplexSession {
        let (lifecycle, _) = watch::channel(SessionState::Connecting);
        let (admitted, _) = watch::channel(true);
        let inner = Inner {
            id: SessionId::next(),
            label: self.label,
            transport,
            codec: self.codec,
            config: self.config,
            lifecycle,
            admitted,
            pending: DashMap::new(),
            receivers: self.receivers.into_iter().collect(),
            hub: self.hub,
            next_id: AtomicU32::new(1),
            serving: AtomicUsize::new(0),
            settled: Notify::new(),
            write_lock: tokio::sync::Mutex::new(()),
        };
        DuplexSession {
            inner: Arc::new(inner),
        }
    }

    /// Builds and starts the session. The handshake must already be done.
    pub fn open(self, transport: Arc<dyn Transport>) -> DuplexSession {
        let session = self.connecting(transport);
        session.start();
        session
    }
}

fn push_fn<T, F, Fut>(handler: F) -> PushFn
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |codec: Codec, bytes: &[u8]| {
        let event: T = codec.decode(bytes)?;
        Ok(handler(event).boxed())
    })
}

/// Handle to a duplex session. Cheap to clone.
#[derive(Clone)]
pub struct DuplexSession {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DuplexSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexSession")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("state", &self.state())
            .field("pending", &self.inner.pending.len())
            .finish()
    }
}

impl DuplexSession {
    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn codec(&self) -> Codec {
        self.inner.codec
    }

    pub fn state(&self) -> SessionState {
        *self.inner.lifecycle.borrow()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Awaited calls still waiting for a completion.
    pub fn pending_len(&self) -> usize {
        self.inner.pending.len()
    }

    /// Groups of the hub this session serves, if it is a server session.
    pub fn groups(&self) -> Option<&Groups> {
        self.inner.hub.as_ref().map(|hub| hub.groups())
    }

    /// Moves a `Connecting` session to `Open` and starts reading.
    pub fn start(&self) -> bool {
        if !self.transition(&[SessionState::Connecting], SessionState::Open) {
            return false;
        }
        tracing::info!(session = %self.inner.id, label = %self.inner.label, "session open");
        self.spawn_pump();
        true
    }

    /// Like `start`, but holds incoming requests until `hook` returns.
    ///
    /// The session is `Open` while the hook runs, so it may push and call. If the
    /// hook panics the session is closed.
    pub(crate) fn start_with(&self, hook: BoxFuture<'static, ()>) -> bool {
        self.inner.admitted.send_replace(false);
        if !self.start() {
            self.inner.admitted.send_replace(true);
            return false;
        }

        let session = self.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::spawn(hook).await {
                tracing::error!(session = %session.inner.id, error = %e, "connect hook failed");
                session.begin_close(Some("connect hook failed".into()), true);
            }
            session.inner.admitted.send_replace(true);
        });
        true
    }

    /// Registers (or replaces) the handler for push events with `method_id`.
    pub fn on_push<T, F, Fut>(&self, method_id: MethodId, handler: F)
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.receivers.insert(method_id, push_fn(handler));
    }

    /// Calls a method and waits for its typed result.
    pub async fn call<Req, Resp>(&self, method_id: MethodId, request: &Req) -> Result<Resp>
    where
        Req: Serialize + 'static,
        Resp: DeserializeOwned + 'static,
    {
        let payload = self.inner.codec.encode(request)?;
        let bytes = self.invoke(method_id, payload, CallMode::Awaited).await?.wait().await?;
        self.decode_reply(&bytes)
    }

    /// Like `call`, resolving with a timeout fault if no completion arrives in time.
    pub async fn call_timeout<Req, Resp>(
        &self,
        method_id: MethodId,
        request: &Req,
        timeout: Duration,
    ) -> Result<Resp>
    where
        Req: Serialize + 'static,
        Resp: DeserializeOwned + 'static,
    {
        let payload = self.inner.codec.encode(request)?;
        let reply = self.invoke(method_id, payload, CallMode::Awaited).await?;
        let bytes = reply.wait_timeout(timeout).await?;
        self.decode_reply(&bytes)
    }

    /// Fire-and-forget call. Returns once the frame is written.
    pub async fn send<Req>(&self, method_id: MethodId, request: &Req) -> Result<()>
    where
        Req: Serialize + 'static,
    {
        let payload = self.inner.codec.encode(request)?;
        self.invoke(method_id, payload, CallMode::FireAndForget).await?;
        Ok(())
    }

    /// Sends an unsolicited event to the peer.
    pub async fn push<T>(&self, method_id: MethodId, event: &T) -> Result<()>
    where
        T: Serialize + 'static,
    {
        self.ensure_open()?;
        let payload = self.inner.codec.encode(event)?;
        self.write(&HubFrame::Push { method_id, payload }).await
    }

    /// Writes a request frame with an already-encoded payload.
    pub async fn invoke(&self, method_id: MethodId, payload: Vec<u8>, mode: CallMode) -> Result<Reply> {
        self.ensure_open()?;

        if mode == CallMode::FireAndForget {
            let frame = HubFrame::Request {
                method_id,
                correlation_id: None,
                payload,
            };
            self.write(&frame).await?;
            return Ok(Reply::fire_and_forget(method_id));
        }

        let (correlation_id, rx) = self.register(method_id)?;
        let frame = HubFrame::Request {
            method_id,
            correlation_id: Some(correlation_id),
            payload,
        };
        if let Err(e) = self.write(&frame).await {
            self.abandon(correlation_id);
            return Err(e);
        }

        tracing::trace!(session = %self.inner.id, %method_id, correlation_id, "request sent");
        Ok(Reply::awaited(self.clone(), method_id, correlation_id, rx))
    }

    /// Starts an orderly close and waits until the session is `Closed`.
    pub async fn close(&self) {
        self.begin_close(None, true);
        self.closed().await;
    }

    /// Resolves once the session is `Closed`.
    pub async fn closed(&self) {
        let mut lifecycle = self.inner.lifecycle.subscribe();
        let _ = lifecycle.wait_for(|state| *state == SessionState::Closed).await;
    }

    fn transition(&self, from: &[SessionState], to: SessionState) -> bool {
        self.inner.lifecycle.send_if_modified(|state| {
            if from.contains(state) {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state() {
            SessionState::Open => Ok(()),
            _ => Err(self.refusal()),
        }
    }

    fn refusal(&self) -> Error {
        let fault = match self.state() {
            SessionState::Connecting => Fault::new(Status::Unavailable, "session connecting"),
            SessionState::Closing => Fault::session_closing(),
            SessionState::Open | SessionState::Closed => Fault::session_closed(),
        };
        Error::Fault(fault)
    }

    fn register(&self, method_id: MethodId) -> Result<(u32, oneshot::Receiver<Completion>)> {
        if self.inner.pending.len() >= self.inner.config.max_pending {
            return Err(self.exhausted(method_id));
        }

        let (tx, rx) = oneshot::channel();
        let call = PendingCall {
            method_id,
            tx,
            created: Instant::now(),
        };
        let correlation_id = loop {
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            match self.inner.pending.entry(id) {
                // still awaiting completion; skip it
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => {
                    slot.insert(call);
                    break id;
                }
            }
        };

        // concurrent registrations may all pass the first check
        if self.inner.pending.len() > self.inner.config.max_pending {
            self.abandon(correlation_id);
            return Err(self.exhausted(method_id));
        }

        // a close may have swept the table between the state check and the insert
        if self.state() != SessionState::Open {
            self.abandon(correlation_id);
            return Err(self.refusal());
        }
        Ok((correlation_id, rx))
    }

    fn exhausted(&self, method_id: MethodId) -> Error {
        tracing::warn!(session = %self.inner.id, %method_id, "too many pending calls, refusing");
        Fault::new(Status::ResourceExhausted, "too many pending calls").into()
    }

    fn abandon(&self, correlation_id: u32) {
        if self.inner.pending.remove(&correlation_id).is_some() {
            self.inner.settled.notify_waiters();
        }
    }

    fn decode_reply<Resp: DeserializeOwned + 'static>(&self, bytes: &[u8]) -> Result<Resp> {
        self.inner
            .codec
            .decode(bytes)
            .map_err(|e| Fault::new(Status::Internal, format!("malformed response: {}", e)).into())
    }

    async fn write(&self, frame: &HubFrame) -> Result<()> {
        let bytes = frame.encode()?;
        let _guard = self.inner.write_lock.lock().await;
        self.inner.transport.send(&bytes).await?;
        Ok(())
    }

    fn spawn_pump(&self) {
        let session = self.clone();
        tokio::spawn(async move {
            let reason = loop {
                if session.state() == SessionState::Closed {
                    break "closed locally";
                }
                match session.inner.transport.recv().await {
                    Ok(Some(bytes)) => session.route(&bytes),
                    Ok(None) => break "transport ended",
                    Err(e) => {
                        tracing::warn!(session = %session.inner.id, error = %e, "transport error in pump");
                        break "transport error";
                    }
                }
            };
            session.finish(reason).await;
        });
    }

    fn route(&self, bytes: &[u8]) {
        if self.state() == SessionState::Closed {
            return;
        }

        let frame = match HubFrame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(session = %self.inner.id, error = %e, "undecodable frame");
                self.begin_close(Some("protocol error".into()), true);
                return;
            }
        };

        match frame {
            HubFrame::Response { correlation_id, payload } => self.complete(correlation_id, Ok(payload)),
            HubFrame::Fault { correlation_id, fault } => self.complete(correlation_id, Err(fault)),
            HubFrame::Push { method_id, payload } => self.deliver_push(method_id, &payload),
            HubFrame::Request {
                method_id,
                correlation_id,
                payload,
            } => self.serve(method_id, correlation_id, payload),
            HubFrame::Close { reason } => {
                tracing::info!(session = %self.inner.id, reason = ?reason, "peer is closing");
                self.begin_close(reason, false);
            }
        }
    }

    fn complete(&self, correlation_id: u32, outcome: Completion) {
        match self.inner.pending.remove(&correlation_id) {
            Some((_, call)) => {
                tracing::trace!(
                    session = %self.inner.id,
                    method_id = %call.method_id,
                    correlation_id,
                    elapsed_us = call.created.elapsed().as_micros() as u64,
                    "call completed"
                );
                // the caller may have stopped waiting
                let _ = call.tx.send(outcome);
            }
            None => {
                tracing::debug!(session = %self.inner.id, correlation_id, "discarding completion for unknown call");
            }
        }
        self.inner.settled.notify_waiters();
    }

    fn deliver_push(&self, method_id: MethodId, payload: &[u8]) {
        let Some(receiver) = self.inner.receivers.get(&method_id).map(|r| r.value().clone()) else {
            tracing::debug!(session = %self.inner.id, %method_id, "no receiver, dropping push");
            return;
        };
        match receiver(self.inner.codec, payload) {
            Ok(handler) => {
                tokio::spawn(handler);
            }
            Err(e) => {
                tracing::warn!(session = %self.inner.id, %method_id, error = %e, "malformed push");
                self.begin_close(Some("protocol error".into()), true);
            }
        }
    }

    fn serve(&self, method_id: MethodId, correlation_id: Option<u32>, payload: Vec<u8>) {
        let method = self.inner.hub.as_ref().and_then(|hub| hub.method(method_id));
        let Some(method) = method else {
            tracing::debug!(session = %self.inner.id, %method_id, "request for unknown method");
            if let Some(correlation_id) = correlation_id {
                let fault = Fault::unimplemented(format!("no hub method {}", method_id));
                self.spawn_reply(correlation_id, Err(fault));
            }
            return;
        };

        if self.state() != SessionState::Open {
            if let Some(correlation_id) = correlation_id {
                self.spawn_reply(correlation_id, Err(Fault::session_closing()));
            }
            return;
        }

        self.inner.serving.fetch_add(1, Ordering::AcqRel);
        let session = self.clone();
        tokio::spawn(async move {
            let mut admitted = session.inner.admitted.subscribe();
            let _ = admitted.wait_for(|admitted| *admitted).await;

            let mut ctx = HubContext::new(session.clone(), method_id, method.name());

            if session.state() != SessionState::Open {
                if let Some(correlation_id) = correlation_id {
                    session.reply(correlation_id, Err(Fault::session_closing())).await;
                }
            } else if let Err(failure) = method.decode_request(&mut ctx, &payload) {
                match correlation_id {
                    Some(correlation_id) => session.reply(correlation_id, Err(failure.into_fault())).await,
                    None => {
                        tracing::warn!(session = %session.inner.id, %method_id, "malformed fire-and-forget request");
                        session.begin_close(Some("protocol error".into()), true);
                    }
                }
            } else {
                let outcome = match method.invoke(&mut ctx).await {
                    Ok(()) => method.encode_response(&mut ctx),
                    Err(failure) => Err(failure),
                };
                match (correlation_id, outcome) {
                    (Some(correlation_id), outcome) => {
                        session.reply(correlation_id, outcome.map_err(|f| f.into_fault())).await
                    }
                    (None, Err(failure)) => {
                        tracing::debug!(session = %session.inner.id, %method_id, failure = %failure, "fire-and-forget request failed");
                    }
                    (None, Ok(_)) => {}
                }
            }

            drop(ctx);
            session.inner.serving.fetch_sub(1, Ordering::AcqRel);
            session.inner.settled.notify_waiters();
        });
    }

    fn spawn_reply(&self, correlation_id: u32, outcome: Completion) {
        let session = self.clone();
        tokio::spawn(async move { session.reply(correlation_id, outcome).await });
    }

    async fn reply(&self, correlation_id: u32, outcome: Completion) {
        let frame = match outcome {
            Ok(payload) => HubFrame::Response { correlation_id, payload },
            Err(fault) => HubFrame::Fault { correlation_id, fault },
        };
        if let Err(e) = self.write(&frame).await {
            tracing::debug!(session = %self.inner.id, correlation_id, error = %e, "reply not delivered");
        }
    }

    /// Moves to `Closing` and drains in the background. False if already closing.
    fn begin_close(&self, reason: Option<String>, notify_peer: bool) -> bool {
        if self.transition(&[SessionState::Connecting], SessionState::Closing) {
            let session = self.clone();
            tokio::spawn(async move { session.finish("closed before open").await });
            return true;
        }
        if !self.transition(&[SessionState::Open], SessionState::Closing) {
            return false;
        }

        tracing::info!(session = %self.inner.id, reason = ?reason, "session closing");
        let session = self.clone();
        tokio::spawn(async move {
            if notify_peer {
                if let Err(e) = session.write(&HubFrame::Close { reason }).await {
                    tracing::debug!(session = %session.inner.id, error = %e, "close frame not delivered");
                }
            }
            session.drain().await;
        });
        true
    }

    fn is_idle(&self) -> bool {
        self.inner.pending.is_empty() && self.inner.serving.load(Ordering::Acquire) == 0
    }

    async fn drain(&self) {
        let deadline = tokio::time::Instant::now() + self.inner.config.close_timeout();
        loop {
            let settled = self.inner.settled.notified();
            if self.is_idle() || self.state() == SessionState::Closed {
                break;
            }
            if tokio::time::timeout_at(deadline, settled).await.is_err() {
                tracing::debug!(
                    session = %self.inner.id,
                    pending = self.inner.pending.len(),
                    "close timeout elapsed"
                );
                break;
            }
        }
        self.finish("drained").await;
    }

    async fn finish(&self, reason: &str) {
        let changed = self.transition(
            &[SessionState::Connecting, SessionState::Open, SessionState::Closing],
            SessionState::Closed,
        );
        if !changed {
            return;
        }

        let ids: Vec<u32> = self.inner.pending.iter().map(|e| *e.key()).collect();
        let failed = ids.len();
        for id in ids {
            if let Some((_, call)) = self.inner.pending.remove(&id) {
                let _ = call.tx.send(Err(Fault::session_closed()));
            }
        }
        self.inner.settled.notify_waiters();

        self.inner.transport.close().await;

        if let Some(hub) = &self.inner.hub {
            hub.disconnected(self.clone());
        }

        tracing::info!(session = %self.inner.id, reason, failed, "session closed");
    }
}

/// Completion handle of one call.
///
/// Dropping an awaited handle without waiting removes its pending entry.
pub struct Reply {
    session: Option<DuplexSession>,
    method_id: MethodId,
    correlation_id: Option<u32>,
    rx: Option<oneshot::Receiver<Completion>>,
}

impl Reply {
    fn awaited(session: DuplexSession, method_id: MethodId, correlation_id: u32, rx: oneshot::Receiver<Completion>) -> Self {
        Self {
            session: Some(session),
            method_id,
            correlation_id: Some(correlation_id),
            rx: Some(rx),
        }
    }

    fn fire_and_forget(method_id: MethodId) -> Self {
        Self {
            session: None,
            method_id,
            correlation_id: None,
            rx: None,
        }
    }

    pub fn mode(&self) -> CallMode {
        match self.correlation_id {
            Some(_) => CallMode::Awaited,
            None => CallMode::FireAndForget,
        }
    }

    pub fn method_id(&self) -> MethodId {
        self.method_id
    }

    pub fn correlation_id(&self) -> Option<u32> {
        self.correlation_id
    }

    /// Waits for the completion, or for the session to close.
    pub async fn wait(self) -> Result<Vec<u8>> {
        self.settle(None, std::future::pending()).await
    }

    /// Waits at most `timeout`. On expiry the call is resolved locally and a late
    /// completion is discarded.
    pub async fn wait_timeout(self, timeout: Duration) -> Result<Vec<u8>> {
        self.settle(Some(timeout), std::future::pending()).await
    }

    /// Waits until completion or until `cancel` resolves, whichever is first.
    /// Cancelling sends nothing to the peer.
    pub async fn wait_or_cancel<F>(self, cancel: F) -> Result<Vec<u8>>
    where
        F: Future<Output = ()>,
    {
        self.settle(None, cancel).await
    }

    /// Gives up on the call without waiting.
    pub fn cancel(mut self) -> Result<()> {
        if self.rx.take().is_none() {
            return Err(Error::FireAndForget("cancel"));
        }
        self.forget();
        Ok(())
    }

    async fn settle<F>(mut self, timeout: Option<Duration>, cancel: F) -> Result<Vec<u8>>
    where
        F: Future<Output = ()>,
    {
        let Some(rx) = self.rx.as_mut() else {
            return Err(Error::FireAndForget("wait"));
        };

        let expiry = async {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending::<()>().await,
            }
        };

        // `rx` stays in place until resolved; a dropped wait is forgotten by `Drop`
        let settled = tokio::select! {
            outcome = rx => Settled::Done(outcome),
            _ = expiry => Settled::Expired,
            _ = cancel => Settled::Cancelled,
        };

        match settled {
            Settled::Done(outcome) => {
                self.rx = None;
                match outcome {
                    Ok(Ok(payload)) => Ok(payload),
                    Ok(Err(fault)) => Err(Error::Fault(fault)),
                    Err(_) => Err(Error::Fault(Fault::session_closed())),
                }
            }
            Settled::Expired => {
                self.rx = None;
                self.forget();
                Err(Error::Fault(Fault::timeout()))
            }
            Settled::Cancelled => {
                self.rx = None;
                self.forget();
                Err(Error::Fault(Fault::cancelled()))
            }
        }
    }

    fn forget(&mut self) {
        if let (Some(session), Some(correlation_id)) = (&self.session, self.correlation_id) {
            session.abandon(correlation_id);
        }
    }
}

enum Settled {
    Done(std::result::Result<Completion, oneshot::error::RecvError>),
    Expired,
    Cancelled,
}

impl Drop for Reply {
    fn drop(&mut self) {
        if self.rx.is_some() {
            self.forget();
        }
    }
}
