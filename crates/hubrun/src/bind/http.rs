//! # HTTP Binder
//!
//! Serves unary methods as `POST /{service}/{method}` on an axum router. The request
//! body is the encoded request; a successful response body is the encoded response.
//!
//! Faults become an HTTP status, an `x-hub-status` header with the numeric status
//! code, and a JSON body `{ "status", "code", "detail" }`.
//!
//! Streaming and session-connect methods are rejected at `bind`.

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::http::header;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::post;
use tokio::net::TcpListener;

use hubpack::Codec;
use hubrpc::Fault;
use hubrpc::Status;

use crate::bind::Binder;
use crate::bind::BoundMethod;
use crate::bind::Error;
use crate::bind::Registration;
use crate::bind::Result;
use crate::bind::wire_fault;
use crate::descriptor::MethodKind;
use crate::method::MethodHandler;

/// Header carrying the numeric status code of a failed call.
pub const STATUS_HEADER: &str = "x-hub-status";

/// Native call object of the HTTP binder, available through `CallContext::native`.
#[derive(Debug, Clone)]
pub struct HttpCall {
    pub headers: HeaderMap,
}

struct Route {
    path: String,
    handler: Arc<MethodHandler>,
    codec: Codec,
}

/// Collects unary routes for an axum `Router`.
pub struct HttpBinder {
    codec: Codec,
    routes: Vec<Route>,
}

impl HttpBinder {
    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            routes: Vec::new(),
        }
    }

    pub fn into_router(self) -> Router {
        let mut router = Router::new();
        for route in self.routes {
            let path = route.path.clone();
            let route = Arc::new(route);
            router = router.route(
                &path,
                post(move |headers: HeaderMap, body: Bytes| {
                    let route = route.clone();
                    async move { route.handle(headers, body).await }
                }),
            );
        }
        router
    }

    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        tracing::info!(addr = ?listener.local_addr().ok(), routes = self.routes.len(), "http server listening");
        axum::serve(listener, self.into_router()).await
    }
}

impl Default for HttpBinder {
    fn default() -> Self {
        Self::new(Codec::text())
    }
}

impl Binder for HttpBinder {
    fn transport(&self) -> &'static str {
        "http"
    }

    fn supports(&self, kind: MethodKind) -> bool {
        kind == MethodKind::Unary
    }

    fn bind(&mut self, method: &BoundMethod) -> Result<Registration> {
        let descriptor = method.descriptor().clone();
        self.check(&descriptor)?;

        let BoundMethod::Call(handler) = method else {
            return Err(Error::UnsupportedKind {
                transport: self.transport(),
                kind: descriptor.kind,
                method: descriptor.path(),
            });
        };

        let path = format!("/{}", descriptor.path());
        if self.routes.iter().any(|r| r.path == path) {
            return Err(Error::DuplicateRoute {
                transport: self.transport(),
                route: path,
            });
        }
        self.routes.push(Route {
            path: path.clone(),
            handler: handler.clone(),
            codec: self.codec,
        });

        tracing::debug!(method = %descriptor, route = %path, encoding = %self.codec.encoding(), "bound on http");
        Ok(Registration {
            descriptor,
            route: path,
            encoding: self.codec.encoding(),
        })
    }
}

impl Route {
    async fn handle(&self, headers: HeaderMap, body: Bytes) -> Response {
        let handler = &self.handler;
        let mut ctx = handler.context(self.codec).with_native(HttpCall { headers });

        let outcome = match handler.decode_request(&mut ctx, &body) {
            Ok(()) => match handler.invoke(&mut ctx).await {
                Ok(()) => handler.encode_response(&mut ctx),
                Err(failure) => Err(failure),
            },
            Err(failure) => Err(failure),
        };

        match outcome {
            Ok(bytes) => {
                tracing::debug!(method = %handler.descriptor(), elapsed_us = ctx.elapsed().as_micros() as u64, "http call ok");
                ([(header::CONTENT_TYPE, self.codec.content_type())], bytes).into_response()
            }
            Err(failure) => fault_response(wire_fault(handler.descriptor(), failure)),
        }
    }
}

/// HTTP status used for a fault status.
pub fn http_status(status: Status) -> StatusCode {
    match status {
        Status::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
        Status::InvalidArgument | Status::FailedPrecondition | Status::OutOfRange => StatusCode::BAD_REQUEST,
        Status::Unauthenticated => StatusCode::UNAUTHORIZED,
        Status::PermissionDenied => StatusCode::FORBIDDEN,
        Status::NotFound => StatusCode::NOT_FOUND,
        Status::AlreadyExists | Status::Aborted => StatusCode::CONFLICT,
        Status::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        Status::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        Status::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        Status::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        Status::Unknown | Status::Internal | Status::DataLoss => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn fault_response(fault: Fault) -> Response {
    let body = serde_json::json!({
        "status": fault.status.as_str(),
        "code": fault.status.code(),
        "detail": fault.detail,
    });
    (
        http_status(fault.status),
        [(STATUS_HEADER, fault.status.code().to_string())],
        Json(body),
    )
        .into_response()
}
