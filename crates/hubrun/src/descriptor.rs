//! # Method Descriptors
//!
//! Static declaration of one remote operation. Descriptors are immutable and shared
//! by every binder that exposes the method.

/// The call shape of a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodKind {
    /// One request, one response.
    Unary,
    /// Many requests, one response.
    ClientStream,
    /// One request, many responses.
    ServerStream,
    /// Many requests, many responses, interleaved.
    DuplexStream,
    /// Upgrades the connection into a long-lived hub session.
    SessionConnect,
}

impl MethodKind {
    pub fn streams_requests(self) -> bool {
        matches!(self, Self::ClientStream | Self::DuplexStream)
    }

    pub fn streams_responses(self) -> bool {
        matches!(self, Self::ServerStream | Self::DuplexStream)
    }
}

impl std::fmt::Display for MethodKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unary => "unary",
            Self::ClientStream => "client-stream",
            Self::ServerStream => "server-stream",
            Self::DuplexStream => "duplex-stream",
            Self::SessionConnect => "session-connect",
        };
        f.write_str(name)
    }
}

/// Immutable declaration of one method.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    pub service: String,
    pub method: String,
    pub kind: MethodKind,
    pub request_type: &'static str,
    pub response_type: &'static str,
}

impl MethodDescriptor {
    pub fn new<Req: 'static, Resp: 'static>(
        service: impl Into<String>,
        method: impl Into<String>,
        kind: MethodKind,
    ) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            kind,
            request_type: std::any::type_name::<Req>(),
            response_type: std::any::type_name::<Resp>(),
        }
    }

    /// `service/method`, the route key used by binders.
    pub fn path(&self) -> String {
        format!("{}/{}", self.service, self.method)
    }
}

impl std::fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} ({})", self.service, self.method, self.kind)
    }
}
