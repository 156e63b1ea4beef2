//! # Protocol Frames
//!
//! Two envelopes share one framing codec.
//!
//! - `CallFrame` carries a single call over a dedicated connection: the client opens
//!   a route, streams request messages, half-closes, and the server answers with
//!   response messages and exactly one trailer. A session-connect route answers with
//!   `Upgraded` instead, after which the connection carries `HubFrame`s.
//! - `HubFrame` multiplexes requests, responses, faults and push events over one
//!   session. Requests and replies are matched by correlation id, pushes by method id.
//!
//! ## Invariants
//! - **Panic Safety**: decoding returns `Result`, never panics on hostile bytes.
//! - **Opaque Payloads**: frames never interpret `payload`; the bound codec does.

use serde::Deserialize;
use serde::Serialize;

use hubpack::Codec;

use crate::error::Error;
use crate::error::Result;
use crate::fault::Fault;
use crate::method_id::MethodId;

/// Revision of the frame layout, exchanged when a connection upgrades to a session.
pub const PROTOCOL_VERSION: u16 = 1;

fn envelope() -> Codec {
    Codec::binary().max_payload(usize::MAX)
}

/// Frames of a single call on its own connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallFrame {
    /// First frame from the client. Selects the bound method.
    Open { service: String, method: String },
    /// One request message (client to server) or response message (server to client).
    Message { payload: Vec<u8> },
    /// The client has no more request messages.
    HalfClose,
    /// Final server frame. `None` means success.
    Trailer { fault: Option<Fault> },
    /// A session-connect route accepted the handshake.
    Upgraded { protocol: u16 },
}

impl CallFrame {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(envelope().encode(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(envelope().decode(bytes)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Open { .. } => "Open",
            Self::Message { .. } => "Message",
            Self::HalfClose => "HalfClose",
            Self::Trailer { .. } => "Trailer",
            Self::Upgraded { .. } => "Upgraded",
        }
    }

    /// Builds the error for a frame that arrived out of turn.
    pub fn unexpected(&self, expected: &'static str) -> Error {
        Error::UnexpectedFrame {
            expected,
            found: self.kind(),
        }
    }
}

/// Frames multiplexed over a duplex session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HubFrame {
    /// Invoke a hub method. No correlation id means fire-and-forget.
    Request {
        method_id: MethodId,
        correlation_id: Option<u32>,
        payload: Vec<u8>,
    },
    /// Successful completion of a correlated request.
    Response { correlation_id: u32, payload: Vec<u8> },
    /// Failed completion of a correlated request.
    Fault { correlation_id: u32, fault: Fault },
    /// Unsolicited event, dispatched by method id.
    Push { method_id: MethodId, payload: Vec<u8> },
    /// The sender is shutting the session down.
    Close { reason: Option<String> },
}

impl HubFrame {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(envelope().encode(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(envelope().decode(bytes)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request { .. } => "Request",
            Self::Response { .. } => "Response",
            Self::Fault { .. } => "Fault",
            Self::Push { .. } => "Push",
            Self::Close { .. } => "Close",
        }
    }

    /// The correlation id this frame completes, if it is a completion.
    pub fn completes(&self) -> Option<u32> {
        match self {
            Self::Response { correlation_id, .. } | Self::Fault { correlation_id, .. } => {
                Some(*correlation_id)
            }
            _ => None,
        }
    }
}
