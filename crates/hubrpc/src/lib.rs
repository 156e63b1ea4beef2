//! # Hubrpc
//!
//! The wire vocabulary shared by hub clients and servers.
//!
//! ## Architecture
//!
//! - **Status / Fault**: the structured error that crosses the wire. Anything that is
//!   not a `Fault` is flattened into `Status::Internal` before it leaves a process.
//! - **MethodId**: stable numeric identity of a hub method, derived from its declared
//!   signature rather than from registration order.
//! - **Frames**: `CallFrame` drives one call per connection; `HubFrame` multiplexes many
//!   calls and push events over one long-lived session.
//!
//! Frame envelopes are always packed with the binary codec. Payloads inside them are
//! opaque bytes produced by whatever codec the method was bound with.

pub mod error;
pub mod fault;
pub mod frame;
pub mod method_id;

#[cfg(test)]
mod tests;

pub use error::Error;
pub use error::Result;
pub use fault::Fault;
pub use fault::Status;
pub use frame::CallFrame;
pub use frame::HubFrame;
pub use frame::PROTOCOL_VERSION;
pub use method_id::MethodId;
