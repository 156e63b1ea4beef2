//! # Hubrun
//!
//! Binds declared methods to wire transports, runs them through interceptor chains,
//! and multiplexes hub sessions over a single duplex connection.
//!
//! ## Architecture
//!
//! - `descriptor`: what a method is (service, name, kind, payload types).
//! - `filter`: ordered interceptor chains, built once and shared by every call.
//! - `method` / `hub`: typed method bodies and the services that group them.
//! - `bind`: one binder per transport, refusing method kinds it cannot carry.
//! - `session`: the duplex session protocol (correlated calls and push events).
//! - `transport`: byte pipes the binders and sessions run over.
//! - `server`: both shipped binders behind one `ServerConfig`.

pub mod bind;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod failure;
pub mod filter;
pub mod hub;
pub mod method;
pub mod server;
pub mod session;
pub mod transport;

#[cfg(test)]
mod tests;

pub use hubpack::Codec;
pub use hubpack::Encoding;
pub use hubpack::Nil;
pub use hubrpc::Fault;
pub use hubrpc::MethodId;
pub use hubrpc::Status;
