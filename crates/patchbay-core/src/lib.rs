//! patchbay-core: Frame, wire and endpoint types for the patchbay dispatcher.
//!
//! This crate defines:
//! - Frame kinds exchanged between dispatchers ([`Frame`])
//! - The length-prefixed wire codec ([`read_frame`], [`write_frame`])
//! - Endpoint specifications ([`EndpointSpec`])
//! - Socket and listener enums over the supported transports ([`Socket`],
//!   [`Listener`])
//! - Error types ([`TransportError`], [`CallError`], [`ConnectError`])
//!
//! Argument payloads are opaque [`bytes::Bytes`]: serialization belongs to
//! the stub/skeleton layer, not to the core.

#![forbid(unsafe_code)]

mod endpoint;
mod error;
mod frame;
mod net;
mod wire;

pub use endpoint::*;
pub use error::*;
pub use frame::*;
pub use net::*;
pub use wire::*;
