//! patchbay: inter-process RPC middleware.
//!
//! One [`Dispatcher`] per process owns every transport socket, correlates
//! in-flight requests, responses and signal registrations by sequence
//! number, resolves service names locally or through a broker, tracks
//! per-connection session state, and drives the run loop everything else
//! hangs off.
//!
//! # Quick start
//!
//! A server process:
//!
//! ```ignore
//! let mut disp = Dispatcher::new();
//! disp.attach("unix:/run/calc.sock").await?;
//! disp.add_server(Box::new(CalculatorSkeleton::new("main"))).await;
//! disp.run().await?;
//! ```
//!
//! A client process:
//!
//! ```ignore
//! let mut disp = Dispatcher::new();
//! let client = disp.add_client("Calculator", "main", |state| {
//!     tracing::info!(?state, "calculator connection");
//! });
//! disp.connect_blocking(client, Duration::from_secs(2)).await?;
//! let reply = disp.call(client, METHOD_ADD, args, Duration::from_secs(2)).await?;
//! ```
//!
//! Argument payloads are opaque [`bytes::Bytes`]; serialization lives in the
//! generated stub/skeleton layer, which also decides what to do with the
//! state notifications and replies the dispatcher hands it.

#![forbid(unsafe_code)]

mod broker;
mod connection;
mod correlate;
mod dispatcher;
mod registry;
mod service;
mod session;
mod signals;

pub use broker::{
    BrokerDirectory, BROKER_INTERFACE, BROKER_METHOD_REGISTER, BROKER_METHOD_RESOLVE, BROKER_ROLE,
    BROKER_SERVER_ID,
};
pub use connection::{ConnId, ConnectionState};
pub use dispatcher::{Config, Dispatcher, DispatcherHandle, RunError};
pub use registry::{full_qualified_name, ClientId, ServerId};
pub use service::{CallContext, Service};

// Re-export the wire-level types collaborators see in signatures.
pub use patchbay_core;
pub use patchbay_core::{
    AttachError, CallError, ConnectError, EndpointParseError, EndpointSpec, ErrorCode, Frame,
    RuntimeError, SequenceNr, TransportError, WireError, INVALID_HANDLER_ID, INVALID_SEQUENCE_NR,
};

/// Ids below this are reserved (the broker's well-known server id among
/// them); the generator starts here.
pub(crate) const FIRST_DYNAMIC_ID: u32 = 16;
