//! Broker protocol: name registration and resolution.
//!
//! The broker is an ordinary service reachable under a well-known reserved
//! server id, so both sides of the protocol ride the normal request frames
//! and the same correlation engine. `Register` is fire-and-forget (sequence
//! 0); `Resolve` is a request/response whose reply carries the registered
//! endpoint or not-found.
//!
//! [`BrokerDirectory`] is the serving side: install it with
//! [`crate::Dispatcher::serve_broker`] and a broker daemon is just another
//! dispatcher process.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use patchbay_core::{get_str, put_str, EndpointSpec, ErrorCode, WireError};

use crate::connection::ConnId;
use crate::service::{CallContext, Service};

/// Reserved server id the broker answers under; below the dynamic id range.
pub const BROKER_SERVER_ID: u32 = 1;

/// Fire-and-forget: `name` is now reachable at `endpoint`.
pub const BROKER_METHOD_REGISTER: u32 = 1;

/// Request/response: where does `name` live?
pub const BROKER_METHOD_RESOLVE: u32 = 2;

pub const BROKER_INTERFACE: &str = "patchbay.Broker";
pub const BROKER_ROLE: &str = "broker";

/// Client-side brokerage state.
pub(crate) struct BrokerClient {
    pub endpoint: EndpointSpec,
    pub conn: Option<ConnId>,
}

pub(crate) fn encode_register(name: &str, endpoint: &str) -> Bytes {
    let mut buf = BytesMut::new();
    put_str(&mut buf, name);
    put_str(&mut buf, endpoint);
    buf.freeze()
}

pub(crate) fn decode_register(mut body: Bytes) -> Result<(String, String), WireError> {
    let name = get_str(&mut body)?;
    let endpoint = get_str(&mut body)?;
    Ok((name, endpoint))
}

pub(crate) fn encode_resolve(name: &str) -> Bytes {
    let mut buf = BytesMut::new();
    put_str(&mut buf, name);
    buf.freeze()
}

pub(crate) fn decode_resolve(mut body: Bytes) -> Result<String, WireError> {
    get_str(&mut body)
}

pub(crate) fn encode_resolve_reply(endpoint: Option<&str>) -> Bytes {
    let mut buf = BytesMut::new();
    match endpoint {
        Some(ep) => {
            buf.put_u8(1);
            put_str(&mut buf, ep);
        }
        None => buf.put_u8(0),
    }
    buf.freeze()
}

pub(crate) fn decode_resolve_reply(mut body: Bytes) -> Result<Option<String>, WireError> {
    if body.remaining() < 1 {
        return Err(WireError::Truncated);
    }
    if body.get_u8() == 0 {
        return Ok(None);
    }
    Ok(Some(get_str(&mut body)?))
}

/// The broker service: a name -> endpoint directory.
#[derive(Default)]
pub struct BrokerDirectory {
    entries: HashMap<String, String>,
}

impl BrokerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Service for BrokerDirectory {
    fn interface(&self) -> &'static str {
        BROKER_INTERFACE
    }

    fn role(&self) -> &str {
        BROKER_ROLE
    }

    fn dispatch(&mut self, ctx: &mut CallContext<'_>, method: u32, args: &[u8]) {
        match method {
            BROKER_METHOD_REGISTER => match decode_register(Bytes::copy_from_slice(args)) {
                Ok((name, endpoint)) => {
                    tracing::info!(%name, %endpoint, "broker: service registered");
                    self.entries.insert(name, endpoint);
                }
                Err(e) => tracing::warn!(error = %e, "broker: malformed registration"),
            },
            BROKER_METHOD_RESOLVE => match decode_resolve(Bytes::copy_from_slice(args)) {
                Ok(name) => {
                    let endpoint = self.entries.get(&name);
                    tracing::debug!(%name, found = endpoint.is_some(), "broker: resolve");
                    ctx.reply(encode_resolve_reply(endpoint.map(String::as_str)));
                }
                Err(e) => ctx.reply_error(ErrorCode::InvalidArgument, e.to_string()),
            },
            other => {
                tracing::warn!(method = other, "broker: unknown method");
                ctx.reply_error(ErrorCode::Unimplemented, "unknown broker method");
            }
        }
    }
}
