//! Frame kinds and their body codec.
//!
//! # Wire format
//!
//! Each frame body starts with a one-byte kind tag followed by the fields of
//! that kind, all integers little-endian, strings u32-length-prefixed UTF-8.
//! Argument payloads are the opaque remainder of the body. The body is
//! framed on the socket by a u32 length prefix (see [`crate::wire`]).
//!
//! Field layout is encoded explicitly per field rather than transmuting a
//! packed struct, so the format holds across platforms.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{RuntimeError, WireError};

/// Correlation id for an outstanding operation.
pub type SequenceNr = u32;

/// Reserved "no sequence number" marker, skipped by generators.
///
/// A request carrying it is a oneway: no response will ever be sent.
pub const INVALID_SEQUENCE_NR: SequenceNr = 0;

/// Handler id `0` in a [`Frame::SignalRegisterAck`] means the registration
/// was refused.
pub const INVALID_HANDLER_ID: u32 = 0;

const TAG_REQUEST: u8 = 1;
const TAG_RESPONSE: u8 = 2;
const TAG_SIGNAL_REGISTER: u8 = 3;
const TAG_SIGNAL_REGISTER_ACK: u8 = 4;
const TAG_SIGNAL_UNREGISTER: u8 = 5;
const TAG_SIGNAL_EMIT: u8 = 6;
const TAG_INTERFACE_RESOLVE: u8 = 7;
const TAG_INTERFACE_RESOLVE_ACK: u8 = 8;

/// A single frame as exchanged between dispatchers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Invoke `method` on the server known by `server_id`.
    Request {
        server_id: u32,
        method: u32,
        seq: SequenceNr,
        args: Bytes,
    },
    /// Reply to the request filed under `seq`: either an opaque result
    /// payload or an application-level error (which carries no payload).
    Response {
        seq: SequenceNr,
        result: Result<Bytes, RuntimeError>,
    },
    /// Subscribe to `signal` of the server known by `server_id`.
    SignalRegister {
        server_id: u32,
        signal: u32,
        seq: SequenceNr,
    },
    /// Subscription ack; `handler_id` routes subsequent emissions.
    SignalRegisterAck { seq: SequenceNr, handler_id: u32 },
    /// Cancel the subscription behind `handler_id`.
    SignalUnregister { handler_id: u32 },
    /// One signal emission, routed by the id from the ack.
    SignalEmit { handler_id: u32, args: Bytes },
    /// Ask the peer which server id serves `name`.
    InterfaceResolve { name: String, seq: SequenceNr },
    /// Answer to [`Frame::InterfaceResolve`]; `None` means not hosted here.
    InterfaceResolveAck {
        seq: SequenceNr,
        server_id: Option<u32>,
    },
}

impl Frame {
    /// Short kind name for log output.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Request { .. } => "request",
            Frame::Response { .. } => "response",
            Frame::SignalRegister { .. } => "signal-register",
            Frame::SignalRegisterAck { .. } => "signal-register-ack",
            Frame::SignalUnregister { .. } => "signal-unregister",
            Frame::SignalEmit { .. } => "signal-emit",
            Frame::InterfaceResolve { .. } => "interface-resolve",
            Frame::InterfaceResolveAck { .. } => "interface-resolve-ack",
        }
    }

    /// Encode the frame body (everything after the length prefix).
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Frame::Request {
                server_id,
                method,
                seq,
                args,
            } => {
                buf.put_u8(TAG_REQUEST);
                buf.put_u32_le(*server_id);
                buf.put_u32_le(*method);
                buf.put_u32_le(*seq);
                buf.put_slice(args);
            }
            Frame::Response { seq, result } => {
                buf.put_u8(TAG_RESPONSE);
                buf.put_u32_le(*seq);
                match result {
                    Ok(args) => {
                        buf.put_u8(0);
                        buf.put_slice(args);
                    }
                    Err(err) => {
                        buf.put_u8(1);
                        buf.put_u32_le(err.code);
                        put_str(buf, &err.message);
                    }
                }
            }
            Frame::SignalRegister {
                server_id,
                signal,
                seq,
            } => {
                buf.put_u8(TAG_SIGNAL_REGISTER);
                buf.put_u32_le(*server_id);
                buf.put_u32_le(*signal);
                buf.put_u32_le(*seq);
            }
            Frame::SignalRegisterAck { seq, handler_id } => {
                buf.put_u8(TAG_SIGNAL_REGISTER_ACK);
                buf.put_u32_le(*seq);
                buf.put_u32_le(*handler_id);
            }
            Frame::SignalUnregister { handler_id } => {
                buf.put_u8(TAG_SIGNAL_UNREGISTER);
                buf.put_u32_le(*handler_id);
            }
            Frame::SignalEmit { handler_id, args } => {
                buf.put_u8(TAG_SIGNAL_EMIT);
                buf.put_u32_le(*handler_id);
                buf.put_slice(args);
            }
            Frame::InterfaceResolve { name, seq } => {
                buf.put_u8(TAG_INTERFACE_RESOLVE);
                buf.put_u32_le(*seq);
                put_str(buf, name);
            }
            Frame::InterfaceResolveAck { seq, server_id } => {
                buf.put_u8(TAG_INTERFACE_RESOLVE_ACK);
                buf.put_u32_le(*seq);
                match server_id {
                    Some(id) => {
                        buf.put_u8(1);
                        buf.put_u32_le(*id);
                    }
                    None => {
                        buf.put_u8(0);
                        buf.put_u32_le(0);
                    }
                }
            }
        }
    }

    /// Decode one frame body.
    pub fn decode(mut body: Bytes) -> Result<Self, WireError> {
        let tag = get_u8(&mut body)?;
        match tag {
            TAG_REQUEST => Ok(Frame::Request {
                server_id: get_u32(&mut body)?,
                method: get_u32(&mut body)?,
                seq: get_u32(&mut body)?,
                args: body,
            }),
            TAG_RESPONSE => {
                let seq = get_u32(&mut body)?;
                let status = get_u8(&mut body)?;
                let result = if status == 0 {
                    Ok(body)
                } else {
                    let code = get_u32(&mut body)?;
                    let message = get_str(&mut body)?;
                    Err(RuntimeError { code, message })
                };
                Ok(Frame::Response { seq, result })
            }
            TAG_SIGNAL_REGISTER => Ok(Frame::SignalRegister {
                server_id: get_u32(&mut body)?,
                signal: get_u32(&mut body)?,
                seq: get_u32(&mut body)?,
            }),
            TAG_SIGNAL_REGISTER_ACK => Ok(Frame::SignalRegisterAck {
                seq: get_u32(&mut body)?,
                handler_id: get_u32(&mut body)?,
            }),
            TAG_SIGNAL_UNREGISTER => Ok(Frame::SignalUnregister {
                handler_id: get_u32(&mut body)?,
            }),
            TAG_SIGNAL_EMIT => Ok(Frame::SignalEmit {
                handler_id: get_u32(&mut body)?,
                args: body,
            }),
            TAG_INTERFACE_RESOLVE => {
                let seq = get_u32(&mut body)?;
                let name = get_str(&mut body)?;
                Ok(Frame::InterfaceResolve { name, seq })
            }
            TAG_INTERFACE_RESOLVE_ACK => {
                let seq = get_u32(&mut body)?;
                let found = get_u8(&mut body)?;
                let id = get_u32(&mut body)?;
                Ok(Frame::InterfaceResolveAck {
                    seq,
                    server_id: (found != 0).then_some(id),
                })
            }
            other => Err(WireError::BadTag(other)),
        }
    }
}

/// Append a u32-length-prefixed UTF-8 string.
pub fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

/// Read a u32-length-prefixed UTF-8 string.
pub fn get_str(body: &mut Bytes) -> Result<String, WireError> {
    let len = get_u32(body)? as usize;
    if body.remaining() < len {
        return Err(WireError::Truncated);
    }
    let raw = body.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| WireError::BadString)
}

fn get_u8(body: &mut Bytes) -> Result<u8, WireError> {
    if body.remaining() < 1 {
        return Err(WireError::Truncated);
    }
    Ok(body.get_u8())
}

fn get_u32(body: &mut Bytes) -> Result<u32, WireError> {
    if body.remaining() < 4 {
        return Err(WireError::Truncated);
    }
    Ok(body.get_u32_le())
}
