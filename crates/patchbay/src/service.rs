//! Collaborator-facing traits: the server side of a dispatch.
//!
//! Skeleton wrappers implement [`Service`]; the dispatcher invokes
//! [`Service::dispatch`] on its own task with a [`CallContext`] that buffers
//! outgoing frames. Replies and emissions are flushed after the handler
//! returns, so a handler never performs I/O itself and all table access
//! stays on the loop.

use std::any::Any;

use bytes::Bytes;
use patchbay_core::{ErrorCode, Frame, RuntimeError, SequenceNr, INVALID_SEQUENCE_NR};

use crate::connection::ConnId;
use crate::registry::ServerId;
use crate::session::SessionStore;
use crate::signals::SignalRouter;

/// A server instance hosted by the dispatcher.
///
/// `dispatch` runs synchronously on the dispatcher's task. A two-way request
/// must be answered before returning (via [`CallContext::reply`] or
/// [`CallContext::reply_error`]); otherwise the dispatcher answers with an
/// error so the caller cannot hang.
pub trait Service: Send {
    /// Interface name; combined with the role into the registered name.
    fn interface(&self) -> &'static str;

    /// Role distinguishing this instance from others of the same interface.
    fn role(&self) -> &str;

    /// Handle one request.
    fn dispatch(&mut self, ctx: &mut CallContext<'_>, method: u32, args: &[u8]);
}

/// Per-request context handed to [`Service::dispatch`].
pub struct CallContext<'a> {
    pub(crate) seq: SequenceNr,
    pub(crate) conn: ConnId,
    pub(crate) server: ServerId,
    /// Frames to write once the handler returned, in order.
    pub(crate) out: Vec<(ConnId, Frame)>,
    pub(crate) replied: bool,
    pub(crate) stop: bool,
    pub(crate) signals: &'a SignalRouter,
    pub(crate) sessions: &'a mut SessionStore,
    pub(crate) next_id: &'a mut u32,
}

impl CallContext<'_> {
    /// The connection the request arrived on; owns any sessions registered
    /// here.
    pub fn conn(&self) -> ConnId {
        self.conn
    }

    /// True when no response is expected (request sent with sequence 0).
    pub fn is_oneway(&self) -> bool {
        self.seq == INVALID_SEQUENCE_NR
    }

    /// Queue the response payload.
    pub fn reply(&mut self, args: impl Into<Bytes>) {
        self.push_response(Ok(args.into()));
    }

    /// Queue an error response; it carries no argument payload.
    pub fn reply_error(&mut self, code: ErrorCode, message: impl Into<String>) {
        self.push_response(Err(RuntimeError::new(code, message)));
    }

    fn push_response(&mut self, result: Result<Bytes, RuntimeError>) {
        if self.is_oneway() {
            tracing::warn!("reply to a oneway request, dropping");
            return;
        }
        if self.replied {
            tracing::warn!(seq = self.seq, "second reply from handler, dropping");
            return;
        }
        self.out.push((
            self.conn,
            Frame::Response {
                seq: self.seq,
                result,
            },
        ));
        self.replied = true;
    }

    /// Queue one emission of `signal` to every current subscriber.
    pub fn emit(&mut self, signal: u32, args: impl Into<Bytes>) {
        let args = args.into();
        for sub in self.signals.subscribers(self.server, signal) {
            self.out.push((
                sub.conn,
                Frame::SignalEmit {
                    handler_id: sub.handler_id,
                    args: args.clone(),
                },
            ));
        }
    }

    /// Fresh id from the dispatcher's generator (e.g. for a session).
    pub fn generate_id(&mut self) -> u32 {
        let id = *self.next_id;
        *self.next_id = id.checked_add(1).unwrap_or(crate::FIRST_DYNAMIC_ID);
        id
    }

    /// Install session data owned by the requesting connection.
    pub fn register_session(&mut self, session_id: u32, data: Box<dyn Any + Send>) {
        self.sessions.register(self.conn, session_id, data);
    }

    pub fn session_data(&mut self, session_id: u32) -> Option<&mut (dyn Any + Send)> {
        self.sessions.data(session_id)
    }

    pub fn clear_session(&mut self, session_id: u32) -> bool {
        self.sessions.clear(session_id)
    }

    /// Ask the loop to stop once this dispatch is flushed.
    pub fn stop(&mut self) {
        self.stop = true;
    }
}
