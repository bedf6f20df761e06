//! Signal routing tables.
//!
//! Client side: emissions arrive as [`Frame::SignalEmit`] carrying the
//! handler id assigned by the emitting server, so delivery is a single map
//! lookup with no name resolution. Server side: each `(server, signal)` pair
//! keeps its subscriber list of `(connection, handler id)`.
//!
//! [`Frame::SignalEmit`]: patchbay_core::Frame::SignalEmit

use std::collections::HashMap;

use crate::connection::ConnId;
use crate::registry::{ClientId, ServerId};

/// A live client-side subscription: handler id -> handler.
pub(crate) struct ClientSignalEntry {
    pub client: ClientId,
    pub conn: ConnId,
    pub signal: u32,
    pub handler: Box<dyn FnMut(&[u8]) + Send>,
}

/// One remote subscriber of a server-side signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Subscription {
    pub conn: ConnId,
    pub handler_id: u32,
}

#[derive(Default)]
pub(crate) struct SignalRouter {
    /// Client side: server-assigned handler id -> handler.
    handlers: HashMap<u32, ClientSignalEntry>,
    /// Server side: (server, signal) -> subscribers.
    emitters: HashMap<(ServerId, u32), Vec<Subscription>>,
}

impl SignalRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a completed client-side subscription.
    pub fn install(&mut self, handler_id: u32, entry: ClientSignalEntry) {
        if self.handlers.insert(handler_id, entry).is_some() {
            tracing::warn!(handler_id, "replacing signal handler with duplicate id");
        }
    }

    /// Deliver an emission to the handler behind `handler_id`.
    ///
    /// Returns false when no handler is installed (already unsubscribed, or
    /// never completed); such emissions are dropped by the caller.
    pub fn deliver(&mut self, handler_id: u32, args: &[u8]) -> bool {
        match self.handlers.get_mut(&handler_id) {
            Some(entry) => {
                (entry.handler)(args);
                true
            }
            None => false,
        }
    }

    /// Remove all live subscriptions of `client` for `signal`.
    ///
    /// Returns the removed `(handler id, conn)` pairs so the caller can tell
    /// each emitting peer to stop.
    pub fn remove_for(&mut self, client: ClientId, signal: u32) -> Vec<(u32, ConnId)> {
        let ids: Vec<u32> = self
            .handlers
            .iter()
            .filter(|(_, e)| e.client == client && e.signal == signal)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.handlers.remove(&id).map(|e| (id, e.conn)))
            .collect()
    }

    /// Remove every subscription owned by `client` (client teardown).
    pub fn purge_client(&mut self, client: ClientId) -> Vec<(u32, ConnId)> {
        let ids: Vec<u32> = self
            .handlers
            .iter()
            .filter(|(_, e)| e.client == client)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.handlers.remove(&id).map(|e| (id, e.conn)))
            .collect()
    }

    /// Record a remote subscriber for `(server, signal)`.
    pub fn add_subscriber(&mut self, server: ServerId, signal: u32, sub: Subscription) {
        self.emitters.entry((server, signal)).or_default().push(sub);
    }

    /// Drop the subscription behind a server-assigned handler id.
    pub fn remove_subscriber(&mut self, handler_id: u32) -> bool {
        let mut removed = false;
        self.emitters.retain(|_, subs| {
            let before = subs.len();
            subs.retain(|s| s.handler_id != handler_id);
            removed |= subs.len() != before;
            !subs.is_empty()
        });
        removed
    }

    /// Current subscribers of `(server, signal)`.
    pub fn subscribers(&self, server: ServerId, signal: u32) -> &[Subscription] {
        self.emitters
            .get(&(server, signal))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Drop every entry referencing a torn-down connection, both sides.
    pub fn purge_conn(&mut self, conn: ConnId) {
        self.handlers.retain(|_, e| e.conn != conn);
        self.emitters.retain(|_, subs| {
            subs.retain(|s| s.conn != conn);
            !subs.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn entry(client: u32, conn: u32, signal: u32) -> ClientSignalEntry {
        ClientSignalEntry {
            client: ClientId(client),
            conn: ConnId(conn),
            signal,
            handler: Box::new(|_| {}),
        }
    }

    #[test]
    fn delivery_hits_the_installed_handler() {
        let mut router = SignalRouter::new();
        let hits = Arc::new(AtomicU32::new(0));
        let hits2 = hits.clone();
        router.install(
            7,
            ClientSignalEntry {
                client: ClientId(1),
                conn: ConnId(2),
                signal: 3,
                handler: Box::new(move |_| {
                    hits2.fetch_add(1, Ordering::SeqCst);
                }),
            },
        );

        assert!(router.deliver(7, b""));
        assert!(!router.deliver(8, b""));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_for_returns_conns_for_unregister() {
        let mut router = SignalRouter::new();
        router.install(10, entry(1, 5, 3));
        router.install(11, entry(1, 5, 4));
        router.install(12, entry(2, 6, 3));

        let removed = router.remove_for(ClientId(1), 3);
        assert_eq!(removed, vec![(10, ConnId(5))]);
        assert!(router.deliver(11, b""));
        assert!(router.deliver(12, b""));
    }

    #[test]
    fn subscriber_removal_by_handler_id() {
        let mut router = SignalRouter::new();
        let server = ServerId(1);
        router.add_subscriber(
            server,
            9,
            Subscription {
                conn: ConnId(1),
                handler_id: 100,
            },
        );
        router.add_subscriber(
            server,
            9,
            Subscription {
                conn: ConnId(2),
                handler_id: 101,
            },
        );

        assert!(router.remove_subscriber(100));
        assert!(!router.remove_subscriber(100));
        assert_eq!(router.subscribers(server, 9).len(), 1);
    }

    #[test]
    fn purge_conn_clears_both_sides() {
        let mut router = SignalRouter::new();
        router.install(20, entry(1, 5, 3));
        router.add_subscriber(
            ServerId(2),
            9,
            Subscription {
                conn: ConnId(5),
                handler_id: 30,
            },
        );

        router.purge_conn(ConnId(5));
        assert!(!router.deliver(20, b""));
        assert!(router.subscribers(ServerId(2), 9).is_empty());
    }
}
