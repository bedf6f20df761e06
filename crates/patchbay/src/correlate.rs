//! Sequence correlation engine.
//!
//! Every in-flight operation — request, signal-registration handshake,
//! interface resolution, broker resolution — is filed under a sequence
//! number. Matching a reply is exactly one lookup-and-remove, so at most one
//! handler ever runs per sequence number; a reply with no entry is stale (the
//! waiter timed out or its owner was torn down) and is dropped by the caller.
//!
//! Sequence numbers are unique among *currently outstanding* entries only:
//! the generator is a wrapping increment that skips the invalid marker, and
//! reuse after a full 32-bit cycle is an accepted risk given bounded
//! outstanding counts.

use std::collections::HashMap;

use bytes::Bytes;
use patchbay_core::{CallError, SequenceNr, INVALID_SEQUENCE_NR};

use crate::connection::ConnId;
use crate::registry::ClientId;

/// An outstanding request, waiting for its response frame.
pub(crate) enum PendingRequest {
    /// A cooperative wait is (or is about to be) pumping for this reply.
    Blocking { client: Option<ClientId>, conn: ConnId },
    /// Deliver the outcome to a callback on the loop.
    Callback {
        client: ClientId,
        conn: ConnId,
        handler: Box<dyn FnOnce(Result<Bytes, CallError>) + Send>,
    },
}

impl PendingRequest {
    fn client(&self) -> Option<ClientId> {
        match self {
            Self::Blocking { client, .. } => *client,
            Self::Callback { client, .. } => Some(*client),
        }
    }

    fn conn(&self) -> ConnId {
        match self {
            Self::Blocking { conn, .. } | Self::Callback { conn, .. } => *conn,
        }
    }
}

/// A signal subscription in its handshake phase, before the ack arrived.
pub(crate) struct PendingSignal {
    pub client: ClientId,
    pub conn: ConnId,
    pub signal: u32,
    pub handler: Box<dyn FnMut(&[u8]) + Send>,
}

/// Entries removed by a connection teardown, for the caller to notify.
#[derive(Default)]
pub(crate) struct PurgeOutcome {
    pub requests: Vec<(SequenceNr, PendingRequest)>,
    /// Clients whose interface/broker resolution died with the connection.
    pub resolves: Vec<ClientId>,
    pub signal_regs: usize,
}

pub(crate) struct CorrelationEngine {
    sequence: SequenceNr,
    max_pending: usize,
    requests: HashMap<SequenceNr, PendingRequest>,
    signal_regs: HashMap<SequenceNr, PendingSignal>,
    iface_resolves: HashMap<SequenceNr, (ClientId, ConnId)>,
    broker_resolves: HashMap<SequenceNr, (ClientId, ConnId)>,
}

impl CorrelationEngine {
    pub fn new(max_pending: usize) -> Self {
        Self {
            sequence: INVALID_SEQUENCE_NR,
            max_pending,
            requests: HashMap::new(),
            signal_regs: HashMap::new(),
            iface_resolves: HashMap::new(),
            broker_resolves: HashMap::new(),
        }
    }

    /// Next sequence number; never the invalid marker.
    pub fn generate_sequence_nr(&mut self) -> SequenceNr {
        self.sequence = self.sequence.wrapping_add(1);
        if self.sequence == INVALID_SEQUENCE_NR {
            self.sequence = self.sequence.wrapping_add(1);
        }
        self.sequence
    }

    /// File an outstanding request, refusing past the pending cap.
    pub fn add_request(
        &mut self,
        seq: SequenceNr,
        pending: PendingRequest,
    ) -> Result<(), CallError> {
        if self.requests.len() >= self.max_pending {
            tracing::warn!(
                pending = self.requests.len(),
                max_pending = self.max_pending,
                "too many outstanding requests; refusing new request"
            );
            return Err(CallError::Saturated);
        }
        self.requests.insert(seq, pending);
        Ok(())
    }

    /// The single lookup-and-remove that matches a response to its waiter.
    pub fn match_reply(&mut self, seq: SequenceNr) -> Option<PendingRequest> {
        self.requests.remove(&seq)
    }

    /// Discard an outstanding request (timeout, abandon, context teardown).
    pub fn remove_request(&mut self, seq: SequenceNr) -> Option<PendingRequest> {
        self.requests.remove(&seq)
    }

    pub fn add_signal_registration(&mut self, seq: SequenceNr, pending: PendingSignal) {
        self.signal_regs.insert(seq, pending);
    }

    /// Remove a handshake-phase registration.
    ///
    /// `None` means the registration is unknown — already acked or never
    /// filed — which is the benign unsubscribe-vs-late-ack race, not an
    /// error.
    pub fn remove_signal_registration(&mut self, seq: SequenceNr) -> Option<PendingSignal> {
        self.signal_regs.remove(&seq)
    }

    /// Drop pending handshakes of `client` for one signal.
    pub fn remove_signal_regs_for(&mut self, client: ClientId, signal: u32) -> usize {
        let before = self.signal_regs.len();
        self.signal_regs
            .retain(|_, p| !(p.client == client && p.signal == signal));
        before - self.signal_regs.len()
    }

    pub fn add_iface_resolve(&mut self, seq: SequenceNr, client: ClientId, conn: ConnId) {
        self.iface_resolves.insert(seq, (client, conn));
    }

    pub fn take_iface_resolve(&mut self, seq: SequenceNr) -> Option<ClientId> {
        self.iface_resolves.remove(&seq).map(|(client, _)| client)
    }

    pub fn add_broker_resolve(&mut self, seq: SequenceNr, client: ClientId, conn: ConnId) {
        self.broker_resolves.insert(seq, (client, conn));
    }

    pub fn take_broker_resolve(&mut self, seq: SequenceNr) -> Option<ClientId> {
        self.broker_resolves.remove(&seq).map(|(client, _)| client)
    }

    /// Remove everything owned by a destroyed client context.
    ///
    /// Nothing is notified: the owner is gone, and a reply arriving later
    /// will miss the table and be dropped.
    pub fn purge_client(&mut self, client: ClientId) {
        self.requests.retain(|_, p| p.client() != Some(client));
        self.signal_regs.retain(|_, p| p.client != client);
        self.iface_resolves.retain(|_, (c, _)| *c != client);
        self.broker_resolves.retain(|_, (c, _)| *c != client);
    }

    /// Remove everything riding on a torn-down connection.
    pub fn purge_conn(&mut self, conn: ConnId) -> PurgeOutcome {
        let mut outcome = PurgeOutcome::default();

        let dead: Vec<SequenceNr> = self
            .requests
            .iter()
            .filter(|(_, p)| p.conn() == conn)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in dead {
            if let Some(pending) = self.requests.remove(&seq) {
                outcome.requests.push((seq, pending));
            }
        }

        let before = self.signal_regs.len();
        self.signal_regs.retain(|_, p| p.conn != conn);
        outcome.signal_regs = before - self.signal_regs.len();

        for table in [&mut self.iface_resolves, &mut self.broker_resolves] {
            let dead: Vec<SequenceNr> = table
                .iter()
                .filter(|(_, (_, c))| *c == conn)
                .map(|(seq, _)| *seq)
                .collect();
            for seq in dead {
                if let Some((client, _)) = table.remove(&seq) {
                    outcome.resolves.push(client);
                }
            }
        }

        outcome
    }

    pub fn outstanding(&self) -> usize {
        self.requests.len()
    }
}
