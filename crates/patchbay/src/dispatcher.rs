//! The Dispatcher: one process-wide event loop owning every socket.
//!
//! # Architecture
//!
//! ```text
//!   accept loop (per endpoint)      reader task (per connection)
//!         │ Incoming{socket}               │ Frame / Hangup
//!         └──────────────┬─────────────────┘
//!                        ▼
//!              bounded mpsc event channel ◄── DispatcherHandle (Stop/Wake)
//!                        │
//!                  pump (&mut self)
//!                        │
//!    ┌────────────┬──────┴───────┬───────────────┬──────────────┐
//!    │            │              │               │              │
//! request      response       signal          resolve        hangup
//! (registry    (correlation   (handler/       (state         (teardown:
//!  dispatch)    match)         emitter         machine)       sessions,
//!                              tables)                        waiters,
//!                                                             bindings)
//! ```
//!
//! Every table mutation and handler invocation happens on the task that
//! pumps the loop; spawned tasks own nothing but a socket half and a channel
//! sender. The pump runs in one of three modes: [`Dispatcher::run`] until
//! stopped, [`Dispatcher::loop_until`] until one specific response arrives,
//! or [`Dispatcher::once`] for a single externally driven pass. Blocking
//! waits must not nest; doing so is an integration bug and panics.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use patchbay_core::{
    AttachError, CallError, ConnectError, EndpointParseError, EndpointSpec, ErrorCode, Frame,
    Listener, RuntimeError, SequenceNr, Socket, TransportError, INVALID_HANDLER_ID,
    INVALID_SEQUENCE_NR,
};

use crate::broker::{
    decode_resolve_reply, encode_register, encode_resolve, BrokerClient, BrokerDirectory,
    BROKER_METHOD_REGISTER, BROKER_METHOD_RESOLVE, BROKER_SERVER_ID,
};
use crate::connection::{spawn_reader, ConnId, ConnTable, ConnectionState, Control, LoopEvent};
use crate::correlate::{CorrelationEngine, PendingRequest, PendingSignal};
use crate::registry::{full_qualified_name, ClientBinding, ClientId, ServerId, ServiceRegistry};
use crate::service::{CallContext, Service};
use crate::session::SessionStore;
use crate::signals::{ClientSignalEntry, SignalRouter, Subscription};
use crate::FIRST_DYNAMIC_ID;

const DEFAULT_MAX_PENDING: usize = 1024;

fn max_pending() -> usize {
    std::env::var("PATCHBAY_MAX_PENDING")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_MAX_PENDING)
}

/// Tuning knobs; the defaults suit a typical service process.
#[derive(Debug, Clone)]
pub struct Config {
    /// Accepted + outbound connections; sockets beyond this are refused.
    pub max_connections: usize,
    /// Simultaneously outstanding requests; more are refused as saturated.
    pub max_pending: usize,
    /// Depth of the loop event channel.
    pub event_queue_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_connections: 64,
            max_pending: max_pending(),
            event_queue_depth: 256,
        }
    }
}

/// Fatal loop failures reported by [`Dispatcher::run`].
#[derive(Debug)]
pub enum RunError {
    /// An endpoint's accept loop died.
    Listener {
        endpoint: String,
        error: std::io::Error,
    },
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Listener { endpoint, error } => {
                write!(f, "listener on {endpoint} failed: {error}")
            }
        }
    }
}

impl std::error::Error for RunError {}

/// Cloneable cross-thread handle to a running dispatcher.
///
/// This is the only supported cross-thread interaction: requesting a stop or
/// waking the loop. Request submission stays on the loop's own thread.
#[derive(Clone)]
pub struct DispatcherHandle {
    tx: mpsc::Sender<LoopEvent>,
    running: Arc<AtomicBool>,
}

impl DispatcherHandle {
    /// Stop the loop; wakes it if it is idle.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let _ = self.tx.try_send(LoopEvent::Control(Control::Stop));
    }

    /// Wake the loop without stopping it.
    pub fn wake(&self) {
        let _ = self.tx.try_send(LoopEvent::Control(Control::Wake));
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// The process-wide IPC engine. See the module docs for the shape.
pub struct Dispatcher {
    cfg: Config,
    endpoints: Vec<EndpointSpec>,
    listeners: Vec<JoinHandle<()>>,
    registry: ServiceRegistry,
    correlate: CorrelationEngine,
    sessions: SessionStore,
    signals: SignalRouter,
    conns: ConnTable,
    broker: Option<BrokerClient>,
    events_tx: mpsc::Sender<LoopEvent>,
    events_rx: mpsc::Receiver<LoopEvent>,
    running: Arc<AtomicBool>,
    /// True while run/once/loop_until is pumping; guards against nesting.
    pumping: bool,
    /// Outcome for the blocking waiter, set by the pump internals.
    blocking_outcome: Option<(SequenceNr, Result<Bytes, CallError>)>,
    fatal: Option<RunError>,
    next_id: u32,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(cfg: Config) -> Self {
        let (events_tx, events_rx) = mpsc::channel(cfg.event_queue_depth);
        Self {
            correlate: CorrelationEngine::new(cfg.max_pending),
            cfg,
            endpoints: Vec::new(),
            listeners: Vec::new(),
            registry: ServiceRegistry::new(),
            sessions: SessionStore::new(),
            signals: SignalRouter::new(),
            conns: ConnTable::new(),
            broker: None,
            events_tx,
            events_rx,
            running: Arc::new(AtomicBool::new(false)),
            pumping: false,
            blocking_outcome: None,
            fatal: None,
            next_id: FIRST_DYNAMIC_ID,
        }
    }

    /// Cross-thread stop/wake handle.
    pub fn handle(&self) -> DispatcherHandle {
        DispatcherHandle {
            tx: self.events_tx.clone(),
            running: self.running.clone(),
        }
    }

    /// Fresh id for servers, clients, connections, handlers and sessions.
    pub fn generate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = id.checked_add(1).unwrap_or(FIRST_DYNAMIC_ID);
        id
    }

    /// Next request/registration sequence number.
    pub fn generate_sequence_nr(&mut self) -> SequenceNr {
        self.correlate.generate_sequence_nr()
    }

    /// Compute the registered name for an interface + role pair.
    pub fn full_qualified_name(interface: &str, role: &str) -> String {
        full_qualified_name(interface, role)
    }

    // ========================================================================
    // Endpoints and brokerage
    // ========================================================================

    /// Attach a transport endpoint, e.g. `unix:/run/calc.sock` or
    /// `tcp:127.0.0.1:8888`. The first attached endpoint is the primary one
    /// announced to the broker. Several endpoints may be attached; they all
    /// multiplex into the same loop.
    pub async fn attach(&mut self, endpoint: &str) -> Result<(), AttachError> {
        let spec: EndpointSpec = endpoint.parse()?;
        let listener = Listener::bind(&spec).await?;
        tracing::info!(endpoint = %spec, "endpoint attached");

        let tx = self.events_tx.clone();
        let label = spec.to_string();
        self.listeners.push(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok(socket) => {
                        if tx.send(LoopEvent::Incoming { socket }).await.is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        let _ = tx
                            .send(LoopEvent::ListenerError {
                                endpoint: label.clone(),
                                error,
                            })
                            .await;
                        break;
                    }
                }
            }
        }));
        self.endpoints.push(spec);
        Ok(())
    }

    /// Enable name registration and resolution through the broker reachable
    /// at `endpoint`. The connection is opened lazily on first use.
    pub fn enable_brokerage(&mut self, endpoint: &str) -> Result<(), EndpointParseError> {
        let spec: EndpointSpec = endpoint.parse()?;
        tracing::info!(broker = %spec, "brokerage enabled");
        self.broker = Some(BrokerClient {
            endpoint: spec,
            conn: None,
        });
        Ok(())
    }

    // ========================================================================
    // Servers and clients
    // ========================================================================

    /// Register a server instance.
    ///
    /// # Panics
    ///
    /// Panics when no endpoint is attached yet or the fully-qualified name
    /// is already taken — both are integration bugs, not runtime conditions.
    pub async fn add_server(&mut self, service: Box<dyn Service>) -> ServerId {
        assert!(
            !self.endpoints.is_empty(),
            "attach an endpoint before adding servers"
        );
        let name = full_qualified_name(service.interface(), service.role());
        assert!(
            self.registry.server_id_by_name(&name).is_none(),
            "server '{name}' is already registered"
        );

        let id = ServerId(self.generate_id());
        tracing::info!(%name, server_id = id.0, "server registered");
        self.registry.insert_server(name.clone(), id, service);

        if self.broker.is_some() {
            let endpoint = self.endpoints[0].to_string();
            self.announce_to_broker(&name, &endpoint).await;
        }
        id
    }

    /// Install the broker directory under its well-known id.
    ///
    /// # Panics
    ///
    /// Panics when no endpoint is attached yet.
    pub fn serve_broker(&mut self, directory: BrokerDirectory) {
        assert!(
            !self.endpoints.is_empty(),
            "attach an endpoint before serving the broker"
        );
        let name = full_qualified_name(directory.interface(), directory.role());
        tracing::info!(%name, server_id = BROKER_SERVER_ID, "broker directory serving");
        self.registry
            .insert_server(name, ServerId(BROKER_SERVER_ID), Box::new(directory));
    }

    /// Register a client stub's interest in `role` of `interface`.
    ///
    /// The service location is resolved at connect time: locally if this
    /// process hosts the name, through the broker otherwise. `on_state` is
    /// invoked on every connection state transition.
    pub fn add_client(
        &mut self,
        interface: &str,
        role: &str,
        on_state: impl FnMut(ConnectionState) + Send + 'static,
    ) -> ClientId {
        self.register_client(interface, role, None, on_state)
    }

    /// Like [`Dispatcher::add_client`], but with an explicit service
    /// location (e.g. `unix:/run/calc.sock`), skipping resolution.
    pub fn add_client_at(
        &mut self,
        interface: &str,
        role: &str,
        location: &str,
        on_state: impl FnMut(ConnectionState) + Send + 'static,
    ) -> ClientId {
        self.register_client(interface, role, Some(location.to_string()), on_state)
    }

    fn register_client(
        &mut self,
        interface: &str,
        role: &str,
        location: Option<String>,
        on_state: impl FnMut(ConnectionState) + Send + 'static,
    ) -> ClientId {
        let id = ClientId(self.generate_id());
        let fqn = full_qualified_name(interface, role);
        tracing::debug!(client = id.0, %fqn, "client registered");
        self.registry.add_client(
            id,
            ClientBinding {
                role: role.to_string(),
                fqn,
                location,
                state: ConnectionState::Disconnected,
                conn: None,
                server_id: None,
                connect_failure: None,
                on_state: Box::new(on_state),
            },
        );
        id
    }

    /// Tear a client context down.
    ///
    /// Every outstanding entry owned by the client is removed first, so a
    /// reply arriving later cannot reach a destroyed handler.
    pub async fn remove_client(&mut self, client: ClientId) {
        self.correlate.purge_client(client);
        let stale = self.signals.purge_client(client);
        for (handler_id, conn) in stale {
            let _ = self
                .send_to_conn(conn, &Frame::SignalUnregister { handler_id })
                .await;
        }
        if self.registry.remove_client(client).is_some() {
            tracing::debug!(client = client.0, "client removed");
        }
    }

    /// Current state of a client binding.
    pub fn connection_state(&self, client: ClientId) -> Option<ConnectionState> {
        self.registry.client(client).map(|b| b.state)
    }

    // ========================================================================
    // Connecting
    // ========================================================================

    /// Start connecting a client to its service; completion is announced
    /// through the binding's state callback while the loop pumps.
    pub async fn connect(&mut self, client: ClientId) -> Result<(), ConnectError> {
        self.start_connect(client).await
    }

    /// Connect and pump the loop until the handshake settles or `timeout`
    /// elapses.
    pub async fn connect_blocking(
        &mut self,
        client: ClientId,
        timeout: Duration,
    ) -> Result<(), ConnectError> {
        self.start_connect(client).await?;
        self.wait_connected(client, timeout).await
    }

    async fn start_connect(&mut self, client: ClientId) -> Result<(), ConnectError> {
        let binding = self
            .registry
            .client_mut(client)
            .unwrap_or_else(|| panic!("connect on unknown client {}", client.0));
        let fqn = binding.fqn.clone();
        let pinned = binding.location.clone();
        binding.connect_failure = None;
        self.set_state(client, ConnectionState::Connecting);

        // A stub constructed with an explicit location goes straight there.
        if let Some(location) = pinned {
            return self.continue_connect(client, &location).await;
        }

        // Local short-circuit: the service lives in this process, so connect
        // straight to our own primary endpoint, no broker round-trip.
        if self.registry.server_id_by_name(&fqn).is_some() {
            let location = match self.endpoints.first() {
                Some(spec) => spec.to_string(),
                None => {
                    self.fail_connect(client, ConnectError::NotFound);
                    return Err(ConnectError::NotFound);
                }
            };
            return self.continue_connect(client, &location).await;
        }

        // Remote: ask the broker where the name lives. The reply continues
        // the handshake from inside the loop.
        let conn = match self.ensure_broker_conn().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(client = client.0, %fqn, error = %e, "connect failed: no broker route");
                self.fail_connect(client, e);
                return Err(e);
            }
        };
        let seq = self.correlate.generate_sequence_nr();
        self.correlate.add_broker_resolve(seq, client, conn);
        let frame = Frame::Request {
            server_id: BROKER_SERVER_ID,
            method: BROKER_METHOD_RESOLVE,
            seq,
            args: encode_resolve(&fqn),
        };
        if self.send_to_conn(conn, &frame).await.is_err() {
            self.correlate.take_broker_resolve(seq);
            self.fail_connect(client, ConnectError::BrokerUnavailable);
            return Err(ConnectError::BrokerUnavailable);
        }
        tracing::debug!(client = client.0, %fqn, seq, "broker resolve sent");
        Ok(())
    }

    /// Location known; open or reuse the socket and start the interface
    /// resolution handshake.
    async fn continue_connect(
        &mut self,
        client: ClientId,
        location: &str,
    ) -> Result<(), ConnectError> {
        let conn = match self.conns.by_location(location) {
            Some(conn) => conn,
            None => {
                let spec: EndpointSpec = match location.parse() {
                    Ok(spec) => spec,
                    Err(e) => {
                        tracing::warn!(%location, error = %e, "unusable service location");
                        self.fail_connect(client, ConnectError::Transport);
                        return Err(ConnectError::Transport);
                    }
                };
                let socket = match Socket::connect(&spec).await {
                    Ok(socket) => socket,
                    Err(e) => {
                        tracing::warn!(%location, error = %e, "connect failed");
                        self.fail_connect(client, ConnectError::Transport);
                        return Err(ConnectError::Transport);
                    }
                };
                match self.socket_connected(socket, Some(location.to_string())) {
                    Some(conn) => conn,
                    None => {
                        self.fail_connect(client, ConnectError::Transport);
                        return Err(ConnectError::Transport);
                    }
                }
            }
        };

        let fqn = match self.registry.client_mut(client) {
            Some(binding) => {
                binding.conn = Some(conn);
                binding.fqn.clone()
            }
            None => return Err(ConnectError::NotFound),
        };

        let seq = self.correlate.generate_sequence_nr();
        self.correlate.add_iface_resolve(seq, client, conn);
        let frame = Frame::InterfaceResolve {
            name: fqn.clone(),
            seq,
        };
        if self.send_to_conn(conn, &frame).await.is_err() {
            self.correlate.take_iface_resolve(seq);
            self.fail_connect(client, ConnectError::Transport);
            return Err(ConnectError::Transport);
        }
        tracing::debug!(client = client.0, %fqn, seq, "interface resolve sent");
        Ok(())
    }

    /// Pump until the client's state machine leaves Connecting.
    async fn wait_connected(
        &mut self,
        client: ClientId,
        timeout: Duration,
    ) -> Result<(), ConnectError> {
        assert!(!self.pumping, "blocking waits may not be nested");
        self.pumping = true;
        let deadline = Instant::now() + timeout;

        let result = loop {
            match self.registry.client_mut(client) {
                Some(binding) => match binding.state {
                    ConnectionState::Connected => break Ok(()),
                    ConnectionState::Disconnected => {
                        break Err(binding
                            .connect_failure
                            .take()
                            .unwrap_or(ConnectError::NotFound))
                    }
                    ConnectionState::Connecting => {}
                },
                None => break Err(ConnectError::NotFound),
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                break Err(ConnectError::Timeout);
            };
            match tokio::time::timeout(remaining, self.events_rx.recv()).await {
                Ok(Some(event)) => {
                    if let Some((seq, _)) = self.dispatch_event(event).await {
                        tracing::debug!(seq, "blocking outcome with no waiter, dropping");
                    }
                    if self.fatal.is_some() {
                        break Err(ConnectError::Transport);
                    }
                }
                Ok(None) => break Err(ConnectError::Transport),
                Err(_) => break Err(ConnectError::Timeout),
            }
        };

        self.pumping = false;
        if let Err(reason) = result {
            // Idempotent when the failure path already cleaned up.
            self.correlate.purge_client(client);
            self.fail_connect(client, reason);
        }
        result
    }

    async fn ensure_broker_conn(&mut self) -> Result<ConnId, ConnectError> {
        let Some(broker) = &self.broker else {
            return Err(ConnectError::BrokerUnavailable);
        };
        if let Some(conn) = broker.conn {
            if self.conns.contains(conn) {
                return Ok(conn);
            }
        }
        let spec = broker.endpoint.clone();
        let socket = match Socket::connect(&spec).await {
            Ok(socket) => socket,
            Err(e) => {
                tracing::warn!(broker = %spec, error = %e, "broker unreachable");
                return Err(ConnectError::BrokerUnavailable);
            }
        };
        let conn = self
            .socket_connected(socket, Some(format!("broker:{spec}")))
            .ok_or(ConnectError::BrokerUnavailable)?;
        if let Some(broker) = self.broker.as_mut() {
            broker.conn = Some(conn);
        }
        Ok(conn)
    }

    async fn announce_to_broker(&mut self, name: &str, endpoint: &str) {
        let conn = match self.ensure_broker_conn().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(%name, error = %e, "broker registration skipped");
                return;
            }
        };
        let frame = Frame::Request {
            server_id: BROKER_SERVER_ID,
            method: BROKER_METHOD_REGISTER,
            seq: INVALID_SEQUENCE_NR,
            args: encode_register(name, endpoint),
        };
        if self.send_to_conn(conn, &frame).await.is_err() {
            tracing::warn!(%name, "broker registration lost");
        } else {
            tracing::debug!(%name, %endpoint, "registered at broker");
        }
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Send a request and pump the loop until its response arrives.
    ///
    /// The raw result payload is returned; deserialization is the stub
    /// layer's business.
    pub async fn call(
        &mut self,
        client: ClientId,
        method: u32,
        args: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Bytes, CallError> {
        let (conn, server_id) = self.client_route(client)?;
        let seq = self.correlate.generate_sequence_nr();
        self.correlate.add_request(
            seq,
            PendingRequest::Blocking {
                client: Some(client),
                conn,
            },
        )?;
        let frame = Frame::Request {
            server_id,
            method,
            seq,
            args: args.into(),
        };
        if self.send_to_conn(conn, &frame).await.is_err() {
            self.correlate.remove_request(seq);
            return Err(CallError::Transport);
        }
        self.loop_until(seq, timeout).await
    }

    /// Send a request whose response is delivered to `on_response` from the
    /// loop. Returns the sequence number for [`Dispatcher::abandon_request`].
    pub async fn send_request(
        &mut self,
        client: ClientId,
        method: u32,
        args: impl Into<Bytes>,
        on_response: impl FnOnce(Result<Bytes, CallError>) + Send + 'static,
    ) -> Result<SequenceNr, CallError> {
        let (conn, server_id) = self.client_route(client)?;
        let seq = self.correlate.generate_sequence_nr();
        self.correlate.add_request(
            seq,
            PendingRequest::Callback {
                client,
                conn,
                handler: Box::new(on_response),
            },
        )?;
        let frame = Frame::Request {
            server_id,
            method,
            seq,
            args: args.into(),
        };
        if self.send_to_conn(conn, &frame).await.is_err() {
            self.correlate.remove_request(seq);
            return Err(CallError::Transport);
        }
        Ok(seq)
    }

    /// Discard an outstanding request; its response becomes a stale reply.
    pub fn abandon_request(&mut self, seq: SequenceNr) -> bool {
        self.correlate.remove_request(seq).is_some()
    }

    /// Fire-and-forget request; carries the invalid sequence number, so the
    /// peer sends no response.
    pub async fn send_oneway(
        &mut self,
        client: ClientId,
        method: u32,
        args: impl Into<Bytes>,
    ) -> Result<(), CallError> {
        let (conn, server_id) = self.client_route(client)?;
        let frame = Frame::Request {
            server_id,
            method,
            seq: INVALID_SEQUENCE_NR,
            args: args.into(),
        };
        self.send_to_conn(conn, &frame)
            .await
            .map_err(|_| CallError::Transport)
    }

    fn client_route(&self, client: ClientId) -> Result<(ConnId, u32), CallError> {
        let binding = self.registry.client(client).ok_or(CallError::NotConnected)?;
        match (binding.state, binding.conn, binding.server_id) {
            (ConnectionState::Connected, Some(conn), Some(server_id)) => Ok((conn, server_id)),
            _ => Err(CallError::NotConnected),
        }
    }

    // ========================================================================
    // Signals
    // ========================================================================

    /// Start a signal subscription handshake; `handler` runs on the loop for
    /// every emission once the peer acks.
    pub async fn subscribe_signal(
        &mut self,
        client: ClientId,
        signal: u32,
        handler: impl FnMut(&[u8]) + Send + 'static,
    ) -> Result<SequenceNr, CallError> {
        let (conn, server_id) = self.client_route(client)?;
        let seq = self.correlate.generate_sequence_nr();
        self.correlate.add_signal_registration(
            seq,
            PendingSignal {
                client,
                conn,
                signal,
                handler: Box::new(handler),
            },
        );
        let frame = Frame::SignalRegister {
            server_id,
            signal,
            seq,
        };
        if self.send_to_conn(conn, &frame).await.is_err() {
            self.correlate.remove_signal_registration(seq);
            return Err(CallError::Transport);
        }
        tracing::debug!(client = client.0, signal, seq, "signal registration sent");
        Ok(seq)
    }

    /// Cancel a handshake-phase signal registration.
    ///
    /// Returns `None` when the registration already completed or never
    /// existed — the benign race with a late ack, absorbed idempotently.
    pub fn remove_signal_registration(&mut self, seq: SequenceNr) -> Option<SequenceNr> {
        self.correlate.remove_signal_registration(seq).map(|_| seq)
    }

    /// Drop every live subscription of `client` for `signal` and tell the
    /// emitting peers to stop. Returns how many were dropped.
    pub async fn unsubscribe_signal(&mut self, client: ClientId, signal: u32) -> usize {
        self.correlate.remove_signal_regs_for(client, signal);
        let removed = self.signals.remove_for(client, signal);
        let count = removed.len();
        for (handler_id, conn) in removed {
            let _ = self
                .send_to_conn(conn, &Frame::SignalUnregister { handler_id })
                .await;
        }
        tracing::debug!(client = client.0, signal, count, "unsubscribed");
        count
    }

    /// Emit a signal to every current subscriber, in subscription order.
    ///
    /// Skeleton handlers running inside a dispatch use
    /// [`CallContext::emit`] instead.
    pub async fn emit_signal(&mut self, server: ServerId, signal: u32, args: impl Into<Bytes>) {
        let args = args.into();
        let subscribers: Vec<Subscription> = self.signals.subscribers(server, signal).to_vec();
        for sub in subscribers {
            let frame = Frame::SignalEmit {
                handler_id: sub.handler_id,
                args: args.clone(),
            };
            let _ = self.send_to_conn(sub.conn, &frame).await;
        }
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    /// Install session data owned by `conn`; dropped exactly once when the
    /// session is cleared or the connection goes down.
    pub fn register_session(
        &mut self,
        conn: ConnId,
        session_id: u32,
        data: Box<dyn std::any::Any + Send>,
    ) {
        self.sessions.register(conn, session_id, data);
    }

    /// Look session data up by id (never by descriptor).
    pub fn session_data(&mut self, session_id: u32) -> Option<&mut (dyn std::any::Any + Send)> {
        self.sessions.data(session_id)
    }

    /// Clear one session, running its destructor.
    pub fn clear_session(&mut self, session_id: u32) -> bool {
        self.sessions.clear(session_id)
    }

    // ========================================================================
    // The pump
    // ========================================================================

    /// Run until [`Dispatcher::stop`] or a fatal listener error.
    pub async fn run(&mut self) -> Result<(), RunError> {
        assert!(
            !self.pumping,
            "run() may not be entered while the loop is pumping"
        );
        self.pumping = true;
        self.running.store(true, Ordering::Release);
        tracing::debug!("dispatcher running");

        while self.running.load(Ordering::Acquire) {
            let Some(event) = self.events_rx.recv().await else {
                break;
            };
            if let Some((seq, _)) = self.dispatch_event(event).await {
                tracing::debug!(seq, "blocking outcome with no waiter, dropping");
            }
        }

        self.pumping = false;
        self.running.store(false, Ordering::Release);
        tracing::debug!("dispatcher stopped");
        match self.fatal.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// One cooperative pass: handle at most one event within `timeout`.
    ///
    /// Returns true when an event was handled. Useful for embedding the
    /// dispatcher in an externally driven loop.
    pub async fn once(&mut self, timeout: Duration) -> bool {
        assert!(!self.pumping, "once() may not be nested in a blocking wait");
        self.pumping = true;
        let handled = match tokio::time::timeout(timeout, self.events_rx.recv()).await {
            Ok(Some(event)) => {
                if let Some((seq, _)) = self.dispatch_event(event).await {
                    tracing::debug!(seq, "blocking outcome with no waiter, dropping");
                }
                true
            }
            Ok(None) | Err(_) => false,
        };
        self.pumping = false;
        handled
    }

    /// Pump the loop until the response for `target` arrives, returning its
    /// raw payload, or fail with timeout/transport/runtime.
    ///
    /// # Panics
    ///
    /// Panics when nested inside `run`, `once` or another blocking wait —
    /// the multiplexing state is not reentrant.
    pub async fn loop_until(
        &mut self,
        target: SequenceNr,
        timeout: Duration,
    ) -> Result<Bytes, CallError> {
        assert_ne!(
            target, INVALID_SEQUENCE_NR,
            "cannot wait for the invalid sequence number"
        );
        assert!(!self.pumping, "blocking waits may not be nested");
        self.pumping = true;
        let deadline = Instant::now() + timeout;

        let result = loop {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                break Err(CallError::Timeout);
            };
            match tokio::time::timeout(remaining, self.events_rx.recv()).await {
                Ok(Some(event)) => {
                    if let Some((seq, outcome)) = self.dispatch_event(event).await {
                        if seq == target {
                            break outcome;
                        }
                        tracing::debug!(seq, target, "blocking outcome for other sequence, dropping");
                    }
                    if self.fatal.is_some() {
                        break Err(CallError::Transport);
                    }
                }
                Ok(None) => break Err(CallError::Transport),
                Err(_) => break Err(CallError::Timeout),
            }
        };

        self.pumping = false;
        if result.is_err() {
            // Discard locally; the late reply will miss the table and be
            // dropped as stale.
            self.correlate.remove_request(target);
            tracing::debug!(
                seq = target,
                outstanding = self.correlate.outstanding(),
                "cooperative wait failed, request discarded"
            );
        }
        result
    }

    /// Ask the loop to stop after the event it is currently handling.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let _ = self.events_tx.try_send(LoopEvent::Control(Control::Stop));
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Handle one loop event; returns the outcome for a blocking waiter if
    /// this event settled one.
    async fn dispatch_event(
        &mut self,
        event: LoopEvent,
    ) -> Option<(SequenceNr, Result<Bytes, CallError>)> {
        match event {
            LoopEvent::Incoming { socket } => {
                self.socket_connected(socket, None);
            }
            LoopEvent::Frame { conn, frame } => {
                self.handle_frame(conn, frame).await;
            }
            LoopEvent::Hangup { conn, error } => {
                if let Some(error) = &error {
                    tracing::warn!(conn = conn.0, %error, "connection error");
                }
                self.socket_disconnected(conn);
            }
            LoopEvent::ListenerError { endpoint, error } => {
                tracing::error!(%endpoint, %error, "listener failed; stopping");
                self.fatal = Some(RunError::Listener { endpoint, error });
                self.running.store(false, Ordering::Release);
            }
            LoopEvent::Control(Control::Stop) => {
                self.running.store(false, Ordering::Release);
            }
            LoopEvent::Control(Control::Wake) => {}
        }
        self.blocking_outcome.take()
    }

    /// Register a freshly connected socket, refusing past the connection cap.
    fn socket_connected(&mut self, socket: Socket, location: Option<String>) -> Option<ConnId> {
        if self.conns.len() >= self.cfg.max_connections {
            tracing::warn!(
                max_connections = self.cfg.max_connections,
                "connection limit reached; refusing socket"
            );
            return None;
        }
        let conn = ConnId(self.generate_id());
        let (read, write) = socket.into_split();
        let reader = spawn_reader(conn, read, self.events_tx.clone());
        self.conns.insert(conn, write, reader, location);
        tracing::debug!(conn = conn.0, "socket connected");
        Some(conn)
    }

    /// Tear one connection down: sessions, outstanding entries, signal
    /// routes and client state machines riding on it.
    fn socket_disconnected(&mut self, conn: ConnId) {
        let Some(connection) = self.conns.remove(conn) else {
            // Reader hangup after a write failure already tore it down.
            return;
        };
        drop(connection);
        tracing::info!(conn = conn.0, "socket disconnected");

        let cleared = self.sessions.clear_for_conn(conn);
        if cleared > 0 {
            tracing::debug!(
                conn = conn.0,
                cleared,
                remaining = self.sessions.len(),
                "sessions torn down"
            );
        }
        self.signals.purge_conn(conn);

        if let Some(broker) = self.broker.as_mut() {
            if broker.conn == Some(conn) {
                broker.conn = None;
                tracing::warn!("broker connection lost");
            }
        }

        let purged = self.correlate.purge_conn(conn);
        if purged.signal_regs > 0 {
            tracing::debug!(
                conn = conn.0,
                count = purged.signal_regs,
                "pending signal registrations dropped"
            );
        }
        for (seq, pending) in purged.requests {
            match pending {
                PendingRequest::Blocking { .. } => {
                    self.blocking_outcome = Some((seq, Err(CallError::Transport)));
                }
                PendingRequest::Callback { handler, .. } => handler(Err(CallError::Transport)),
            }
        }
        for client in purged.resolves {
            self.fail_connect(client, ConnectError::Transport);
        }

        for client in self.registry.clients_on_conn(conn) {
            if let Some(binding) = self.registry.client_mut(client) {
                binding.conn = None;
                binding.server_id = None;
                if binding.state == ConnectionState::Connecting {
                    binding.connect_failure = Some(ConnectError::Transport);
                }
            }
            self.set_state(client, ConnectionState::Disconnected);
        }
    }

    async fn handle_frame(&mut self, conn: ConnId, frame: Frame) {
        tracing::debug!(conn = conn.0, kind = frame.kind(), "frame received");
        match frame {
            Frame::Request {
                server_id,
                method,
                seq,
                args,
            } => self.handle_request(conn, server_id, method, seq, args).await,
            Frame::Response { seq, result } => self.handle_response(seq, result).await,
            Frame::SignalRegister {
                server_id,
                signal,
                seq,
            } => self.handle_signal_register(conn, server_id, signal, seq).await,
            Frame::SignalRegisterAck { seq, handler_id } => {
                self.handle_signal_register_ack(seq, handler_id)
            }
            Frame::SignalUnregister { handler_id } => {
                if !self.signals.remove_subscriber(handler_id) {
                    tracing::debug!(handler_id, "unregister for unknown subscription, dropping");
                }
            }
            Frame::SignalEmit { handler_id, args } => {
                if !self.signals.deliver(handler_id, &args) {
                    tracing::debug!(handler_id, "emission for unknown handler, dropping");
                }
            }
            Frame::InterfaceResolve { name, seq } => {
                let server_id = self.registry.server_id_by_name(&name).map(|id| id.0);
                if server_id.is_none() {
                    tracing::debug!(%name, "resolve for a name not hosted here");
                }
                let _ = self
                    .send_to_conn(conn, &Frame::InterfaceResolveAck { seq, server_id })
                    .await;
            }
            Frame::InterfaceResolveAck { seq, server_id } => {
                self.handle_iface_resolve_ack(seq, server_id)
            }
        }
    }

    async fn handle_request(
        &mut self,
        conn: ConnId,
        server_id: u32,
        method: u32,
        seq: SequenceNr,
        args: Bytes,
    ) {
        let id = ServerId(server_id);
        let Some(mut service) = self.registry.take_service(id) else {
            let (code, message) = if self.registry.has_server(id) {
                (ErrorCode::FailedPrecondition, "server is busy")
            } else {
                (ErrorCode::NotFound, "no such server")
            };
            tracing::warn!(server_id, method, detail = message, "request not dispatchable");
            if seq != INVALID_SEQUENCE_NR {
                let frame = Frame::Response {
                    seq,
                    result: Err(RuntimeError::new(code, message)),
                };
                let _ = self.send_to_conn(conn, &frame).await;
            }
            return;
        };

        // A panicking handler must not take the loop down or leave the
        // caller hanging: answer with an internal error instead.
        //
        // The context borrows the signal/session tables; confine it to this
        // block so those borrows are released before the flush loop awaits
        // below (keeping `run()`'s future `Send`).
        let (mut out, replied, stop, panicked) = {
            let mut ctx = CallContext {
                seq,
                conn,
                server: id,
                out: Vec::new(),
                replied: false,
                stop: false,
                signals: &self.signals,
                sessions: &mut self.sessions,
                next_id: &mut self.next_id,
            };
            let panicked =
                catch_unwind(AssertUnwindSafe(|| service.dispatch(&mut ctx, method, &args)))
                    .is_err();
            let CallContext {
                out, replied, stop, ..
            } = ctx;
            (out, replied, stop, panicked)
        };
        self.registry.put_service(id, service);

        if panicked {
            tracing::error!(server_id, method, "service handler panicked");
            out.clear();
            if seq != INVALID_SEQUENCE_NR {
                out.push((
                    conn,
                    Frame::Response {
                        seq,
                        result: Err(RuntimeError::new(ErrorCode::Internal, "handler panicked")),
                    },
                ));
            }
        } else if seq != INVALID_SEQUENCE_NR && !replied {
            tracing::warn!(server_id, method, seq, "handler sent no response");
            out.push((
                conn,
                Frame::Response {
                    seq,
                    result: Err(RuntimeError::new(
                        ErrorCode::Unimplemented,
                        "no response for method",
                    )),
                },
            ));
        }

        for (target, frame) in out {
            let _ = self.send_to_conn(target, &frame).await;
        }
        if stop {
            tracing::debug!("stop requested by handler");
            self.running.store(false, Ordering::Release);
        }
    }

    async fn handle_response(&mut self, seq: SequenceNr, result: Result<Bytes, RuntimeError>) {
        // Broker resolutions continue the connect handshake right here.
        if let Some(client) = self.correlate.take_broker_resolve(seq) {
            self.handle_broker_resolve_reply(client, result).await;
            return;
        }

        match self.correlate.match_reply(seq) {
            None => {
                // Waiter timed out or its context was torn down; at-most-once
                // delivery means this reply just evaporates.
                tracing::debug!(seq, "stale or duplicate reply, dropping");
            }
            Some(PendingRequest::Blocking { .. }) => {
                self.blocking_outcome =
                    Some((seq, result.map_err(CallError::Runtime)));
            }
            Some(PendingRequest::Callback { handler, .. }) => {
                handler(result.map_err(CallError::Runtime));
            }
        }
    }

    async fn handle_broker_resolve_reply(
        &mut self,
        client: ClientId,
        result: Result<Bytes, RuntimeError>,
    ) {
        let location = match result {
            Ok(payload) => match decode_resolve_reply(payload) {
                Ok(Some(location)) => location,
                Ok(None) => {
                    tracing::debug!(client = client.0, "broker: name not registered");
                    self.fail_connect(client, ConnectError::NotFound);
                    return;
                }
                Err(e) => {
                    tracing::warn!(client = client.0, error = %e, "malformed broker reply");
                    self.fail_connect(client, ConnectError::BrokerUnavailable);
                    return;
                }
            },
            Err(e) => {
                tracing::warn!(client = client.0, error = %e, "broker resolve failed");
                self.fail_connect(client, ConnectError::BrokerUnavailable);
                return;
            }
        };
        tracing::debug!(client = client.0, %location, "broker resolved");
        let _ = self.continue_connect(client, &location).await;
    }

    async fn handle_signal_register(
        &mut self,
        conn: ConnId,
        server_id: u32,
        signal: u32,
        seq: SequenceNr,
    ) {
        let id = ServerId(server_id);
        let handler_id = if self.registry.has_server(id) {
            let handler_id = self.generate_id();
            self.signals.add_subscriber(
                id,
                signal,
                Subscription { conn, handler_id },
            );
            tracing::debug!(server_id, signal, handler_id, "signal subscriber added");
            handler_id
        } else {
            tracing::warn!(server_id, signal, "signal registration for unknown server");
            INVALID_HANDLER_ID
        };
        let _ = self
            .send_to_conn(conn, &Frame::SignalRegisterAck { seq, handler_id })
            .await;
    }

    fn handle_signal_register_ack(&mut self, seq: SequenceNr, handler_id: u32) {
        let Some(pending) = self.correlate.remove_signal_registration(seq) else {
            // Unsubscribed while the ack was in flight; absorbed.
            tracing::debug!(seq, "ack for unknown signal registration, dropping");
            return;
        };
        if handler_id == INVALID_HANDLER_ID {
            tracing::warn!(seq, "signal registration refused by peer");
            return;
        }
        tracing::debug!(seq, handler_id, "signal registration completed");
        self.signals.install(
            handler_id,
            ClientSignalEntry {
                client: pending.client,
                conn: pending.conn,
                signal: pending.signal,
                handler: pending.handler,
            },
        );
    }

    fn handle_iface_resolve_ack(&mut self, seq: SequenceNr, server_id: Option<u32>) {
        let Some(client) = self.correlate.take_iface_resolve(seq) else {
            tracing::debug!(seq, "stale interface resolution ack, dropping");
            return;
        };
        match server_id {
            Some(id) => {
                if let Some(binding) = self.registry.client_mut(client) {
                    binding.server_id = Some(id);
                }
                self.set_state(client, ConnectionState::Connected);
            }
            None => {
                tracing::debug!(client = client.0, "peer does not host the service");
                self.fail_connect(client, ConnectError::NotFound);
            }
        }
    }

    fn set_state(&mut self, client: ClientId, state: ConnectionState) {
        if let Some(binding) = self.registry.client_mut(client) {
            if binding.state != state {
                binding.state = state;
                tracing::debug!(client = client.0, ?state, "connection state changed");
                (binding.on_state)(state);
            }
        }
    }

    fn fail_connect(&mut self, client: ClientId, reason: ConnectError) {
        if let Some(binding) = self.registry.client_mut(client) {
            binding.connect_failure = Some(reason);
            binding.conn = None;
            binding.server_id = None;
        }
        self.set_state(client, ConnectionState::Disconnected);
    }

    /// Write one frame; a failed write tears the connection down.
    async fn send_to_conn(&mut self, conn: ConnId, frame: &Frame) -> Result<(), TransportError> {
        let Some(connection) = self.conns.get_mut(conn) else {
            tracing::debug!(conn = conn.0, kind = frame.kind(), "send on unknown connection");
            return Err(TransportError::Closed);
        };
        match connection.writer.send(frame).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(conn = conn.0, error = %e, "write failed; tearing down");
                self.socket_disconnected(conn);
                Err(e)
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        for listener in &self.listeners {
            listener.abort();
        }
    }
}
