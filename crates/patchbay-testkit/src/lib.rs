//! patchbay-testkit: shared services and helpers for integration tests.
//!
//! The [`CounterService`] plays the server role in the scenarios: it echoes,
//! counts oneways globally and per connection session, emits a signal on
//! demand and can stop its dispatcher — everything the test suite needs a
//! skeleton collaborator for. The pack/unpack helpers stand in for the
//! external argument serializer; the core treats payloads as opaque bytes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Once;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::task::JoinHandle;

use patchbay::{CallContext, ConnId, Dispatcher, DispatcherHandle, ErrorCode, RunError, Service};

/// Interface name of the counter test service.
pub const COUNTER_INTERFACE: &str = "testkit.Counter";

/// Echo the argument payload back.
pub const METHOD_ECHO: u32 = 1;
/// Oneway: bump the global and per-session counters.
pub const METHOD_BUMP: u32 = 2;
/// Reply with the global bump count.
pub const METHOD_COUNT: u32 = 3;
/// Reply with the calling connection's session bump count.
pub const METHOD_SESSION_COUNT: u32 = 4;
/// Stop the hosting dispatcher.
pub const METHOD_STOP: u32 = 5;
/// Emit [`SIGNAL_TICK`] carrying the argument payload, then reply empty.
pub const METHOD_KICK: u32 = 6;

pub const SIGNAL_TICK: u32 = 1;

/// Install a test tracing subscriber once; `RUST_LOG` filters as usual.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

// ============================================================================
// Payload helpers (the tests' stand-in serializer)
// ============================================================================

pub fn pack_pair(i: i32, d: f64) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_i32_le(i);
    buf.put_f64_le(d);
    buf.freeze()
}

pub fn unpack_pair(mut payload: &[u8]) -> (i32, f64) {
    assert!(payload.len() >= 12, "pair payload too short");
    (payload.get_i32_le(), payload.get_f64_le())
}

pub fn pack_u32(value: u32) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u32_le(value);
    buf.freeze()
}

pub fn unpack_u32(mut payload: &[u8]) -> u32 {
    assert!(payload.len() >= 4, "u32 payload too short");
    payload.get_u32_le()
}

// ============================================================================
// Test service
// ============================================================================

/// The skeleton collaborator used by the integration scenarios.
pub struct CounterService {
    role: String,
    count: Arc<AtomicUsize>,
    /// Per-connection session ids for the session counters.
    sessions: HashMap<ConnId, u32>,
}

impl CounterService {
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            count: Arc::new(AtomicUsize::new(0)),
            sessions: HashMap::new(),
        }
    }

    /// Shared view of the global bump count, usable after the service moved
    /// into the dispatcher.
    pub fn counter(&self) -> Arc<AtomicUsize> {
        self.count.clone()
    }

    fn session_id(&mut self, ctx: &mut CallContext<'_>) -> u32 {
        match self.sessions.get(&ctx.conn()) {
            Some(&id) => id,
            None => {
                let id = ctx.generate_id();
                ctx.register_session(id, Box::new(0u32));
                self.sessions.insert(ctx.conn(), id);
                id
            }
        }
    }
}

impl Service for CounterService {
    fn interface(&self) -> &'static str {
        COUNTER_INTERFACE
    }

    fn role(&self) -> &str {
        &self.role
    }

    fn dispatch(&mut self, ctx: &mut CallContext<'_>, method: u32, args: &[u8]) {
        match method {
            METHOD_ECHO => ctx.reply(Bytes::copy_from_slice(args)),
            METHOD_BUMP => {
                self.count.fetch_add(1, Ordering::SeqCst);
                let session = self.session_id(ctx);
                if let Some(data) = ctx.session_data(session) {
                    if let Some(n) = data.downcast_mut::<u32>() {
                        *n += 1;
                    }
                }
            }
            METHOD_COUNT => ctx.reply(pack_u32(self.count.load(Ordering::SeqCst) as u32)),
            METHOD_SESSION_COUNT => {
                let session = self.session_id(ctx);
                let n = ctx
                    .session_data(session)
                    .and_then(|d| d.downcast_ref::<u32>().copied())
                    .unwrap_or(0);
                ctx.reply(pack_u32(n));
            }
            METHOD_STOP => {
                ctx.stop();
                if !ctx.is_oneway() {
                    ctx.reply(Bytes::new());
                }
            }
            METHOD_KICK => {
                ctx.emit(SIGNAL_TICK, Bytes::copy_from_slice(args));
                ctx.reply(Bytes::new());
            }
            other => ctx.reply_error(ErrorCode::Unimplemented, format!("method {other}")),
        }
    }
}

// ============================================================================
// Harness helpers
// ============================================================================

/// A fresh unix endpoint under a temp directory, alive as long as the value.
pub struct TempEndpoint {
    _dir: tempfile::TempDir,
    pub spec: String,
}

pub fn temp_endpoint(name: &str) -> TempEndpoint {
    let dir = tempfile::tempdir().expect("tempdir");
    let spec = format!("unix:{}", dir.path().join(name).display());
    TempEndpoint { _dir: dir, spec }
}

/// Run a dispatcher's loop in a task, returning its stop handle and the
/// join handle that yields the dispatcher back once the loop exits.
pub fn spawn_dispatcher(
    mut disp: Dispatcher,
) -> (
    DispatcherHandle,
    JoinHandle<(Dispatcher, Result<(), RunError>)>,
) {
    let handle = disp.handle();
    let task = tokio::spawn(async move {
        let result = disp.run().await;
        (disp, result)
    });
    (handle, task)
}

/// Stop a spawned dispatcher and get it back.
pub async fn stop_dispatcher(
    handle: &DispatcherHandle,
    task: JoinHandle<(Dispatcher, Result<(), RunError>)>,
) -> Dispatcher {
    handle.stop();
    let (disp, result) = task.await.expect("dispatcher task panicked");
    result.expect("dispatcher loop failed");
    disp
}
