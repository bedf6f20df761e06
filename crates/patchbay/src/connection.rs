//! Connection bookkeeping and the loop event types.
//!
//! Only the dispatcher's pump touches the tables. Each connection gets a
//! small spawned reader task that owns the read half and forwards decoded
//! frames (or the hangup) into the loop's event channel; the dispatcher
//! keeps the write half. Listener accept loops feed the same channel.
//!
//! Connections are identified by a generated [`ConnId`], never by the OS
//! descriptor: descriptor numbers are reused by the kernel right after
//! close, so an event for a torn-down connection can only miss the table,
//! not hit a newer stranger.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use patchbay_core::{Frame, ReadSocket, Socket, TransportError, WriteSocket};

/// Identity of one connection for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub u32);

/// Client connection lifecycle, announced to the owning stub on every
/// transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Everything the pump reacts to.
pub(crate) enum LoopEvent {
    /// A listener accepted a socket.
    Incoming { socket: Socket },
    /// A reader task decoded one frame.
    Frame { conn: ConnId, frame: Frame },
    /// A reader task hit EOF or an error; the connection is dead.
    Hangup {
        conn: ConnId,
        error: Option<TransportError>,
    },
    /// An accept loop died; fatal for `run()`.
    ListenerError {
        endpoint: String,
        error: std::io::Error,
    },
    Control(Control),
}

/// Cross-thread control messages from [`crate::DispatcherHandle`].
pub(crate) enum Control {
    Stop,
    Wake,
}

pub(crate) struct Connection {
    pub writer: WriteSocket,
    reader: JoinHandle<()>,
    pub location: Option<String>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Spawn the reader task for a freshly registered connection.
pub(crate) fn spawn_reader(
    conn: ConnId,
    mut read: ReadSocket,
    tx: mpsc::Sender<LoopEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match read.recv().await {
                Ok(frame) => {
                    if tx.send(LoopEvent::Frame { conn, frame }).await.is_err() {
                        break;
                    }
                }
                Err(TransportError::Closed) => {
                    let _ = tx.send(LoopEvent::Hangup { conn, error: None }).await;
                    break;
                }
                Err(e) => {
                    let _ = tx
                        .send(LoopEvent::Hangup {
                            conn,
                            error: Some(e),
                        })
                        .await;
                    break;
                }
            }
        }
    })
}

#[derive(Default)]
pub(crate) struct ConnTable {
    map: HashMap<ConnId, Connection>,
    /// Outbound connections cached by location string for reuse.
    by_location: HashMap<String, ConnId>,
}

impl ConnTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: ConnId, writer: WriteSocket, reader: JoinHandle<()>, location: Option<String>) {
        if let Some(loc) = &location {
            self.by_location.insert(loc.clone(), id);
        }
        self.map.insert(
            id,
            Connection {
                writer,
                reader,
                location,
            },
        );
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.map.get_mut(&id)
    }

    pub fn remove(&mut self, id: ConnId) -> Option<Connection> {
        let conn = self.map.remove(&id)?;
        if let Some(loc) = &conn.location {
            if self.by_location.get(loc) == Some(&id) {
                self.by_location.remove(loc);
            }
        }
        Some(conn)
    }

    pub fn by_location(&self, location: &str) -> Option<ConnId> {
        self.by_location.get(location).copied()
    }

    pub fn contains(&self, id: ConnId) -> bool {
        self.map.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}
