//! Client sessions and their transport handles.
//!
//! A [`Connection`] is the writable half of one socket: an unbounded
//! channel drained by the connection's writer task, plus a closed flag.
//! A [`Session`] wraps the connection with routing identity (the bound
//! JID), lifecycle state, traffic counters and an embedded XEP-0198
//! [`StreamManager`].
//!
//! Close is idempotent and cascading: closing the session closes the
//! connection, which wakes the writer task, which drops its end of the
//! socket.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::jid::Jid;
use crate::sm::StreamManager;
use crate::stanza::Stanza;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Stream open, not yet authenticated.
    Connecting,
    /// Authenticated and bound to a resource; eligible for routing.
    Authenticated,
    /// Teardown in progress: routes being removed, unacked stanzas
    /// being released.
    Closing,
    Closed,
}

/// Writable half of one accepted socket.
pub struct Connection {
    tx: Mutex<Option<UnboundedSender<String>>>,
    closed: AtomicBool,
}

impl Connection {
    /// Create a connection and the receiver its writer task drains.
    pub fn new() -> (Connection, UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Connection {
                tx: Mutex::new(Some(tx)),
                closed: AtomicBool::new(false),
            },
            rx,
        )
    }

    /// Queue raw XML for the writer task. Fails once the connection is
    /// closed or the writer task is gone.
    pub fn deliver_raw_text(&self, text: &str) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Delivery("connection closed".to_string()));
        }
        let guard = self.tx.lock();
        match guard.as_ref() {
            Some(tx) => tx
                .send(text.to_string())
                .map_err(|_| Error::Delivery("writer task gone".to_string())),
            None => Err(Error::Delivery("connection closed".to_string())),
        }
    }

    /// Close the connection. Safe to call any number of times; the first
    /// call drops the sender so the writer task drains and exits.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.tx.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

pub struct Session {
    stream_id: String,
    address: RwLock<Jid>,
    state: Mutex<SessionState>,
    conn: Arc<Connection>,
    sm: StreamManager,
    client_packet_count: AtomicU64,
    server_packet_count: AtomicU64,
}

impl Session {
    /// Create a session for a freshly accepted stream. Returns the session
    /// and the receiver for its writer task.
    pub fn new(address: Jid, config: Arc<Config>) -> (Arc<Session>, UnboundedReceiver<String>) {
        let (conn, rx) = Connection::new();
        let conn = Arc::new(conn);
        let session = Arc::new(Session {
            stream_id: new_stream_id(),
            address: RwLock::new(address),
            state: Mutex::new(SessionState::Connecting),
            sm: StreamManager::new(conn.clone(), config),
            conn,
            client_packet_count: AtomicU64::new(0),
            server_packet_count: AtomicU64::new(0),
        });
        (session, rx)
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn address(&self) -> Jid {
        self.address.read().clone()
    }

    /// Rebind the session address (resource binding, session upgrade).
    pub fn set_address(&self, address: Jid) {
        *self.address.write() = address;
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn set_authenticated(&self) {
        let mut state = self.state.lock();
        if *state == SessionState::Connecting {
            *state = SessionState::Authenticated;
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn stream_manager(&self) -> &StreamManager {
        &self.sm
    }

    /// Deliver a stanza to this session's peer. Counts the send and, when
    /// stream management is enabled, buffers it for acknowledgement.
    pub fn deliver(&self, stanza: &Stanza) -> Result<()> {
        self.conn.deliver_raw_text(stanza.to_xml())?;
        self.server_packet_count.fetch_add(1, Ordering::Relaxed);
        self.sm.sent_stanza(stanza);
        Ok(())
    }

    pub fn increment_client_packet_count(&self) {
        self.client_packet_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_packet_count(&self) -> u64 {
        self.client_packet_count.load(Ordering::Relaxed)
    }

    pub fn server_packet_count(&self) -> u64 {
        self.server_packet_count.load(Ordering::Relaxed)
    }

    /// Close the session and its connection. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if matches!(*state, SessionState::Closing | SessionState::Closed) {
                return;
            }
            *state = SessionState::Closing;
        }
        self.conn.close();
        *self.state.lock() = SessionState::Closed;
        debug!(stream_id = %self.stream_id, address = %self.address(), "session closed");
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }
}

fn new_stream_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect()
}
