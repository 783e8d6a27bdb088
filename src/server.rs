//! Accept loop: one task per accepted connection.
//!
//! `RouterServer` binds a loopback listener and, for each accepted
//! socket, wires up the full per-connection pipeline: a stream reader
//! task feeding the element queue, a session with its connection writer
//! task, and a packet router draining the queue. A broadcast channel
//! fans the shutdown signal out to every connection.
//!
//! The session is bound and registered in the routing table once the
//! peer's stream header carries a usable `from` address; credential
//! verification beyond that handshake belongs to the SASL collaborator.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::jid::Jid;
use crate::reader::StreamReader;
use crate::router::SessionPacketRouter;
use crate::routing_table::{RemotePacket, RoutingTable};
use crate::session::Session;
use crate::stanza::{Stanza, StanzaKind, NS_SASL};
use crate::writer::PacketWriteHandler;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// How long one queue poll waits before re-checking liveness.
const QUEUE_POLL: Duration = Duration::from_millis(500);

/// RAII guard that decrements the connection counter when dropped.
/// Ensures cleanup even if the connection handler panics or returns
/// early.
struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let prev = self.counter.fetch_sub(1, Ordering::SeqCst);
        info!(active = prev - 1, "connection closed");
    }
}

pub struct RouterServer {
    config: Arc<Config>,
    table: Arc<RoutingTable>,
    writer: Arc<PacketWriteHandler>,
    local_addr: Option<SocketAddr>,
    task: Option<JoinHandle<()>>,
    shutdown_tx: Option<tokio::sync::broadcast::Sender<()>>,
    active_connections: Arc<AtomicUsize>,
}

impl RouterServer {
    /// Create a server and the receiver for packets bound to remote
    /// domains.
    pub fn new(config: Arc<Config>) -> (RouterServer, UnboundedReceiver<RemotePacket>) {
        let (table, remote_rx) = RoutingTable::new(config.clone());
        let writer = Arc::new(PacketWriteHandler::new(table.clone()));
        (
            RouterServer {
                config,
                table,
                writer,
                local_addr: None,
                task: None,
                shutdown_tx: None,
                active_connections: Arc::new(AtomicUsize::new(0)),
            },
            remote_rx,
        )
    }

    pub fn routing_table(&self) -> Arc<RoutingTable> {
        self.table.clone()
    }

    pub fn write_handler(&self) -> Arc<PacketWriteHandler> {
        self.writer.clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }

    /// Bind the listener and start accepting. Returns the bound address.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if self.local_addr.is_some() {
            return Err(Error::Config("server already running".to_string()));
        }

        // IPv6 loopback first, IPv4 fallback
        let listener = match TcpListener::bind("[::1]:0").await {
            Ok(l) => l,
            Err(ipv6_err) => {
                debug!(error = %ipv6_err, "IPv6 loopback bind failed, falling back to IPv4");
                TcpListener::bind("127.0.0.1:0").await?
            }
        };
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);
        info!(addr = %local_addr, domain = %self.config.domain, "router server listening");

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        let config = self.config.clone();
        let table = self.table.clone();
        let writer = self.writer.clone();
        let active_connections = self.active_connections.clone();

        let task = tokio::spawn(async move {
            let mut shutdown_rx = shutdown_tx.subscribe();
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let (stream, addr) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                warn!(error = %e, "accept failed");
                                continue;
                            }
                        };
                        info!(addr = %addr, "new connection");
                        let config = config.clone();
                        let table = table.clone();
                        let writer = writer.clone();
                        let shutdown = shutdown_tx.subscribe();
                        let counter = active_connections.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, config, table, writer, shutdown, counter)
                                .await;
                        });
                    }
                    _ = shutdown_rx.recv() => {
                        info!("shutting down accept loop");
                        break;
                    }
                }
            }
        });
        self.task = Some(task);

        Ok(local_addr)
    }

    /// Signal every connection to stop and tear down the accept loop.
    pub async fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.local_addr = None;
    }
}

async fn handle_connection(
    stream: TcpStream,
    config: Arc<Config>,
    table: Arc<RoutingTable>,
    writer: Arc<PacketWriteHandler>,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
    counter: Arc<AtomicUsize>,
) {
    let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    let _guard = ConnectionGuard::new(counter);
    debug!(conn_id, "connection handler started");

    let (read_half, mut write_half) = stream.into_split();

    // Session first so its writer channel exists, then the reader bound
    // to it.
    let placeholder = Jid::new(None, &config.domain, Some(&format!("stream-{}", conn_id)));
    let (session, mut session_rx) = Session::new(placeholder, config.clone());

    let (reader, mut queue) = StreamReader::new(config.clone());
    reader.set_session(session.clone());
    let reader_task = tokio::spawn(reader.clone().run(read_half));

    let write_task = tokio::spawn(async move {
        while let Some(text) = session_rx.recv().await {
            if let Err(e) = write_half.write_all(text.as_bytes()).await {
                debug!(error = %e, "socket write failed");
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    let (sasl_tx, mut sasl_rx) = mpsc::unbounded_channel();
    let router = SessionPacketRouter::new(session.clone(), writer.clone(), config.clone(), sasl_tx);

    let mut bound = false;
    loop {
        tokio::select! {
            element = queue.get_element(QUEUE_POLL) => {
                if !bound {
                    bound = try_bind(&reader, &session, &table, conn_id);
                }
                match element {
                    Some(raw) => {
                        if let Err(e) = router.route_element(&raw) {
                            warn!(conn_id, error = %e, element = %raw, "element rejected; closing stream");
                            send_stream_error(&session, &e);
                            break;
                        }
                    }
                    None => {
                        if reader.is_closed() {
                            debug!(conn_id, "stream ended");
                            break;
                        }
                    }
                }
            }
            Some(stanza) = sasl_rx.recv() => {
                handle_sasl(&session, &stanza);
            }
            _ = shutdown.recv() => {
                debug!(conn_id, "connection closing on shutdown");
                break;
            }
        }
    }

    // Teardown: deregister, release unacknowledged messages back into
    // routing, then close.
    if bound {
        table.remove_client_route(&session.address());
    }
    session
        .stream_manager()
        .on_close(&config.domain, |stanza| writer.process(stanza));
    session.close();

    // Closing the session ends the writer channel; wait for the task to
    // drain it so a final stream error actually reaches the peer.
    let _ = tokio::time::timeout(Duration::from_secs(5), write_task).await;
    reader_task.abort();
    debug!(conn_id, "connection handler finished");
}

/// Bind the session to the address announced in the stream header. The
/// route becomes visible to other sessions at that point.
fn try_bind(
    reader: &StreamReader,
    session: &Arc<Session>,
    table: &RoutingTable,
    conn_id: u64,
) -> bool {
    let Some(header) = reader.stream_header() else {
        return false;
    };
    let Some(from) = header.from.as_deref() else {
        return false;
    };
    let address = match Jid::parse(from) {
        Ok(address) if !address.is_domain_only() => address,
        Ok(_) | Err(_) => {
            warn!(conn_id, from, "unusable stream header address");
            return false;
        }
    };

    session.set_address(address.clone());
    session.set_authenticated();
    table.add_client_route(session.clone());
    info!(conn_id, address = %address, "session bound");
    true
}

/// Answer a rejected element with a stream error and the closing tag.
/// The caller tears the connection down right after.
fn send_stream_error(session: &Arc<Session>, e: &Error) {
    let condition = match e {
        Error::UnknownStanza(_) => "unsupported-stanza-type",
        Error::MalformedJid(_) => "improper-addressing",
        Error::StreamManagement(_) => "undefined-condition",
        _ => "bad-format",
    };
    let error = format!(
        "<stream:error><{} xmlns='urn:ietf:params:xml:ns:xmpp-streams'/></stream:error></stream:stream>",
        condition
    );
    if let Err(e) = session.connection().deliver_raw_text(&error) {
        debug!(error = %e, "could not deliver stream error");
    }
}

/// Minimal SASL collaborator: acknowledge the handshake and mark the
/// session authenticated. Mechanism verification is out of this core's
/// hands.
fn handle_sasl(session: &Arc<Session>, stanza: &Stanza) {
    match stanza.kind() {
        StanzaKind::Auth | StanzaKind::SaslResponse => {
            session.set_authenticated();
            let success = format!("<success xmlns='{}'/>", NS_SASL);
            if let Err(e) = session.connection().deliver_raw_text(&success) {
                debug!(error = %e, "could not answer SASL handshake");
            }
        }
        _ => error!(kind = stanza.kind().tag(), "non-SASL stanza on the SASL channel"),
    }
}
