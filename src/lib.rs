//! XMPP session routing core.
//!
//! The pieces a server needs between the socket and the application
//! logic: stream framing and per-connection readers, a session model
//! with XEP-0198 stream management, a packet router with anti-spoofing,
//! the write handler's delivery decision order, a concurrent routing
//! table, keyed locks, a bounded cache, proxied byte-stream transfers
//! and server-to-server endpoint resolution.
//!
//! TLS, authentication backends and persistence stay outside; the
//! reader works on any `AsyncRead` and the SASL elements are handed to
//! a collaborator channel.

pub mod cache;
pub mod config;
pub mod dns;
pub mod error;
pub mod framing;
pub mod jid;
pub mod lock;
pub mod logging;
pub mod reader;
pub mod router;
pub mod routing_table;
pub mod server;
pub mod session;
pub mod sm;
pub mod stanza;
pub mod transfer;
pub mod writer;

pub use cache::Cache;
pub use config::Config;
pub use error::{Error, Result};
pub use jid::Jid;
pub use lock::LockRegistry;
pub use reader::{ElementQueue, StreamReader};
pub use router::SessionPacketRouter;
pub use routing_table::RoutingTable;
pub use server::RouterServer;
pub use session::{Connection, Session, SessionState};
pub use sm::StreamManager;
pub use stanza::{Stanza, StanzaKind};
pub use transfer::{ProxyTransfer, TransferStatistics};
pub use writer::PacketWriteHandler;
