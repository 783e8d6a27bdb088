//! Session packet router: inbound elements from one session's queue.
//!
//! `route_element` decides what an element is exactly once. Stream
//! management elements go to the session's [`StreamManager`] before any
//! stanza parsing. SASL elements are handed to the authentication
//! collaborator. Everything else must parse as a stanza or the call
//! fails with [`Error::UnknownStanza`]; elements are never dropped
//! silently.
//!
//! Stanzas always leave here with `from` set to the session's own
//! address. Whatever the peer wrote in that attribute is discarded.

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tracing::trace;

use crate::config::Config;
use crate::error::Result;
use crate::session::Session;
use crate::sm;
use crate::stanza::{Stanza, StanzaKind};
use crate::writer::PacketWriteHandler;

pub struct SessionPacketRouter {
    session: Arc<Session>,
    writer: Arc<PacketWriteHandler>,
    config: Arc<Config>,
    /// Authentication collaborator: SASL elements are negotiation, not
    /// routable traffic.
    sasl_tx: UnboundedSender<Stanza>,
}

impl SessionPacketRouter {
    pub fn new(
        session: Arc<Session>,
        writer: Arc<PacketWriteHandler>,
        config: Arc<Config>,
        sasl_tx: UnboundedSender<Stanza>,
    ) -> Self {
        Self {
            session,
            writer,
            config,
            sasl_tx,
        }
    }

    /// Handle one raw element from the session's queue.
    pub fn route_element(&self, raw: &str) -> Result<()> {
        if sm::is_sm_element(raw) {
            return self.session.stream_manager().process(raw);
        }

        let stanza = Stanza::parse(raw)?;
        match stanza.kind() {
            StanzaKind::Auth | StanzaKind::SaslResponse => {
                trace!(kind = stanza.kind().tag(), "forwarding to authentication");
                // Collaborator gone means the session is tearing down
                let _ = self.sasl_tx.send(stanza);
                Ok(())
            }
            StanzaKind::Iq { roster } => {
                if roster {
                    trace!("routing roster query");
                }
                self.route(stanza);
                Ok(())
            }
            StanzaKind::Message | StanzaKind::Presence => {
                self.route(stanza);
                Ok(())
            }
        }
    }

    /// Route one stanza: stamp the sender, count it, hand it off.
    /// Fire-and-forget; delivery outcomes are the write handler's concern.
    pub fn route(&self, mut stanza: Stanza) {
        if !self.config.skip_address_validation {
            if let Some(to) = stanza.to().cloned() {
                // Re-serialize the destination in normalized form
                stanza.set_to(Some(to));
            }
        }
        stanza.set_from(self.session.address());

        self.session.increment_client_packet_count();
        self.session.stream_manager().increment_server_processed();

        self.writer.process(stanza);
    }
}
