//! Socket write handler: the last hop before a packet reaches a session.
//!
//! `process` applies a strict decision order:
//!
//! 1. destination in a component or foreign domain: remote path;
//! 2. destination unusable (absent, or neither node nor resource):
//!    bounce the packet back to its sender, `to` rewritten, one attempt;
//! 3. destination has a resource, or the packet is not a presence:
//!    deliver to the single full-JID route;
//! 4. bare-JID presence: broadcast to every route under the bare JID.
//!
//! Delivery failures are contained here: logged with the serialized
//! packet, never propagated to the caller.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::jid::Jid;
use crate::routing_table::RoutingTable;
use crate::stanza::Stanza;

pub struct PacketWriteHandler {
    table: Arc<RoutingTable>,
}

impl PacketWriteHandler {
    pub fn new(table: Arc<RoutingTable>) -> Self {
        Self { table }
    }

    /// Deliver one packet. Never fails from the caller's point of view.
    pub fn process(&self, stanza: Stanza) {
        let raw = stanza.to_xml().to_string();
        if let Err(e) = self.try_process(stanza) {
            error!(error = %e, packet = %raw, "packet could not be delivered");
        }
    }

    fn try_process(&self, stanza: Stanza) -> Result<()> {
        if let Some(to) = stanza.to() {
            if self.table.is_component_domain(to.domain()) || !self.table.is_local_domain(to.domain())
            {
                let domain = to.domain().to_string();
                return self.table.route_to_remote(&domain, stanza);
            }
        }

        let to = match stanza.to() {
            Some(to) if !to.is_domain_only() => to.clone(),
            _ => return self.bounce(stanza),
        };

        if to.resource().is_some() || !stanza.is_presence() {
            return self.deliver_to(&to, &stanza);
        }

        self.broadcast(&to, &stanza);
        Ok(())
    }

    fn deliver_to(&self, to: &Jid, stanza: &Stanza) -> Result<()> {
        let session = self
            .table
            .get_client_route(to)
            .ok_or_else(|| Error::Delivery(format!("no route for {}", to)))?;
        session.deliver(stanza)
    }

    /// Case 4: a presence addressed to a bare JID goes to every resource
    /// registered under it.
    fn broadcast(&self, to: &Jid, stanza: &Stanza) {
        let routes = self.table.routes_for_bare(to);
        if routes.is_empty() {
            debug!(to = %to, "no routes for bare presence");
            return;
        }
        for session in routes {
            if let Err(e) = session.deliver(stanza) {
                warn!(error = %e, to = %session.address(), "presence broadcast leg failed");
            }
        }
    }

    /// Case 2: the packet cannot reach anyone as addressed. Send it back
    /// to its sender unchanged except for the destination. Exactly one
    /// delivery attempt; a sender with no route loses the packet.
    fn bounce(&self, mut stanza: Stanza) -> Result<()> {
        let sender = stanza.from().cloned().ok_or(Error::Unroutable)?;
        warn!(packet = %stanza.to_xml(), sender = %sender, "unusable destination; bouncing to sender");
        stanza.set_to(Some(sender.clone()));
        let session = self
            .table
            .get_client_route(&sender)
            .ok_or_else(|| Error::Delivery(format!("no route to bounce to {}", sender)))?;
        session.deliver(&stanza)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::routing_table::RemotePacket;
    use crate::session::Session;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        handler: PacketWriteHandler,
        table: Arc<RoutingTable>,
        remote_rx: UnboundedReceiver<RemotePacket>,
    }

    fn fixture() -> Fixture {
        let config = Arc::new(Config {
            domain: "example.com".to_string(),
            ..Config::default()
        });
        let (table, remote_rx) = RoutingTable::new(config);
        Fixture {
            handler: PacketWriteHandler::new(table.clone()),
            table,
            remote_rx,
        }
    }

    fn register(table: &RoutingTable, jid: &str) -> UnboundedReceiver<String> {
        let (session, rx) = Session::new(Jid::parse(jid).unwrap(), Arc::new(Config::default()));
        table.add_client_route(session);
        rx
    }

    #[test]
    fn test_foreign_domain_takes_remote_path() {
        let mut f = fixture();
        let mut local = register(&f.table, "alice@example.com/desktop");

        let stanza = Stanza::parse("<message to='bob@remote.example'><body>x</body></message>")
            .unwrap();
        f.handler.process(stanza);

        let packet = f.remote_rx.try_recv().unwrap();
        assert_eq!(packet.domain, "remote.example");
        assert!(local.try_recv().is_err());
    }

    #[test]
    fn test_component_domain_takes_remote_path() {
        let mut f = fixture();
        f.table.add_component_domain("muc.example.com");

        let stanza =
            Stanza::parse("<presence to='room@muc.example.com/nick'/>").unwrap();
        f.handler.process(stanza);
        assert_eq!(f.remote_rx.try_recv().unwrap().domain, "muc.example.com");
    }

    #[test]
    fn test_full_jid_delivery() {
        let mut f = fixture();
        let mut desktop = register(&f.table, "alice@example.com/desktop");
        let mut mobile = register(&f.table, "alice@example.com/mobile");

        let stanza =
            Stanza::parse("<message to='alice@example.com/desktop'><body>x</body></message>")
                .unwrap();
        f.handler.process(stanza);

        assert!(desktop.try_recv().unwrap().contains("<body>x</body>"));
        assert!(mobile.try_recv().is_err());
    }

    #[test]
    fn test_bare_presence_broadcasts_to_all_resources() {
        let mut f = fixture();
        let mut rxs = vec![
            register(&f.table, "alice@example.com/desktop"),
            register(&f.table, "alice@example.com/mobile"),
            register(&f.table, "alice@example.com/web"),
        ];
        let mut bob = register(&f.table, "bob@example.com/desktop");

        let stanza =
            Stanza::parse("<presence from='carol@example.com/x' to='alice@example.com'/>")
                .unwrap();
        f.handler.process(stanza);

        // Three registered routes means exactly three deliveries
        for rx in &mut rxs {
            assert!(rx.try_recv().unwrap().contains("<presence"));
            assert!(rx.try_recv().is_err());
        }
        assert!(bob.try_recv().is_err());
    }

    #[test]
    fn test_bare_message_is_not_broadcast() {
        let mut f = fixture();
        let mut desktop = register(&f.table, "alice@example.com/desktop");

        // A message to a bare JID is a full-JID lookup, not a broadcast;
        // with no exact route it is dropped after logging
        let stanza =
            Stanza::parse("<message to='alice@example.com'><body>x</body></message>").unwrap();
        f.handler.process(stanza);
        assert!(desktop.try_recv().is_err());
    }

    #[test]
    fn test_domain_only_destination_bounces_to_sender() {
        let mut f = fixture();
        let mut sender = register(&f.table, "alice@example.com/desktop");

        let stanza = Stanza::parse(
            "<message from='alice@example.com/desktop' to='example.com'><body>x</body></message>",
        )
        .unwrap();
        f.handler.process(stanza);

        let bounced = sender.try_recv().unwrap();
        assert!(bounced.contains("to=\"alice@example.com/desktop\""));
        assert!(bounced.contains("<body>x</body>"));
        // Exactly one delivery attempt
        assert!(sender.try_recv().is_err());
        assert!(f.remote_rx.try_recv().is_err());
    }

    #[test]
    fn test_missing_destination_bounces_to_sender() {
        let mut f = fixture();
        let mut sender = register(&f.table, "alice@example.com/desktop");

        let stanza =
            Stanza::parse("<message from='alice@example.com/desktop'><body>x</body></message>")
                .unwrap();
        f.handler.process(stanza);
        assert!(sender.try_recv().unwrap().contains("<body>x</body>"));
    }

    #[test]
    fn test_unroutable_packet_is_dropped_quietly() {
        let f = fixture();
        // No to, no from: nothing to do, and no panic
        let stanza = Stanza::parse("<message><body>x</body></message>").unwrap();
        f.handler.process(stanza);
    }
}
