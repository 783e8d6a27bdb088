//! Shared address-to-route table.
//!
//! Client routes are keyed by full JID; a secondary index maps each bare
//! JID to the set of resources registered under it so bare-addressed
//! presence can be broadcast. Component and remote-server domains are
//! tracked by name only; packets for them leave through the remote
//! delivery channel instead of a local session.
//!
//! The table is internally concurrent. Callers never take an external
//! lock around it.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::jid::Jid;
use crate::session::Session;
use crate::stanza::Stanza;

/// A packet bound for a domain this process does not host. Drained by
/// the server-to-server delivery task.
#[derive(Debug)]
pub struct RemotePacket {
    pub domain: String,
    pub stanza: Stanza,
}

pub struct RoutingTable {
    config: Arc<Config>,
    /// Full JID string -> session.
    routes: DashMap<String, Arc<Session>>,
    /// Bare JID string -> full JID strings registered under it.
    bare_index: DashMap<String, HashSet<String>>,
    /// Domains served by connected components.
    component_domains: DashMap<String, ()>,
    remote_tx: UnboundedSender<RemotePacket>,
}

impl RoutingTable {
    /// Create the table and the receiver for the remote delivery path.
    pub fn new(config: Arc<Config>) -> (Arc<RoutingTable>, UnboundedReceiver<RemotePacket>) {
        let (remote_tx, remote_rx) = mpsc::unbounded_channel();
        let table = Arc::new(RoutingTable {
            config,
            routes: DashMap::new(),
            bare_index: DashMap::new(),
            component_domains: DashMap::new(),
            remote_tx,
        });
        (table, remote_rx)
    }

    /// Register a client session under its current (full) address.
    /// Re-registering an address replaces the previous route.
    pub fn add_client_route(&self, session: Arc<Session>) {
        let address = session.address();
        let full = address.to_string();
        let bare = address.to_bare().to_string();

        if self.routes.insert(full.clone(), session).is_some() {
            warn!(address = %full, "replacing existing client route");
        }
        self.bare_index.entry(bare).or_default().insert(full);
    }

    /// Remove the route for `address`. Unknown addresses are a no-op.
    pub fn remove_client_route(&self, address: &Jid) {
        let full = address.to_string();
        let bare = address.to_bare().to_string();

        if self.routes.remove(&full).is_none() {
            return;
        }
        if let Some(mut entry) = self.bare_index.get_mut(&bare) {
            entry.remove(&full);
            if entry.is_empty() {
                drop(entry);
                self.bare_index.remove_if(&bare, |_, set| set.is_empty());
            }
        }
        debug!(address = %full, "client route removed");
    }

    pub fn get_client_route(&self, address: &Jid) -> Option<Arc<Session>> {
        self.routes.get(&address.to_string()).map(|r| r.clone())
    }

    /// Every session registered under the bare form of `address`.
    pub fn routes_for_bare(&self, address: &Jid) -> Vec<Arc<Session>> {
        let bare = address.to_bare().to_string();
        let Some(fulls) = self.bare_index.get(&bare) else {
            return Vec::new();
        };
        fulls
            .iter()
            .filter_map(|full| self.routes.get(full).map(|r| r.clone()))
            .collect()
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn add_component_domain(&self, domain: &str) {
        self.component_domains
            .insert(domain.to_ascii_lowercase(), ());
    }

    pub fn remove_component_domain(&self, domain: &str) {
        self.component_domains.remove(&domain.to_ascii_lowercase());
    }

    pub fn is_component_domain(&self, domain: &str) -> bool {
        self.component_domains
            .contains_key(&domain.to_ascii_lowercase())
    }

    /// True when `domain` is hosted by this process (the configured
    /// domain or one of its connected components).
    pub fn is_local_domain(&self, domain: &str) -> bool {
        domain.eq_ignore_ascii_case(&self.config.domain)
    }

    /// Hand a packet to the server-to-server delivery path.
    pub fn route_to_remote(&self, domain: &str, stanza: Stanza) -> Result<()> {
        self.remote_tx
            .send(RemotePacket {
                domain: domain.to_string(),
                stanza,
            })
            .map_err(|_| Error::Delivery("remote delivery path is down".to_string()))
    }
}
