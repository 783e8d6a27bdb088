//! XEP-0198 Stream Management: acknowledged delivery over one stream.
//!
//! Tracks stanza counters for both directions of a client connection and
//! buffers outbound stanzas until the peer acknowledges them. The buffer
//! is the resend candidate set after a broken stream: on close, buffered
//! messages are re-routed with an XEP-0203 delay annotation.
//!
//! The manager starts disabled and every operation is a no-op until the
//! peer negotiates `<enable/>`. The transition is one-way per stream
//! generation.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::session::Connection;
use crate::stanza::Stanza;

pub const NAMESPACE_V2: &str = "urn:xmpp:sm:2";
pub const NAMESPACE_V3: &str = "urn:xmpp:sm:3";

/// Acknowledgement counters live on a 32-bit ring: sequence numbers and
/// reported counts wrap at (2^32)-1.
const MASK: u64 = 0xFFFF_FFFF;

/// Half the counter ring. A forward distance below this means "at or
/// ahead"; at or above it, the other value is actually behind.
const HALF_RANGE: u64 = 0x8000_0000;

/// Forward distance from `from` to `to` on the counter ring.
fn seq_delta(from: u64, to: u64) -> u64 {
    to.wrapping_sub(from) & MASK
}

/// A stanza sent to the peer that has not been acknowledged yet.
#[derive(Debug, Clone)]
pub struct UnackedStanza {
    pub seq: u64,
    pub sent_at: DateTime<Utc>,
    pub stanza: Stanza,
}

#[derive(Debug, Default)]
struct Inner {
    /// `Some` while stream management is enabled; carries the negotiated
    /// namespace version.
    namespace: Option<String>,
    /// Inbound stanzas this server has finished handling.
    server_processed: u64,
    /// The peer's last reported count; never moves backward.
    client_processed: u64,
    unacked: VecDeque<UnackedStanza>,
}

pub struct StreamManager {
    conn: Arc<Connection>,
    config: Arc<Config>,
    inner: Mutex<Inner>,
}

/// True if `raw` is a stream-management element (`urn:xmpp:sm:*` namespace).
pub fn is_sm_element(raw: &str) -> bool {
    sm_envelope(raw).is_some()
}

/// Parse the name, namespace and optional `h` attribute of an SM element.
fn sm_envelope(raw: &str) -> Option<(String, String, Option<u64>)> {
    let mut reader = Reader::from_str(raw);
    reader.config_mut().check_end_names = false;

    let event = reader.read_event().ok()?;
    let e = match &event {
        Event::Start(e) | Event::Empty(e) => e,
        _ => return None,
    };
    let name = String::from_utf8_lossy(e.name().local_name().as_ref()).into_owned();
    let mut namespace = None;
    let mut h = None;
    for attr in e.attributes().flatten() {
        match attr.key.as_ref() {
            b"xmlns" => namespace = Some(String::from_utf8_lossy(&attr.value).into_owned()),
            b"h" => h = String::from_utf8_lossy(&attr.value).parse().ok(),
            _ => {}
        }
    }
    match namespace {
        Some(ns) if ns.starts_with("urn:xmpp:sm:") => Some((name, ns, h)),
        _ => None,
    }
}

impl StreamManager {
    pub fn new(conn: Arc<Connection>, config: Arc<Config>) -> Self {
        Self {
            conn,
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().namespace.is_some()
    }

    /// Dispatch one stream-management element.
    pub fn process(&self, raw: &str) -> Result<()> {
        let Some((name, namespace, h)) = sm_envelope(raw) else {
            return Err(Error::StreamManagement(format!(
                "not a stream management element: {}",
                raw
            )));
        };
        match name.as_str() {
            // A second enable is answered with <failed/> but is not
            // fatal for the stream itself
            "enable" => {
                if self.is_enabled() {
                    self.send_unexpected_error(&namespace);
                    Ok(())
                } else {
                    self.enable(&namespace)
                }
            }
            "r" => {
                self.send_server_acknowledgement();
                Ok(())
            }
            "a" => match h {
                Some(h) => self.process_client_acknowledgement(h),
                None => Ok(()), // <a/> without h carries no information
            },
            _ => {
                self.send_unexpected_error(&namespace);
                Ok(())
            }
        }
    }

    /// Enable stream management, answering `<enabled/>`. Enabling twice in
    /// one stream generation is a protocol violation.
    pub fn enable(&self, namespace: &str) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if inner.namespace.is_some() {
                drop(inner);
                self.send_unexpected_error(namespace);
                return Err(Error::StreamManagement("already enabled".to_string()));
            }
            inner.namespace = Some(namespace.to_string());
        }
        let enabled = format!("<enabled xmlns='{}'/>", namespace);
        self.deliver(&enabled);
        debug!(namespace, "stream management enabled");
        Ok(())
    }

    /// Emit `<a h='N'/>` carrying the current server-processed count.
    pub fn send_server_acknowledgement(&self) {
        let inner = self.inner.lock();
        if let Some(namespace) = &inner.namespace {
            let ack = format!("<a xmlns='{}' h='{}'/>", namespace, inner.server_processed & MASK);
            drop(inner);
            self.deliver(&ack);
        }
    }

    /// Emit `<r/>` asking the peer to acknowledge.
    pub fn send_server_request(&self) {
        let inner = self.inner.lock();
        if let Some(namespace) = &inner.namespace {
            let request = format!("<r xmlns='{}'/>", namespace);
            drop(inner);
            self.deliver(&request);
        }
    }

    /// Emit `<failed><unexpected-request/></failed>` for an SM element that
    /// arrived outside its legal window, and drop back to disabled.
    pub fn send_unexpected_error(&self, namespace: &str) {
        let failed = format!(
            "<failed xmlns='{}'><unexpected-request xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></failed>",
            namespace
        );
        self.deliver(&failed);
        self.inner.lock().namespace = None;
    }

    /// Apply the peer's reported count `h`: drop every buffered stanza at
    /// or behind `h` on the counter ring, then advance `client_processed`
    /// unless `h` moved backward (duplicate or out-of-order acks are
    /// ignored). Ring arithmetic keeps this correct across the 2^32
    /// rollover.
    pub fn process_client_acknowledgement(&self, h: u64) -> Result<()> {
        let h = h & MASK;
        let mut inner = self.inner.lock();
        if inner.namespace.is_none() {
            return Ok(());
        }

        let highest_sent = inner
            .unacked
            .back()
            .map(|u| u.seq)
            .unwrap_or(inner.client_processed);
        if seq_delta(h, highest_sent) >= HALF_RANGE {
            warn!(
                h,
                highest_sent, "peer acknowledged stanzas that were never sent"
            );
            return Err(Error::StreamManagement(format!(
                "acknowledged {} but only {} were sent",
                h, highest_sent
            )));
        }

        if seq_delta(inner.client_processed, h) >= HALF_RANGE {
            debug!(
                h,
                recorded = inner.client_processed,
                "ignoring non-advancing acknowledgement"
            );
            return Ok(());
        }

        trace!(h, buffered = inner.unacked.len(), "processing acknowledgement");
        while inner
            .unacked
            .front()
            .map(|u| seq_delta(u.seq, h) < HALF_RANGE)
            .unwrap_or(false)
        {
            inner.unacked.pop_front();
        }
        inner.client_processed = h;
        trace!(h, buffered = inner.unacked.len(), "acknowledgement applied");
        Ok(())
    }

    /// Record an outbound stanza. Grows the unacknowledged buffer by one and
    /// emits `<r/>` every `sm_request_frequency` buffered sends. When the
    /// buffer exceeds its hard limit, stream management is disabled and the
    /// buffer cleared rather than exhausting memory.
    pub fn sent_stanza(&self, stanza: &Stanza) {
        let buffered = {
            let mut inner = self.inner.lock();
            if inner.namespace.is_none() {
                return;
            }

            let seq = (1 + inner
                .unacked
                .back()
                .map(|u| u.seq)
                .unwrap_or(inner.client_processed))
                & MASK;
            inner.unacked.push_back(UnackedStanza {
                seq,
                sent_at: Utc::now(),
                stanza: stanza.clone(),
            });
            let buffered = inner.unacked.len();
            trace!(seq, buffered, "buffered outbound stanza");

            if buffered > self.config.sm_max_unacked {
                warn!(
                    buffered,
                    limit = self.config.sm_max_unacked,
                    "too many unacknowledged stanzas; disabling stream management"
                );
                inner.namespace = None;
                inner.unacked.clear();
                return;
            }
            buffered
        };

        if buffered as u64 % self.config.sm_request_frequency == 0 {
            self.send_server_request();
        }
    }

    /// Count one processed inbound stanza. Only counts while enabled.
    pub fn increment_server_processed(&self) {
        let mut inner = self.inner.lock();
        if inner.namespace.is_some() {
            inner.server_processed += 1;
        }
    }

    /// The stream is gone without resumption: disable stream management and
    /// hand every unacknowledged message back for re-routing, annotated
    /// with the original send time.
    pub fn on_close<F>(&self, server_domain: &str, mut route: F)
    where
        F: FnMut(Stanza),
    {
        let unacked = {
            let mut inner = self.inner.lock();
            if inner.namespace.is_none() {
                return;
            }
            inner.namespace = None;
            std::mem::take(&mut inner.unacked)
        };

        for entry in unacked {
            if entry.stanza.is_message() {
                let mut stanza = entry.stanza;
                stanza.add_delay(
                    server_domain,
                    &entry.sent_at.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
                );
                route(stanza);
            }
        }
    }

    pub fn unacked_len(&self) -> usize {
        self.inner.lock().unacked.len()
    }

    /// Sequence numbers currently waiting for acknowledgement.
    pub fn unacked_seqs(&self) -> Vec<u64> {
        self.inner.lock().unacked.iter().map(|u| u.seq).collect()
    }

    pub fn client_processed(&self) -> u64 {
        self.inner.lock().client_processed
    }

    pub fn server_processed(&self) -> u64 {
        self.inner.lock().server_processed
    }

    #[cfg(test)]
    fn force_client_processed(&self, value: u64) {
        self.inner.lock().client_processed = value & MASK;
    }

    fn deliver(&self, raw: &str) {
        if let Err(e) = self.conn.deliver_raw_text(raw) {
            debug!(error = %e, "could not deliver stream management element");
        }
    }
}
