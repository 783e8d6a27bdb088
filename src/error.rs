//! Error taxonomy for the routing core.
//!
//! Protocol errors are surfaced to the peer, transport errors are terminal
//! for the connection, addressing errors are recovered locally by bouncing,
//! and delivery errors are contained at the routing layer. Usage errors
//! (double-starting a transfer, releasing a lock that was never acquired)
//! are panics, not variants: they indicate a caller bug.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Top-level element with a tag name that is not part of the stanza
    /// vocabulary (`iq`, `message`, `presence`, `auth`, `response`).
    #[error("unknown stanza tag <{0}>")]
    UnknownStanza(String),

    /// Malformed XML envelope: the element could not be parsed at all.
    #[error("malformed stanza: {0}")]
    MalformedStanza(String),

    /// A JID that does not follow `node@domain/resource`.
    #[error("malformed JID: {0}")]
    MalformedJid(String),

    /// A stream-management element arrived outside its legal window, or
    /// the peer acknowledged stanzas that were never sent.
    #[error("stream management protocol violation: {0}")]
    StreamManagement(String),

    /// The destination session rejected or could not accept a stanza.
    /// Contained by the write handler; never propagates past routing.
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// The stanza had no usable destination and no sender to bounce to.
    #[error("no usable destination and no sender address")]
    Unroutable,

    /// Terminal transport failure; the connection must be torn down.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// DNS resolution failure while dialing a remote server.
    #[error("resolution failed for {domain}: {reason}")]
    Resolution { domain: String, reason: String },

    /// Configuration could not be read or parsed, or a component was
    /// started in a state its configuration forbids.
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
