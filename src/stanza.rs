//! Stanza model: a closed sum type decided once at parse time.
//!
//! A top-level element is classified into exactly one of {IQ, Message,
//! Presence, SASL auth, SASL response} when it is parsed; any other tag
//! name is an [`Error::UnknownStanza`]. Downstream code matches on
//! [`StanzaKind`] exhaustively instead of re-comparing tag names.
//!
//! Stanzas keep their raw XML payload. Only the envelope attributes
//! (`from`, `to`) are ever rewritten, which is done by splicing a new
//! root tag in front of the untouched payload.

use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::{Error, Result};
use crate::jid::Jid;

pub const NS_SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
pub const NS_ROSTER: &str = "jabber:iq:roster";
pub const NS_DELAY: &str = "urn:xmpp:delay";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaKind {
    /// `<iq/>`; `roster` marks the `jabber:iq:roster` query subtype.
    Iq { roster: bool },
    Message,
    Presence,
    /// SASL `<auth/>`.
    Auth,
    /// SASL `<response/>`.
    SaslResponse,
}

impl StanzaKind {
    pub fn tag(&self) -> &'static str {
        match self {
            StanzaKind::Iq { .. } => "iq",
            StanzaKind::Message => "message",
            StanzaKind::Presence => "presence",
            StanzaKind::Auth => "auth",
            StanzaKind::SaslResponse => "response",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Stanza {
    kind: StanzaKind,
    from: Option<Jid>,
    to: Option<Jid>,
    stanza_type: Option<String>,
    id: Option<String>,
    xml: String,
}

impl Stanza {
    /// Parse and classify one complete top-level element.
    pub fn parse(raw: &str) -> Result<Stanza> {
        let mut reader = Reader::from_str(raw);
        reader.config_mut().check_end_names = false;

        let (name, attrs) = read_root(&mut reader, raw)?;

        let kind = match name.as_str() {
            "iq" => StanzaKind::Iq {
                roster: has_roster_query(raw),
            },
            "message" => StanzaKind::Message,
            "presence" => StanzaKind::Presence,
            "auth" => StanzaKind::Auth,
            "response" => StanzaKind::SaslResponse,
            other => return Err(Error::UnknownStanza(other.to_string())),
        };

        let mut from = None;
        let mut to = None;
        let mut stanza_type = None;
        let mut id = None;
        for (key, value) in attrs {
            match key.as_str() {
                "from" => from = Some(Jid::parse(&value)?),
                "to" => to = Some(Jid::parse(&value)?),
                "type" => stanza_type = Some(value),
                "id" => id = Some(value),
                _ => {}
            }
        }

        Ok(Stanza {
            kind,
            from,
            to,
            stanza_type,
            id,
            xml: raw.to_string(),
        })
    }

    pub fn kind(&self) -> StanzaKind {
        self.kind
    }

    pub fn is_presence(&self) -> bool {
        self.kind == StanzaKind::Presence
    }

    pub fn is_message(&self) -> bool {
        self.kind == StanzaKind::Message
    }

    pub fn from(&self) -> Option<&Jid> {
        self.from.as_ref()
    }

    pub fn to(&self) -> Option<&Jid> {
        self.to.as_ref()
    }

    pub fn stanza_type(&self) -> Option<&str> {
        self.stanza_type.as_deref()
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn to_xml(&self) -> &str {
        &self.xml
    }

    /// Overwrite the sender address, both in the envelope fields and in
    /// the serialized form. The router calls this on every inbound stanza
    /// so a session can never forge its identity.
    pub fn set_from(&mut self, from: Jid) {
        self.xml = rewrite_envelope(&self.xml, "from", Some(&from.to_string()));
        self.from = Some(from);
    }

    /// Rewrite the destination address (used by the bounce path).
    pub fn set_to(&mut self, to: Option<Jid>) {
        self.xml = rewrite_envelope(&self.xml, "to", to.as_ref().map(|j| j.to_string()).as_deref());
        self.to = to;
    }

    /// Add an XEP-0203 `<delay/>` annotation unless one is already present.
    /// Used when re-routing unacknowledged stanzas after a broken stream.
    pub fn add_delay(&mut self, from_domain: &str, stamp: &str) {
        if self.xml.contains(NS_DELAY) {
            return;
        }
        let delay = format!(
            "<delay xmlns='{}' from='{}' stamp='{}'/>",
            NS_DELAY,
            escape(from_domain),
            escape(stamp)
        );
        self.xml = append_child(&self.xml, self.kind.tag(), &delay);
    }
}

/// Read the root tag of `raw`: (local name, attributes).
fn read_root(reader: &mut Reader<&[u8]>, raw: &str) -> Result<(String, Vec<(String, String)>)> {
    loop {
        match reader.read_event() {
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_)) => continue,
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let name = String::from_utf8_lossy(e.name().local_name().as_ref()).into_owned();
                let mut attrs = Vec::new();
                for attr in e.attributes().flatten() {
                    attrs.push((
                        String::from_utf8_lossy(attr.key.as_ref()).into_owned(),
                        String::from_utf8_lossy(&attr.value).into_owned(),
                    ));
                }
                return Ok((name, attrs));
            }
            Ok(_) => return Err(Error::MalformedStanza(raw.to_string())),
            Err(e) => return Err(Error::MalformedStanza(format!("{}: {}", e, raw))),
        }
    }
}

/// True if the IQ carries a direct `<query xmlns='jabber:iq:roster'>` child.
fn has_roster_query(raw: &str) -> bool {
    let mut reader = Reader::from_str(raw);
    reader.config_mut().check_end_names = false;

    fn is_roster_query_tag(e: &quick_xml::events::BytesStart<'_>) -> bool {
        if e.name().local_name().as_ref() != b"query" {
            return false;
        }
        e.attributes()
            .flatten()
            .any(|a| a.key.as_ref() == b"xmlns" && a.value.as_ref() == NS_ROSTER.as_bytes())
    }

    let mut depth = 0u32;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                if depth == 1 && is_roster_query_tag(&e) {
                    return true;
                }
                depth += 1;
            }
            Ok(Event::Empty(e)) => {
                if depth == 1 && is_roster_query_tag(&e) {
                    return true;
                }
            }
            Ok(Event::End(_)) => depth = depth.saturating_sub(1),
            Ok(Event::Eof) | Err(_) => return false,
            Ok(_) => {}
        }
    }
}

/// Rebuild the root tag of `xml` with attribute `key` replaced (or removed
/// when `value` is `None`), leaving the payload untouched.
fn rewrite_envelope(xml: &str, key: &str, value: Option<&str>) -> String {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().check_end_names = false;

    loop {
        match reader.read_event() {
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_)) => continue,
            Ok(Event::Start(e)) => {
                let root_end = reader.buffer_position() as usize;
                let mut tag = rebuild_tag(&e, key, value);
                tag.push('>');
                return format!("{}{}", tag, &xml[root_end..]);
            }
            Ok(Event::Empty(e)) => {
                let root_end = reader.buffer_position() as usize;
                let mut tag = rebuild_tag(&e, key, value);
                tag.push_str("/>");
                return format!("{}{}", tag, &xml[root_end..]);
            }
            // Not well-formed; leave as-is rather than corrupting further.
            _ => return xml.to_string(),
        }
    }
}

fn rebuild_tag(e: &quick_xml::events::BytesStart<'_>, key: &str, value: Option<&str>) -> String {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut tag = format!("<{}", name);
    for attr in e.attributes().flatten() {
        let attr_key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        if attr_key == key {
            continue;
        }
        let attr_value = String::from_utf8_lossy(&attr.value).into_owned();
        tag.push_str(&format!(" {}=\"{}\"", attr_key, attr_value));
    }
    if let Some(value) = value {
        tag.push_str(&format!(" {}=\"{}\"", key, escape(value)));
    }
    tag
}

/// Append `child` inside the root element, expanding a self-closing tag
/// when necessary.
fn append_child(xml: &str, tag: &str, child: &str) -> String {
    let closing = format!("</{}>", tag);
    if let Some(pos) = xml.rfind(&closing) {
        let mut out = String::with_capacity(xml.len() + child.len());
        out.push_str(&xml[..pos]);
        out.push_str(child);
        out.push_str(&xml[pos..]);
        return out;
    }
    // Self-closing root: `<tag .../>` becomes `<tag ...>child</tag>`
    if let Some(pos) = xml.rfind("/>") {
        let mut out = String::with_capacity(xml.len() + child.len() + closing.len());
        out.push_str(&xml[..pos]);
        out.push('>');
        out.push_str(child);
        out.push_str(&closing);
        return out;
    }
    xml.to_string()
}
