//! XMPP stream framing: splitting a TCP byte stream into stream events.
//!
//! An XMPP connection is one long XML document. The parser below walks
//! quick-xml events over the accumulated read buffer and slices out one
//! complete unit at a time: the `<stream:stream>` header (with its
//! attributes parsed, since stream restarts renegotiate them), a complete
//! top-level child element, or the `</stream:stream>` terminator.
//!
//! A partial tail (TCP fragmentation) is signalled by returning `None`;
//! the caller keeps the bytes and retries after the next read.

use quick_xml::errors::SyntaxError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::error;

/// Parsed attributes of a `<stream:stream>` header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHeader {
    pub to: Option<String>,
    pub from: Option<String>,
    pub id: Option<String>,
    pub version: Option<String>,
    /// Default namespace: `jabber:client` or `jabber:server`.
    pub namespace: Option<String>,
}

/// One unit extracted from the inbound stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Stream header received (also on stream restart).
    Open(StreamHeader),
    /// A complete top-level element, raw XML.
    Element(String),
    /// `</stream:stream>`: the peer is closing the stream.
    Close,
}

/// Parser state while scanning the buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
enum ScanState {
    /// Between top-level elements.
    Idle,
    /// Inside a top-level element, waiting for its end tag.
    InElement,
}

fn is_stream_tag(name: &quick_xml::name::QName<'_>) -> bool {
    name.as_ref() == b"stream:stream" || name.local_name().as_ref() == b"stream"
}

fn parse_header(e: &BytesStart<'_>) -> StreamHeader {
    let mut header = StreamHeader::default();
    for attr in e.attributes().flatten() {
        let value = String::from_utf8_lossy(&attr.value).into_owned();
        match attr.key.as_ref() {
            b"to" => header.to = Some(value),
            b"from" => header.from = Some(value),
            b"id" => header.id = Some(value),
            b"version" => header.version = Some(value),
            b"xmlns" => header.namespace = Some(value),
            _ => {}
        }
    }
    header
}

fn bytes_to_string(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// Extract the next stream event from `buffer`.
///
/// Returns `Some((event, bytes_consumed))` when a complete unit is
/// available, `None` when the buffer holds only a partial unit. The
/// caller advances past the consumed bytes.
pub fn next_event(buffer: &[u8]) -> Option<(StreamEvent, usize)> {
    // The stream terminator has no matching opening tag in the buffer, so
    // a plain XML scan would flag it as unbalanced. Handle it up front.
    let content_start = buffer
        .iter()
        .position(|&b| !matches!(b, b' ' | b'\t' | b'\n' | b'\r'))?;
    if buffer[content_start..].starts_with(b"</stream:stream>") {
        let consumed = content_start + b"</stream:stream>".len();
        return Some((StreamEvent::Close, consumed));
    }

    let mut reader = Reader::from_reader(buffer);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;

    let mut depth: u32 = 0;
    let mut state = ScanState::Idle;
    let mut element_start: usize = 0;

    loop {
        let pos = reader.buffer_position() as usize;

        match reader.read_event() {
            // Stream-level prolog: the XML declaration before the header.
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_))
            | Ok(Event::DocType(_)) => continue,
            Ok(Event::Start(e)) => {
                if state == ScanState::Idle && is_stream_tag(&e.name()) {
                    let consumed = reader.buffer_position() as usize;
                    return Some((StreamEvent::Open(parse_header(&e)), consumed));
                }
                if state == ScanState::Idle && depth == 0 {
                    state = ScanState::InElement;
                    element_start = pos;
                }
                depth += 1;
            }
            Ok(Event::Empty(e)) => {
                if state == ScanState::Idle && is_stream_tag(&e.name()) {
                    // Degenerate self-closing header; treat as open + close.
                    let consumed = reader.buffer_position() as usize;
                    return Some((StreamEvent::Open(parse_header(&e)), consumed));
                }
                // Self-closing top-level element, e.g. <presence/> or <r/>
                if state == ScanState::Idle && depth == 0 {
                    let consumed = reader.buffer_position() as usize;
                    let raw = bytes_to_string(&buffer[pos..consumed]);
                    return Some((StreamEvent::Element(raw), consumed));
                }
            }
            Ok(Event::Text(_)) | Ok(Event::CData(_)) => {}
            Ok(Event::End(e)) => {
                if depth == 0 && is_stream_tag(&e.name()) {
                    let consumed = reader.buffer_position() as usize;
                    return Some((StreamEvent::Close, consumed));
                }
                depth = depth.saturating_sub(1);
                if state == ScanState::InElement && depth == 0 {
                    let consumed = reader.buffer_position() as usize;
                    let raw = bytes_to_string(&buffer[element_start..consumed]);
                    return Some((StreamEvent::Element(raw), consumed));
                }
            }
            Ok(Event::Eof) => {
                // Partial element; wait for more bytes.
                return None;
            }
            Err(quick_xml::Error::Syntax(SyntaxError::UnclosedTag)) => {
                // Expected mid-stream: the buffer ends inside a tag.
                return None;
            }
            Err(e) => {
                error!(error = ?e, "stream parse error");
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expect_element(buffer: &[u8]) -> (String, usize) {
        match next_event(buffer) {
            Some((StreamEvent::Element(raw), consumed)) => (raw, consumed),
            other => panic!("expected element, got {:?}", other),
        }
    }

    #[test]
    fn test_stream_header_with_declaration() {
        let buf = b"<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' to='example.com' version='1.0'>";
        let (event, consumed) = next_event(buf).unwrap();
        match event {
            StreamEvent::Open(header) => {
                assert_eq!(header.to.as_deref(), Some("example.com"));
                assert_eq!(header.version.as_deref(), Some("1.0"));
                assert_eq!(header.namespace.as_deref(), Some("jabber:client"));
            }
            other => panic!("expected open, got {:?}", other),
        }
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn test_server_stream_header_namespace() {
        let buf = b"<stream:stream xmlns='jabber:server' xmlns:stream='http://etherx.jabber.org/streams' from='remote.example' to='local.example' version='1.0'>";
        let (event, _) = next_event(buf).unwrap();
        match event {
            StreamEvent::Open(header) => {
                assert_eq!(header.namespace.as_deref(), Some("jabber:server"));
                assert_eq!(header.from.as_deref(), Some("remote.example"));
            }
            other => panic!("expected open, got {:?}", other),
        }
    }

    #[test]
    fn test_self_closing_element() {
        let (raw, consumed) = expect_element(b"<presence/>");
        assert_eq!(raw, "<presence/>");
        assert_eq!(consumed, b"<presence/>".len());
    }

    #[test]
    fn test_nested_element() {
        let buf = b"<iq type='get' id='1'><query xmlns='jabber:iq:roster'><item jid='u@d'/></query></iq>";
        let (raw, consumed) = expect_element(buf);
        assert!(raw.starts_with("<iq"));
        assert!(raw.ends_with("</iq>"));
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn test_consecutive_elements_in_order() {
        let buf = b"<message to='a@b'><body>1</body></message><presence/><a xmlns='urn:xmpp:sm:3' h='5'/>";
        let mut offset = 0;

        let (first, c1) = expect_element(&buf[offset..]);
        offset += c1;
        assert!(first.contains("<message"));

        let (second, c2) = expect_element(&buf[offset..]);
        offset += c2;
        assert_eq!(second, "<presence/>");

        let (third, c3) = expect_element(&buf[offset..]);
        offset += c3;
        assert!(third.contains("h="));
        assert_eq!(offset, buf.len());
    }

    #[test]
    fn test_partial_element_returns_none() {
        assert!(next_event(b"<message to='a@b'><bo").is_none());
        assert!(next_event(b"<iq type='get'><query xmlns='x'>").is_none());
    }

    #[test]
    fn test_stream_close() {
        let (event, consumed) = next_event(b"</stream:stream>").unwrap();
        assert_eq!(event, StreamEvent::Close);
        assert_eq!(consumed, b"</stream:stream>".len());
    }

    #[test]
    fn test_stream_close_with_leading_whitespace() {
        let buf = b"  \n</stream:stream>";
        let (event, consumed) = next_event(buf).unwrap();
        assert_eq!(event, StreamEvent::Close);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn test_empty_and_whitespace_buffers() {
        assert!(next_event(b"").is_none());
        assert!(next_event(b"   \n  ").is_none());
    }

    #[test]
    fn test_element_after_header_fragmented() {
        // Header first, then an element arriving in two fragments
        let header = b"<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' version='1.0'>";
        let (event, consumed) = next_event(header).unwrap();
        assert!(matches!(event, StreamEvent::Open(_)));
        assert_eq!(consumed, header.len());

        let fragment = b"<message to='a@b'><body>hel";
        assert!(next_event(fragment).is_none());

        let mut full = fragment.to_vec();
        full.extend_from_slice(b"lo</body></message>");
        let (raw, _) = expect_element(&full);
        assert!(raw.contains("hello"));
    }

    #[test]
    fn test_dialback_elements_pass_through() {
        let buf =
            b"<db:result from='a.example' to='b.example'>key</db:result><db:verify id='1'/>";
        let mut offset = 0;

        let (first, c1) = expect_element(&buf[offset..]);
        offset += c1;
        assert!(first.starts_with("<db:result"));

        let (second, c2) = expect_element(&buf[offset..]);
        offset += c2;
        assert!(second.starts_with("<db:verify"));
        assert_eq!(offset, buf.len());
    }

    #[test]
    fn test_entities_and_cdata_kept_verbatim() {
        let buf = b"<message to='a@b'><body>x &amp; <![CDATA[<raw>]]></body></message>";
        let (raw, _) = expect_element(buf);
        assert!(raw.contains("&amp;"));
        assert!(raw.contains("CDATA"));
    }
}
