//! Stream reader: one background task per connection.
//!
//! The task reads bytes from the socket, slices out complete stream
//! events with [`crate::framing`] and pushes top-level elements into an
//! unbounded FIFO queue in arrival order. The consumer polls the queue
//! with a bounded wait.
//!
//! The reader never retries: EOF, a stream-close element, an I/O error
//! or an oversized partial element all end the loop, and ending the loop
//! closes the owning session's connection so the rest of the teardown
//! cascades from there.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::framing::{self, StreamEvent, StreamHeader};
use crate::session::Session;

const READ_CHUNK_SIZE: usize = 4 * 1024;

/// Consumer half of a reader's element queue.
///
/// Single consumer by construction; elements come out in the exact order
/// the peer sent them.
pub struct ElementQueue {
    rx: UnboundedReceiver<String>,
}

impl ElementQueue {
    /// Wait up to `timeout` for the next element. `None` means no element
    /// became available in time; elements already queued are still
    /// returned after the producer has gone away.
    pub async fn get_element(&mut self, timeout: Duration) -> Option<String> {
        tokio::time::timeout(timeout, self.rx.recv()).await.ok()?
    }
}

pub struct StreamReader {
    config: Arc<Config>,
    tx: Mutex<Option<UnboundedSender<String>>>,
    session: RwLock<Option<Arc<Session>>>,
    header: RwLock<Option<StreamHeader>>,
    closed: AtomicBool,
}

impl StreamReader {
    pub fn new(config: Arc<Config>) -> (Arc<StreamReader>, ElementQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        let reader = Arc::new(StreamReader {
            config,
            tx: Mutex::new(Some(tx)),
            session: RwLock::new(None),
            header: RwLock::new(None),
            closed: AtomicBool::new(false),
        });
        (reader, ElementQueue { rx })
    }

    /// Bind the owning session. The reader starts without one because the
    /// session is only created once the stream header has been seen.
    pub fn set_session(&self, session: Arc<Session>) {
        *self.session.write() = Some(session);
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.read().clone()
    }

    /// The most recent `<stream:stream>` header, if one has been parsed.
    pub fn stream_header(&self) -> Option<StreamHeader> {
        self.header.read().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Read loop. Runs until the stream ends one way or another, then
    /// closes the reader and the bound session.
    pub async fn run<R>(self: Arc<Self>, mut stream: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut buffer: Vec<u8> = Vec::new();
        let mut chunk = [0u8; READ_CHUNK_SIZE];

        'outer: loop {
            match stream.read(&mut chunk).await {
                Ok(0) => {
                    debug!("stream reader got EOF");
                    break;
                }
                Ok(n) => {
                    buffer.extend_from_slice(&chunk[..n]);

                    let mut offset = 0;
                    while let Some((event, consumed)) = framing::next_event(&buffer[offset..]) {
                        offset += consumed;
                        match event {
                            StreamEvent::Open(header) => {
                                debug!(?header, "stream header received");
                                *self.header.write() = Some(header);
                            }
                            StreamEvent::Element(raw) => {
                                trace!(len = raw.len(), "queueing element");
                                if !self.push(raw) {
                                    break 'outer;
                                }
                            }
                            StreamEvent::Close => {
                                debug!("peer closed the stream");
                                break 'outer;
                            }
                        }
                    }
                    if offset > 0 {
                        buffer.drain(..offset);
                    }

                    if buffer.len() > self.config.max_stanza_buffer_size {
                        warn!(
                            buffered = buffer.len(),
                            limit = self.config.max_stanza_buffer_size,
                            "partial element exceeds buffer limit; dropping connection"
                        );
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "stream read failed");
                    break;
                }
            }
        }

        self.close();
    }

    fn push(&self, raw: String) -> bool {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(raw).is_ok(),
            None => false,
        }
    }

    /// Mark the reader closed, end the queue after its backlog drains and
    /// close the owning session. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.tx.lock().take();
        if let Some(session) = self.session.read().clone() {
            session.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jid::Jid;
    use tokio::io::AsyncWriteExt;

    const POLL: Duration = Duration::from_millis(200);
    const SHORT_POLL: Duration = Duration::from_millis(50);

    fn reader() -> (Arc<StreamReader>, ElementQueue) {
        StreamReader::new(Arc::new(Config::default()))
    }

    #[tokio::test]
    async fn test_elements_come_out_in_order() {
        let (reader, mut queue) = reader();
        let (mut client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(reader.clone().run(server));

        client
            .write_all(b"<message to='a@b'><body>1</body></message><iq type='get' id='1'/><presence/>")
            .await
            .unwrap();

        assert!(queue.get_element(POLL).await.unwrap().contains("<body>1</body>"));
        assert!(queue.get_element(POLL).await.unwrap().starts_with("<iq"));
        assert_eq!(queue.get_element(POLL).await.unwrap(), "<presence/>");

        drop(client);
        task.await.unwrap();
        assert!(reader.is_closed());
    }

    #[tokio::test]
    async fn test_message_presence_close_scenario() {
        let (reader, mut queue) = reader();
        let (session, _writer_rx) = Session::new(
            Jid::parse("alice@example.com/desktop").unwrap(),
            Arc::new(Config::default()),
        );
        reader.set_session(session.clone());

        let (mut client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(reader.clone().run(server));

        client
            .write_all(b"<message to='b@c'><body>hi</body></message><presence/></stream:stream>")
            .await
            .unwrap();

        // Both elements arrive, in order, then the stream close takes effect
        assert!(queue.get_element(POLL).await.unwrap().contains("hi"));
        assert_eq!(queue.get_element(POLL).await.unwrap(), "<presence/>");
        assert!(queue.get_element(SHORT_POLL).await.is_none());

        task.await.unwrap();
        assert!(reader.is_closed());
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_stream_header_is_recorded_not_queued() {
        let (reader, mut queue) = reader();
        let (mut client, server) = tokio::io::duplex(4096);
        tokio::spawn(reader.clone().run(server));

        client
            .write_all(b"<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' to='example.com' version='1.0'><presence/>")
            .await
            .unwrap();

        assert_eq!(queue.get_element(POLL).await.unwrap(), "<presence/>");
        let header = reader.stream_header().unwrap();
        assert_eq!(header.to.as_deref(), Some("example.com"));
    }

    #[tokio::test]
    async fn test_fragmented_element_is_reassembled() {
        let (reader, mut queue) = reader();
        let (mut client, server) = tokio::io::duplex(4096);
        tokio::spawn(reader.clone().run(server));

        client.write_all(b"<message to='a@b'><body>hel").await.unwrap();
        assert!(queue.get_element(SHORT_POLL).await.is_none());

        client.write_all(b"lo</body></message>").await.unwrap();
        assert!(queue.get_element(POLL).await.unwrap().contains("hello"));
    }

    #[tokio::test]
    async fn test_dialback_elements_pass_through_in_order() {
        let (reader, mut queue) = reader();
        let (mut client, server) = tokio::io::duplex(4096);
        tokio::spawn(reader.clone().run(server));

        client
            .write_all(b"<db:result from='a.example' to='b.example'>key</db:result><db:verify id='v1' from='a.example'/>")
            .await
            .unwrap();

        assert!(queue.get_element(POLL).await.unwrap().starts_with("<db:result"));
        assert!(queue.get_element(POLL).await.unwrap().starts_with("<db:verify"));
    }

    #[tokio::test]
    async fn test_oversized_partial_element_drops_connection() {
        let config = Arc::new(Config {
            max_stanza_buffer_size: 256,
            ..Config::default()
        });
        let (reader, _queue) = StreamReader::new(config);
        let (mut client, server) = tokio::io::duplex(8192);
        let task = tokio::spawn(reader.clone().run(server));

        let oversized = format!("<message to='a@b'><body>{}", "x".repeat(1024));
        client.write_all(oversized.as_bytes()).await.unwrap();

        task.await.unwrap();
        assert!(reader.is_closed());
    }

    #[tokio::test]
    async fn test_eof_closes_reader_and_session() {
        let (reader, _queue) = reader();
        let (session, _writer_rx) = Session::new(
            Jid::parse("alice@example.com/desktop").unwrap(),
            Arc::new(Config::default()),
        );
        reader.set_session(session.clone());

        let (client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(reader.clone().run(server));
        drop(client);

        task.await.unwrap();
        assert!(reader.is_closed());
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_queued_elements_survive_close() {
        let (reader, mut queue) = reader();
        let (mut client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(reader.clone().run(server));

        client.write_all(b"<presence/></stream:stream>").await.unwrap();
        task.await.unwrap();

        // The element queued before the close is still delivered
        assert_eq!(queue.get_element(POLL).await.unwrap(), "<presence/>");
        assert!(queue.get_element(SHORT_POLL).await.is_none());
    }
}
