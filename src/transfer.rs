//! Proxied byte-stream relay: server-mediated file transfer legs.
//!
//! A transfer pairs the initiator's socket with the target's socket and
//! copies bytes half-duplex in fixed-size blocks until the source side
//! reaches EOF. Both ends are closed unconditionally afterwards, success
//! or not. Every relayed block is added to a statistics counter shared
//! across all transfers of the proxy service.
//!
//! Activating a transfer without both sockets, or attaching its task
//! twice, is a caller bug and panics.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::Result;

/// Cumulative bytes relayed by the proxy service, shared by all
/// transfers.
#[derive(Default)]
pub struct TransferStatistics {
    bytes: Mutex<u64>,
}

impl TransferStatistics {
    pub fn new() -> Arc<TransferStatistics> {
        Arc::new(TransferStatistics::default())
    }

    pub fn add(&self, n: u64) {
        *self.bytes.lock() += n;
    }

    pub fn total(&self) -> u64 {
        *self.bytes.lock()
    }
}

pub struct ProxyTransfer<R, W> {
    reader: Mutex<Option<R>>,
    writer: Mutex<Option<W>>,
    block_size: usize,
    stats: Arc<TransferStatistics>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<R, W> ProxyTransfer<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(stats: Arc<TransferStatistics>, block_size: usize) -> Self {
        Self {
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            block_size,
            stats,
            task: Mutex::new(None),
        }
    }

    /// Register the socket bytes are read from.
    pub fn set_reader(&self, reader: R) {
        *self.reader.lock() = Some(reader);
    }

    /// Register the socket bytes are written to.
    pub fn set_writer(&self, writer: W) {
        *self.writer.lock() = Some(writer);
    }

    /// A transfer can only run once both sockets are registered.
    pub fn is_activatable(&self) -> bool {
        self.reader.lock().is_some() && self.writer.lock().is_some()
    }

    /// Attach the task driving this transfer. One-shot: a second attach
    /// panics.
    pub fn attach(&self, handle: JoinHandle<()>) {
        let mut task = self.task.lock();
        if task.is_some() {
            panic!("transfer task already attached");
        }
        *task = Some(handle);
    }

    /// Abort the attached task, if any.
    pub fn abort(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    /// Relay bytes until EOF, then close both sockets. Returns the total
    /// number of bytes relayed. The sockets are consumed and closed even
    /// when the copy fails mid-way.
    pub async fn do_transfer(&self) -> Result<u64> {
        let mut reader = match self.reader.lock().take() {
            Some(reader) => reader,
            None => panic!("transfer activated without a reader socket"),
        };
        let mut writer = match self.writer.lock().take() {
            Some(writer) => writer,
            None => panic!("transfer activated without a writer socket"),
        };

        let result = self.copy(&mut reader, &mut writer).await;

        // Close both ends regardless of how the copy went
        let _ = writer.shutdown().await;
        drop(reader);
        drop(writer);

        match &result {
            Ok(total) => debug!(total, "transfer complete"),
            Err(e) => debug!(error = %e, "transfer aborted"),
        }
        result
    }

    async fn copy(&self, reader: &mut R, writer: &mut W) -> Result<u64> {
        let mut block = vec![0u8; self.block_size];
        let mut total: u64 = 0;
        loop {
            let n = reader.read(&mut block).await?;
            if n == 0 {
                return Ok(total);
            }
            writer.write_all(&block[..n]).await?;
            self.stats.add(n as u64);
            total += n as u64;
            trace!(n, total, "relayed block");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, DuplexStream};

    fn transfer(
        stats: Arc<TransferStatistics>,
    ) -> ProxyTransfer<DuplexStream, DuplexStream> {
        ProxyTransfer::new(stats, 8 * 1024)
    }

    #[tokio::test]
    async fn test_transfer_copies_all_bytes_and_closes_both_ends() {
        let stats = TransferStatistics::new();
        let t = transfer(stats.clone());

        let (mut source, transfer_in) = duplex(64 * 1024);
        let (transfer_out, mut sink) = duplex(64 * 1024);
        t.set_reader(transfer_in);
        t.set_writer(transfer_out);
        assert!(t.is_activatable());

        // More than two blocks, not block-aligned
        let payload = vec![0xabu8; 20_000];
        let send = {
            let payload = payload.clone();
            tokio::spawn(async move {
                source.write_all(&payload).await.unwrap();
                source.shutdown().await.unwrap();
            })
        };
        let drain = tokio::spawn(async move {
            let mut received = Vec::new();
            sink.read_to_end(&mut received).await.unwrap();
            received
        });

        let total = t.do_transfer().await.unwrap();
        send.await.unwrap();
        let received = drain.await.unwrap();

        assert_eq!(total, 20_000);
        assert_eq!(received, payload);
        assert_eq!(stats.total(), 20_000);
    }

    #[tokio::test]
    async fn test_statistics_accumulate_across_transfers() {
        let stats = TransferStatistics::new();
        for _ in 0..2 {
            let t = transfer(stats.clone());
            let (mut source, transfer_in) = duplex(4096);
            let (transfer_out, mut sink) = duplex(4096);
            t.set_reader(transfer_in);
            t.set_writer(transfer_out);

            tokio::spawn(async move {
                source.write_all(&[1u8; 100]).await.unwrap();
                source.shutdown().await.unwrap();
            });
            let drain = tokio::spawn(async move {
                let mut out = Vec::new();
                sink.read_to_end(&mut out).await.unwrap();
            });
            t.do_transfer().await.unwrap();
            drain.await.unwrap();
        }
        assert_eq!(stats.total(), 200);
    }

    #[tokio::test]
    async fn test_not_activatable_until_both_sockets_registered() {
        let t = transfer(TransferStatistics::new());
        assert!(!t.is_activatable());
        let (_a, b) = duplex(16);
        t.set_reader(b);
        assert!(!t.is_activatable());
    }

    #[tokio::test]
    #[should_panic(expected = "without a reader")]
    async fn test_transfer_without_sockets_panics() {
        let t = transfer(TransferStatistics::new());
        let _ = t.do_transfer().await;
    }

    #[tokio::test]
    #[should_panic(expected = "already attached")]
    async fn test_second_attach_panics() {
        let t = transfer(TransferStatistics::new());
        t.attach(tokio::spawn(async {}));
        t.attach(tokio::spawn(async {}));
    }
}
