//! # Stream Transport
//!
//! Transmissions travel over any reliable byte stream (TCP in the node). The
//! 6-byte transmission header carries the body length, so the reader needs no
//! extra framing:
//!
//! ```text
//! ┌──────────────┬────────────────────────┐
//! │ header (6 B) │ compressed body (len B)│ ...next transmission
//! └──────────────┴────────────────────────┘
//! ```
//!
//! ## Links
//!
//! Each connection gets one [`PeerLink`]: a bounded queue drained by a
//! dedicated writer task, so a slow peer never blocks the reader or other
//! peers. Closing a link flushes what was already queued (a final NACK, for
//! example) before the stream is shut down.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::wire::{TRANSMISSION_HEADER_LEN, parse_transmission_header};

/// Outbound transmissions buffered per link before senders wait.
const LINK_QUEUE_CAPACITY: usize = 1024;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Read one whole transmission, header included.
///
/// Returns `Ok(None)` when the stream ends cleanly between transmissions.
pub async fn read_transmission<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; TRANSMISSION_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let (_, body_len) = parse_transmission_header(&header);
    if body_len > max_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("transmission of {body_len} bytes exceeds limit of {max_size}"),
        ));
    }

    let mut transmission = vec![0u8; TRANSMISSION_HEADER_LEN + body_len];
    transmission[..TRANSMISSION_HEADER_LEN].copy_from_slice(&header);
    reader
        .read_exact(&mut transmission[TRANSMISSION_HEADER_LEN..])
        .await?;
    Ok(Some(transmission))
}

/// Handle to the writer half of one connection. Cheap to clone.
#[derive(Clone, Debug)]
pub struct PeerLink {
    id: u64,
    tx: mpsc::Sender<Vec<u8>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl PeerLink {
    /// Start the writer task for `writer`.
    pub fn spawn<W>(writer: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let id = NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(LINK_QUEUE_CAPACITY);
        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(write_loop(id, writer, rx, shutdown_rx));
        Self {
            id,
            tx,
            shutdown: Arc::new(shutdown),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue a transmission. Fails once the link is closing.
    pub async fn send(&self, transmission: Vec<u8>) -> io::Result<()> {
        if *self.shutdown.borrow() {
            return Err(link_closed());
        }
        self.tx.send(transmission).await.map_err(|_| link_closed())
    }

    /// Flush what is queued, then shut the stream down.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow() || self.tx.is_closed()
    }

    /// Resolves once the writer task has exited.
    pub async fn closed(&self) {
        self.tx.closed().await;
    }
}

fn link_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "link closed")
}

async fn write_loop<W>(
    id: u64,
    mut writer: W,
    mut rx: mpsc::Receiver<Vec<u8>>,
    mut shutdown: watch::Receiver<bool>,
) where
    W: AsyncWrite + Unpin,
{
    let mut healthy = true;
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            next = rx.recv() => match next {
                Some(transmission) => {
                    if let Err(e) = writer.write_all(&transmission).await {
                        debug!(link = id, error = %e, "link write failed");
                        healthy = false;
                        break;
                    }
                    trace!(link = id, bytes = transmission.len(), "transmission written");
                }
                None => break,
            },
        }
    }

    rx.close();
    if healthy {
        while let Ok(transmission) = rx.try_recv() {
            if writer.write_all(&transmission).await.is_err() {
                break;
            }
        }
        let _ = writer.flush().await;
    }
    let _ = writer.shutdown().await;
    trace!(link = id, "link writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressionRegistry;
    use crate::wire::encode_transmission;
    use tokio::io::duplex;
    use tokio::time::{Duration, timeout};

    fn transmission(body: &[u8]) -> Vec<u8> {
        encode_transmission(&CompressionRegistry::default(), 0, &[body]).expect("encode")
    }

    #[tokio::test]
    async fn reads_back_to_back_transmissions() {
        let (mut client, mut server) = duplex(4096);
        let first = transmission(b"first");
        let second = transmission(b"second record");
        client.write_all(&first).await.expect("write");
        client.write_all(&second).await.expect("write");
        drop(client);

        assert_eq!(read_transmission(&mut server, 1024).await.expect("read"), Some(first));
        assert_eq!(read_transmission(&mut server, 1024).await.expect("read"), Some(second));
        assert_eq!(read_transmission(&mut server, 1024).await.expect("read"), None);
    }

    #[tokio::test]
    async fn oversized_transmission_is_refused() {
        let (mut client, mut server) = duplex(4096);
        client.write_all(&transmission(&[7u8; 100])).await.expect("write");
        let err = read_transmission(&mut server, 10).await.expect_err("too large");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn truncated_body_is_an_error() {
        let (mut client, mut server) = duplex(4096);
        let full = transmission(b"cut short");
        client.write_all(&full[..full.len() - 3]).await.expect("write");
        drop(client);
        let err = read_transmission(&mut server, 1024).await.expect_err("truncated");
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn close_flushes_queued_transmissions() {
        let (client, mut server) = duplex(64 * 1024);
        let link = PeerLink::spawn(client);
        let records: Vec<Vec<u8>> = (0..5u8).map(|i| transmission(&[i; 16])).collect();
        for record in &records {
            link.send(record.clone()).await.expect("queue");
        }
        link.close();
        assert!(link.is_closed());
        assert!(link.send(transmission(b"late")).await.is_err());

        for record in &records {
            let read = timeout(Duration::from_secs(1), read_transmission(&mut server, 1024))
                .await
                .expect("no stall")
                .expect("read");
            assert_eq!(read.as_ref(), Some(record));
        }
        let end = timeout(Duration::from_secs(1), read_transmission(&mut server, 1024))
            .await
            .expect("no stall")
            .expect("read");
        assert_eq!(end, None);
        timeout(Duration::from_secs(1), link.closed()).await.expect("writer exits");
    }

    #[tokio::test]
    async fn links_get_distinct_ids() {
        let (a, _a_peer) = duplex(64);
        let (b, _b_peer) = duplex(64);
        let first = PeerLink::spawn(a);
        let second = PeerLink::spawn(b);
        assert_ne!(first.id(), second.id());
        assert_eq!(first.clone().id(), first.id());
    }
}
