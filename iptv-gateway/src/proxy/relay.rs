//! Byte relay between an upstream response and a client body.

use std::io;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use super::session::SessionLease;
use crate::config::MAX_BUFFER_SIZE;

/// Chunks buffered between the pump and a slow client.
const RELAY_QUEUE_DEPTH: usize = 16;

/// Client-facing body of a relayed stream.
pub type RelayStream = ReceiverStream<io::Result<Bytes>>;

/// Why a relay stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEnd {
    /// Upstream finished cleanly.
    Eof,
    ClientGone,
    UpstreamFault(String),
}

/// Start pumping `upstream` into a bounded channel and return its receiving end.
///
/// The pump owns `lease`, so the session is finalized when the pump stops for
/// any reason, including a panic.
pub fn spawn_relay<S, E>(upstream: S, chunk_size: usize, lease: SessionLease) -> RelayStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let (tx, rx) = mpsc::channel(RELAY_QUEUE_DEPTH);
    tokio::spawn(async move {
        let end = pump(upstream, chunk_size, &tx).await;
        match &end {
            RelayEnd::UpstreamFault(cause) => {
                warn!(key = lease.key(), cause = %cause, "Relay ended by upstream fault")
            }
            _ => debug!(key = lease.key(), end = ?end, "Relay ended"),
        }
        lease.release().await;
    });
    ReceiverStream::new(rx)
}

async fn pump<S, E>(mut upstream: S, chunk_size: usize, tx: &mpsc::Sender<io::Result<Bytes>>) -> RelayEnd
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    let mut chunker = Rechunker::new(chunk_size);
    loop {
        let next = tokio::select! {
            _ = tx.closed() => return RelayEnd::ClientGone,
            next = upstream.next() => next,
        };

        match next {
            Some(Ok(data)) => {
                for chunk in chunker.push(data) {
                    if tx.send(Ok(chunk)).await.is_err() {
                        return RelayEnd::ClientGone;
                    }
                }
            }
            Some(Err(e)) => {
                let cause = e.to_string();
                // Surface the fault so the client sees a truncated body, not a clean end.
                let _ = tx.send(Err(io::Error::other(e))).await;
                return RelayEnd::UpstreamFault(cause);
            }
            None => {
                if let Some(rest) = chunker.finish()
                    && tx.send(Ok(rest)).await.is_err()
                {
                    return RelayEnd::ClientGone;
                }
                return RelayEnd::Eof;
            }
        }
    }
}

/// Regroups arbitrary upstream frames into fixed-size chunks.
struct Rechunker {
    size: usize,
    pending: BytesMut,
}

impl Rechunker {
    fn new(size: usize) -> Self {
        let size = size.clamp(1, MAX_BUFFER_SIZE);
        Self {
            size,
            pending: BytesMut::with_capacity(size),
        }
    }

    fn push(&mut self, data: Bytes) -> Vec<Bytes> {
        self.pending.extend_from_slice(&data);
        let mut ready = Vec::with_capacity(self.pending.len() / self.size);
        while self.pending.len() >= self.size {
            ready.push(self.pending.split_to(self.size).freeze());
        }
        ready
    }

    fn finish(&mut self) -> Option<Bytes> {
        (!self.pending.is_empty()).then(|| self.pending.split().freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[test]
    fn test_rechunker_caps_chunk_size() {
        let mut chunker = Rechunker::new(1usize << 60);
        assert_eq!(chunker.size, MAX_BUFFER_SIZE);
        assert!(chunker.push(Bytes::from_static(b"ts")).is_empty());
        assert_eq!(chunker.finish(), Some(Bytes::from_static(b"ts")));
    }

    #[test]
    fn test_rechunker_preserves_bytes() {
        let mut chunker = Rechunker::new(4);
        let mut out = chunker.push(Bytes::from_static(b"abcdef"));
        out.extend(chunker.push(Bytes::from_static(b"gh")));
        out.extend(chunker.push(Bytes::from_static(b"i")));
        assert_eq!(out, vec![Bytes::from_static(b"abcd"), Bytes::from_static(b"efgh")]);
        assert_eq!(chunker.finish(), Some(Bytes::from_static(b"i")));
        assert_eq!(chunker.finish(), None);
    }

    #[tokio::test]
    async fn test_pump_relays_until_eof() {
        let upstream = stream::iter(vec![
            Ok::<_, io::Error>(Bytes::from_static(b"0123456789")),
            Ok(Bytes::from_static(b"abc")),
        ]);
        let (tx, mut rx) = mpsc::channel(16);

        let end = pump(upstream, 5, &tx).await;
        drop(tx);
        assert_eq!(end, RelayEnd::Eof);

        let mut received = Vec::new();
        while let Some(chunk) = rx.recv().await {
            received.push(chunk.unwrap());
        }
        assert_eq!(received.iter().map(Bytes::len).collect::<Vec<_>>(), vec![5, 5, 3]);
        assert_eq!(received.concat(), b"0123456789abc");
    }

    #[tokio::test]
    async fn test_pump_stops_when_client_leaves() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let end = pump(stream::pending::<Result<Bytes, io::Error>>(), 8, &tx).await;
        assert_eq!(end, RelayEnd::ClientGone);
    }

    #[tokio::test]
    async fn test_pump_forwards_upstream_fault() {
        let upstream = stream::iter(vec![
            Ok(Bytes::from_static(b"abcd")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer")),
        ]);
        let (tx, mut rx) = mpsc::channel(16);

        let end = pump(upstream, 4, &tx).await;
        assert!(matches!(end, RelayEnd::UpstreamFault(ref cause) if cause.contains("reset")));
        assert!(rx.recv().await.unwrap().is_ok());
        assert!(rx.recv().await.unwrap().is_err());
    }
}
