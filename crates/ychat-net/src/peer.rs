//! One live stream to a remote node.
//!
//! A [`Peer`] is the cloneable write side; its [`PeerReader`] is consumed by
//! [`PeerReader::read_loop`], the only reader of the stream.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use libp2p::{Multiaddr, PeerId};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use ychat_shared::Envelope;

use crate::codec::EnvelopeCodec;
use crate::error::{NetError, Result};

/// Any bidirectional byte stream a peer can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn AsyncStream>;

type Writer = FramedWrite<WriteHalf<BoxedStream>, EnvelopeCodec>;
type Reader = FramedRead<ReadHalf<BoxedStream>, EnvelopeCodec>;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// How long a finished read loop waits to flush and shut the write half.
const WRITER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerStatus {
    /// Stream is up, relationship not yet accepted.
    Pending,
    Active,
    Inactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Emitted exactly once when a read loop ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerRemoval {
    pub peer_id: PeerId,
    /// Identifies the stream, so a stale removal never evicts a newer one.
    pub conn_id: u64,
}

#[derive(Clone)]
pub struct Peer {
    peer_id: PeerId,
    address: Option<Multiaddr>,
    direction: Direction,
    status: PeerStatus,
    conn_id: u64,
    writer: Arc<Mutex<Writer>>,
    closed: CancellationToken,
}

pub struct PeerReader {
    peer_id: PeerId,
    conn_id: u64,
    frames: Reader,
    writer: Arc<Mutex<Writer>>,
    closed: CancellationToken,
}

impl Peer {
    /// Split `stream` into a sendable [`Peer`] (status `Pending`) and the
    /// reader that must be driven by [`PeerReader::read_loop`].
    pub fn new(
        peer_id: PeerId,
        address: Option<Multiaddr>,
        direction: Direction,
        stream: BoxedStream,
    ) -> (Peer, PeerReader) {
        let (read_half, write_half) = tokio::io::split(stream);
        let writer = Arc::new(Mutex::new(FramedWrite::new(write_half, EnvelopeCodec::new())));
        let closed = CancellationToken::new();
        let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);

        let peer = Peer {
            peer_id,
            address,
            direction,
            status: PeerStatus::Pending,
            conn_id,
            writer: Arc::clone(&writer),
            closed: closed.clone(),
        };
        let reader = PeerReader {
            peer_id,
            conn_id,
            frames: FramedRead::new(read_half, EnvelopeCodec::new()),
            writer,
            closed,
        };
        (peer, reader)
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn address(&self) -> Option<&Multiaddr> {
        self.address.as_ref()
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn status(&self) -> PeerStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: PeerStatus) {
        self.status = status;
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Write one newline-terminated frame. Concurrent senders are serialized
    /// on the writer lock, so frames never interleave. A send still waiting
    /// on the lock or on a full stream gives up with `PeerClosed` as soon as
    /// the peer is closed.
    pub async fn send(&self, envelope: &Envelope) -> Result<()> {
        let write = async {
            let mut writer = self.writer.lock().await;
            writer.send(envelope).await
        };

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(NetError::PeerClosed(self.peer_id)),
            res = write => {
                res?;
                debug!(peer = %self.peer_id, kind = %envelope.kind, "Sent envelope");
                Ok(())
            }
        }
    }

    /// Fire-and-forget [`send`](Self::send); failures are logged.
    pub fn send_detached(&self, envelope: Envelope) {
        let peer = self.clone();
        tokio::spawn(async move {
            if let Err(e) = peer.send(&envelope).await {
                warn!(peer = %peer.peer_id, kind = %envelope.kind, error = %e, "Send failed");
            }
        });
    }

    /// Stop the read loop, which then shuts the stream down.
    pub fn close(&self) {
        self.closed.cancel();
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("peer_id", &self.peer_id)
            .field("address", &self.address)
            .field("direction", &self.direction)
            .field("status", &self.status)
            .field("conn_id", &self.conn_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PeerReader {
    /// Decode frames until the stream ends, an I/O error occurs, or the peer
    /// is closed. Decoded envelopes go to `inbound` with `from` set to the
    /// authenticated peer id. On every exit path one [`PeerRemoval`] is sent
    /// first, then the stream is shut down.
    pub async fn read_loop(
        mut self,
        inbound: mpsc::Sender<Envelope>,
        removal: mpsc::Sender<PeerRemoval>,
    ) {
        let peer = self.peer_id.to_string();

        loop {
            let frame = tokio::select! {
                _ = self.closed.cancelled() => {
                    debug!(peer = %peer, "Read loop cancelled");
                    break;
                }
                frame = self.frames.next() => frame,
            };

            let line = match frame {
                None => {
                    debug!(peer = %peer, "Stream closed by remote");
                    break;
                }
                Some(Err(e)) => {
                    warn!(peer = %peer, error = %e, "Read failed, dropping peer");
                    break;
                }
                Some(Ok(line)) => line,
            };

            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            let mut envelope = match Envelope::from_json(&line) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Dropping malformed envelope");
                    continue;
                }
            };

            match envelope.from.as_deref() {
                Some(claimed) if claimed == peer => {}
                Some(claimed) => {
                    warn!(peer = %peer, claimed = %claimed, "Sender mismatch, using stream identity");
                    envelope.from = Some(peer.clone());
                }
                None => envelope.from = Some(peer.clone()),
            }

            tokio::select! {
                _ = self.closed.cancelled() => break,
                sent = inbound.send(envelope) => {
                    if sent.is_err() {
                        debug!(peer = %peer, "Inbound channel closed");
                        break;
                    }
                }
            }
        }

        // Pending sends see the cancel and release the writer.
        self.closed.cancel();
        let _ = removal
            .send(PeerRemoval {
                peer_id: self.peer_id,
                conn_id: self.conn_id,
            })
            .await;

        let shutdown = async { self.writer.lock().await.close().await };
        match tokio::time::timeout(WRITER_SHUTDOWN_TIMEOUT, shutdown).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(peer = %peer, error = %e, "Stream shutdown failed"),
            Err(_) => debug!(peer = %peer, "Stream shutdown timed out, dropping it"),
        }
    }
}
