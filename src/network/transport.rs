//! UDP transport
//!
//! Seals envelopes for a single recipient and opens inbound datagrams.
//! Every failure here ends with the datagram dropped and logged; nothing
//! is retried.

use rsa::RsaPrivateKey;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;

use super::directory::PeerInfo;
use crate::protocol::{CodecError, Envelope, PacketCodec, MAX_DATAGRAM_SIZE};

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("No public key for peer {0}")]
    NoPublicKey(uuid::Uuid),

    #[error("No private key configured")]
    NoPrivateKey,

    #[error("Bind failed: {0}")]
    BindFailed(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Transport statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TransportStats {
    pub datagrams_sent: u64,
    pub datagrams_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    datagrams_sent: AtomicU64,
    datagrams_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    dropped: AtomicU64,
}

/// A bound UDP socket plus the packet codec
#[derive(Debug, Clone)]
pub struct Transport {
    socket: Arc<UdpSocket>,
    codec: Arc<PacketCodec>,
    counters: Arc<Counters>,
}

impl Transport {
    pub async fn bind(addr: SocketAddr, codec: PacketCodec) -> TransportResult<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| TransportError::BindFailed(format!("Failed to bind to {}: {}", addr, e)))?;
        tracing::info!("Listening on udp://{}", socket.local_addr()?);

        Ok(Self {
            socket: Arc::new(socket),
            codec: Arc::new(codec),
            counters: Arc::new(Counters::default()),
        })
    }

    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Seal and send one envelope
    pub async fn send(&self, envelope: &Envelope, to: &PeerInfo) -> TransportResult<()> {
        let key = to.public_key.as_ref().ok_or(TransportError::NoPublicKey(to.id))?;
        let packet = self.codec.seal(envelope, key)?;
        let n = self.socket.send_to(&packet, to.socket_addr()).await?;

        self.counters.datagrams_sent.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
        tracing::trace!(
            "Sent {:?} {} to {} ({} bytes)",
            envelope.message.kind(),
            envelope.id,
            to.socket_addr(),
            n
        );
        Ok(())
    }

    /// Wait for the next datagram
    pub async fn recv(&self) -> TransportResult<(Vec<u8>, SocketAddr)> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let (n, from) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(n);

        self.counters.datagrams_received.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
        Ok((buf, from))
    }

    /// Decrypt and decode a datagram, logging and counting any failure
    pub fn open(
        &self,
        packet: &[u8],
        from: SocketAddr,
        key: Option<&RsaPrivateKey>,
    ) -> Option<Envelope> {
        let result = match key {
            Some(key) => self.codec.open(packet, key).map_err(TransportError::from),
            None => Err(TransportError::NoPrivateKey),
        };

        match result {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Dropped {} byte datagram from {}: {}", packet.len(), from, e);
                None
            }
        }
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            datagrams_sent: self.counters.datagrams_sent.load(Ordering::Relaxed),
            datagrams_received: self.counters.datagrams_received.load(Ordering::Relaxed),
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}
