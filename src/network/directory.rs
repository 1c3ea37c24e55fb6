//! Known peers
//!
//! Static entries come from configuration with their public keys. Peers
//! first seen on the wire are added without a key; we can read their
//! messages but cannot answer until a key is configured for them.

use rsa::RsaPublicKey;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Identity and address of one peer
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    pub id: Uuid,
    pub address: IpAddr,
    pub port: u16,
    /// Needed to encrypt anything sent to this peer
    pub public_key: Option<RsaPublicKey>,
}

impl PeerInfo {
    pub fn new(id: Uuid, addr: SocketAddr, public_key: Option<RsaPublicKey>) -> Self {
        Self {
            id,
            address: addr.ip(),
            port: addr.port(),
            public_key,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

/// Directory of peers keyed by id
#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: RwLock<HashMap<Uuid, PeerInfo>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_peers(peers: impl IntoIterator<Item = PeerInfo>) -> Self {
        Self {
            peers: RwLock::new(peers.into_iter().map(|p| (p.id, p)).collect()),
        }
    }

    pub async fn insert(&self, peer: PeerInfo) {
        self.peers.write().await.insert(peer.id, peer);
    }

    pub async fn get(&self, id: &Uuid) -> Option<PeerInfo> {
        self.peers.read().await.get(id).cloned()
    }

    pub async fn all(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Record that `id` just sent us a datagram from `addr`
    pub async fn observe(&self, id: Uuid, addr: SocketAddr) -> PeerInfo {
        let mut peers = self.peers.write().await;
        let entry = peers.entry(id).or_insert_with(|| {
            tracing::info!("Discovered peer {} at {}", id, addr);
            PeerInfo::new(id, addr, None)
        });

        if entry.socket_addr() != addr {
            tracing::debug!("Peer {} moved from {} to {}", id, entry.socket_addr(), addr);
            entry.address = addr.ip();
            entry.port = addr.port();
        }
        entry.clone()
    }
}
