//! Peer discovery and reconciliation
//!
//! Peers announce themselves with a Discovery message carrying a digest of
//! their inventory. A peer whose digest differs answers by advertising its
//! own inventory, which the other side then pulls from via GetHistory.

use sha2::{Digest, Sha256};

use crate::network::{Peer, PeerInfo};
use crate::protocol::Message;
use crate::repository::InventoryEntry;

/// Digest of an inventory: SHA-256 over `(id, last_modified)` pairs in id
/// order, truncated to the first eight bytes
pub fn inventory_hash(entries: &[InventoryEntry]) -> i64 {
    let mut sorted: Vec<&InventoryEntry> = entries.iter().collect();
    sorted.sort_by_key(|e| e.id);

    let mut hasher = Sha256::new();
    for entry in sorted {
        hasher.update(entry.id.as_bytes());
        hasher.update(entry.last_modified.ticks().to_be_bytes());
    }
    let digest = hasher.finalize();

    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(head)
}

/// Announce this peer and its inventory digest to everyone
pub async fn announce(peer: &Peer) {
    let hash = inventory_hash(&peer.repository().inventory().await);
    tracing::trace!("Announcing {} with inventory hash {:016x}", peer.id(), hash);
    peer.broadcast(Message::Discovery {
        hash,
        is_reply: false,
    })
    .await;
}

/// Send one Inventory message per held object, to `target` or to everyone
pub async fn advertise_inventory(peer: &Peer, target: Option<&PeerInfo>) {
    let inventory = peer.repository().inventory().await;
    if inventory.is_empty() {
        return;
    }
    tracing::debug!("Advertising {} objects", inventory.len());

    for entry in inventory {
        let message = Message::Inventory {
            object: entry.id,
            owner: entry.owner,
            last_modified: entry.last_modified,
        };
        match target {
            Some(to) => peer.send(to, message).await,
            None => peer.broadcast(message).await,
        };
    }
}

/// React to a Discovery from `sender`
pub async fn on_peer_discovery(peer: &Peer, sender: &PeerInfo, hash: i64, is_reply: bool) {
    if sender.id == peer.id() {
        return;
    }

    let local = inventory_hash(&peer.repository().inventory().await);
    tracing::debug!(
        "Discovery from {} at {} (hash {:016x}, ours {:016x})",
        sender.id,
        sender.socket_addr(),
        hash,
        local
    );

    if hash != local {
        advertise_inventory(peer, Some(sender)).await;
    }

    if !is_reply {
        peer.send(
            sender,
            Message::Discovery {
                hash: local,
                is_reply: true,
            },
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::PseudoTime;
    use crate::network::test_support::*;
    use crate::network::Target;
    use crate::protocol::{ObjectSnapshot, PropertyMap};
    use uuid::Uuid;

    fn entry(id: u128, ticks: u64) -> InventoryEntry {
        InventoryEntry {
            id: Uuid::from_u128(id),
            owner: Uuid::nil(),
            last_modified: PseudoTime::new(ticks),
        }
    }

    async fn add_object(peer: &Peer) -> Uuid {
        let snapshot = ObjectSnapshot {
            id: Uuid::new_v4(),
            device: peer.id(),
            object_type: "note".into(),
            user: Uuid::nil(),
            created: peer.now(),
            last_modified: peer.now(),
            data: PropertyMap::new(),
        };
        let id = snapshot.id;
        peer.repository()
            .object_created(snapshot, peer.id())
            .await
            .unwrap();
        id
    }

    #[test]
    fn test_hash_ignores_order() {
        let a = [entry(1, 5), entry(2, 7)];
        let b = [entry(2, 7), entry(1, 5)];
        assert_eq!(inventory_hash(&a), inventory_hash(&b));
    }

    #[test]
    fn test_hash_tracks_versions() {
        let before = [entry(1, 5), entry(2, 7)];
        let after = [entry(1, 5), entry(2, 8)];
        assert_ne!(inventory_hash(&before), inventory_hash(&after));
        assert_ne!(inventory_hash(&[]), inventory_hash(&before));
    }

    #[tokio::test]
    async fn test_announce_broadcasts_hash() {
        let (peer, mut rx) = peer();
        add_object(&peer).await;
        announce(&peer).await;

        let expected = inventory_hash(&peer.repository().inventory().await);
        let out = drain(&mut rx);
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0].target, Target::Broadcast));
        assert_eq!(
            out[0].envelope.message,
            Message::Discovery {
                hash: expected,
                is_reply: false,
            }
        );
    }

    #[tokio::test]
    async fn test_matching_hash_only_replies() {
        let (peer, mut rx) = peer();
        let other = info(Uuid::new_v4(), 7000);
        let hash = inventory_hash(&[]);

        on_peer_discovery(&peer, &other, hash, false).await;
        let out = drain(&mut rx);
        assert_eq!(out.len(), 1);
        assert_eq!(
            out[0].envelope.message,
            Message::Discovery {
                hash,
                is_reply: true,
            }
        );

        on_peer_discovery(&peer, &other, hash, true).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_differing_hash_sends_inventory() {
        let (peer, mut rx) = peer();
        let object = add_object(&peer).await;
        let other = info(Uuid::new_v4(), 7000);

        on_peer_discovery(&peer, &other, inventory_hash(&[]), true).await;

        let out = drain(&mut rx);
        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0].target, Target::Peer(p) if p.id == other.id));
        assert!(matches!(
            out[0].envelope.message,
            Message::Inventory { object: o, owner, .. } if o == object && owner == peer.id()
        ));
    }
}
