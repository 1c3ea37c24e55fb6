//! Transaction control
//!
//! The object's owner opens and finalizes transactions. Writes staged on
//! other peers under the same id are applied when Committed arrives.

use std::time::Duration;
use uuid::Uuid;

use crate::network::{Peer, PeerInfo};
use crate::protocol::{Envelope, Message, Value};

pub(super) async fn on_begin(peer: &Peer, envelope: &Envelope, sender: &PeerInfo, timeout_ms: i64) {
    let timeout = Duration::from_millis(u64::try_from(timeout_ms).unwrap_or(0));
    let tx = peer.repository().begin_transaction(timeout).await;
    tracing::debug!("Opened transaction {} for {} ({:?})", tx, envelope.sender, timeout);

    let ack = Message::Ack {
        recipient: envelope.sender,
        request: envelope.id,
        data: Value::Text(tx.to_string()),
    };
    peer.send(sender, ack).await;
}

pub(super) async fn on_commit(peer: &Peer, envelope: &Envelope, sender: &PeerInfo, tx: Uuid) {
    if let Err(e) = peer.repository().complete(&tx).await {
        tracing::warn!("Commit of {} from {} failed: {}", tx, envelope.sender, e);
        return;
    }

    let ack = Message::Ack {
        recipient: envelope.sender,
        request: envelope.id,
        data: Value::Null,
    };
    peer.send(sender, ack).await;

    peer.announce_committed(tx, Some(sender)).await;
}

pub(super) async fn on_committed(peer: &Peer, tx: Uuid) {
    let repository = peer.repository();
    if repository.has_transaction(&tx).await {
        if let Err(e) = repository.complete(&tx).await {
            tracing::debug!("Staged writes for {} not applied: {}", tx, e);
        }
    }
    peer.notify_committed(tx);
}
