//! Replication handlers
//!
//! [`dispatch`] runs the reaction for one decoded, filtered envelope. It is
//! called from the node's receive loop in arrival order. Handlers never
//! fail outward: staleness turns into corrective traffic and everything
//! else is logged.

mod objects;
mod transactions;

use crate::discovery;
use crate::network::{Peer, PeerInfo, Reply, Target};
use crate::protocol::{Envelope, Message, INFO, KILL};

/// React to one inbound envelope
pub async fn dispatch(peer: &Peer, envelope: Envelope, sender: &PeerInfo) {
    peer.observe_time(envelope.timestamp);

    // Everyone sees addressed messages; only the recipient acts on them.
    if let Some(recipient) = envelope.message.recipient() {
        if recipient != peer.id() {
            tracing::trace!(
                "Ignoring {:?} {} addressed to {}",
                envelope.message.kind(),
                envelope.id,
                recipient
            );
            return;
        }
    }

    tracing::debug!(
        "Handling {:?} {} from {} at {}",
        envelope.message.kind(),
        envelope.id,
        envelope.sender,
        envelope.timestamp
    );

    match envelope.message.clone() {
        Message::Discovery { hash, is_reply } => {
            discovery::on_peer_discovery(peer, sender, hash, is_reply).await;
        }
        Message::Broadcast { text } => on_broadcast(peer, envelope, &text).await,
        Message::Direct { text, .. } => {
            tracing::info!("Message from {}: {}", envelope.sender, text);
            println!("[{}] {}", envelope.sender, text);
        }
        Message::Update(snapshot) => objects::on_update(peer, sender, snapshot).await,
        Message::Delete { object, time } => objects::on_delete(peer, object, time).await,
        Message::Get {
            object, tx, key, ..
        } => objects::on_get(peer, &envelope, sender, object, tx, &key).await,
        Message::Set {
            object,
            time,
            tx,
            key,
            value,
        } => objects::on_set(peer, &envelope, sender, object, time, tx, key, value).await,
        Message::Value { request, value, .. } => {
            peer.callback(request, Reply::Value(value)).await;
        }
        Message::Ack { request, data, .. } => {
            peer.callback(request, Reply::Ack(data)).await;
        }
        Message::BeginTx { timeout_ms, .. } => {
            transactions::on_begin(peer, &envelope, sender, timeout_ms).await;
        }
        Message::Commit { tx, .. } => transactions::on_commit(peer, &envelope, sender, tx).await,
        Message::Committed { tx, .. } => transactions::on_committed(peer, tx).await,
        Message::GetHistory {
            object, instant, ..
        } => objects::on_get_history(peer, sender, object, instant).await,
        Message::History { snapshot, .. } => objects::on_history(peer, sender, snapshot).await,
        Message::Inventory {
            object,
            owner,
            last_modified,
        } => objects::on_inventory(peer, sender, object, owner, last_modified).await,
    }
}

async fn on_broadcast(peer: &Peer, envelope: Envelope, text: &str) {
    match text {
        KILL => {
            tracing::info!("Kill received from {}, relaying and stopping", envelope.sender);
            peer.send_envelope(Target::Broadcast, envelope).await;
            tokio::time::sleep(peer.config().kill_delay).await;
            peer.stop();
        }
        INFO => peer.print_info().await,
        other => tracing::info!("Broadcast from {}: {}", envelope.sender, other),
    }
}
