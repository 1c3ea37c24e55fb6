//! Object replication and anti-entropy
//!
//! Update, Delete, Get and Set act on the object store directly. Inventory,
//! GetHistory and History form the pull loop that brings a stale or missing
//! copy up to date with the owner's.

use uuid::Uuid;

use crate::clock::PseudoTime;
use crate::network::{Peer, PeerInfo};
use crate::protocol::{Envelope, Message, ObjectRef, ObjectSnapshot, Value};
use crate::repository::{Stamp, DEFAULT_TX_TIMEOUT};

pub(super) async fn on_update(peer: &Peer, sender: &PeerInfo, snapshot: ObjectSnapshot) {
    let repository = peer.repository();
    let id = snapshot.id;
    let result = if repository.contains(&id).await {
        repository.update(snapshot, sender.id).await
    } else {
        repository.object_created(snapshot, sender.id).await
    };
    if let Err(e) = result {
        tracing::debug!("Update of {} from {} not applied: {}", id, sender.id, e);
    }
}

pub(super) async fn on_delete(peer: &Peer, object: Uuid, time: PseudoTime) {
    let repository = peer.repository();
    if !repository.contains(&object).await {
        return;
    }
    if let Err(e) = repository.object_deleted(&object, time).await {
        tracing::debug!("Delete of {} not applied: {}", object, e);
    }
}

pub(super) async fn on_get(
    peer: &Peer,
    envelope: &Envelope,
    sender: &PeerInfo,
    object: ObjectRef,
    tx: Option<Uuid>,
    key: &str,
) {
    if object.owner == peer.id() {
        let value = peer
            .repository()
            .get_property(&object.id, tx.as_ref(), key)
            .await
            .unwrap_or_else(|e| {
                tracing::debug!("Get {}.{}: {}", object.id, key, e);
                Value::Null
            });
        let reply = Message::Value {
            request: envelope.id,
            recipient: envelope.sender,
            value,
        };
        peer.send(sender, reply).await;
    } else if !peer.repository().contains(&object.id).await {
        peer.request_history(object.owner, object.id).await;
    }
}

#[allow(clippy::too_many_arguments)]
pub(super) async fn on_set(
    peer: &Peer,
    envelope: &Envelope,
    sender: &PeerInfo,
    object: ObjectRef,
    time: PseudoTime,
    tx: Option<Uuid>,
    key: String,
    value: Value,
) {
    let repository = peer.repository();
    if !repository.contains(&object.id).await {
        // Nothing to write into yet; pull the object and let the writer retry.
        peer.request_history(object.owner, object.id).await;
        return;
    }

    let stamp = Stamp::new(time, envelope.sender);
    if let Err(e) = repository.set_property(&object.id, stamp, tx, key, value).await {
        tracing::debug!("Set on {} not applied: {}", object.id, e);
        return;
    }

    if object.owner == peer.id() {
        let ack = Message::Ack {
            recipient: envelope.sender,
            request: envelope.id,
            data: Value::Null,
        };
        peer.send(sender, ack).await;
    }
}

pub(super) async fn on_get_history(
    peer: &Peer,
    sender: &PeerInfo,
    object: Uuid,
    instant: PseudoTime,
) {
    let Some(current) = peer.repository().get_object(&object).await else {
        tracing::debug!("History requested for unknown object {}", object);
        return;
    };
    if !current.last_modified.before(&instant) {
        return;
    }

    let reply = match current.deleted {
        Some(time) => Message::Delete { object, time },
        None => Message::History {
            recipient: sender.id,
            snapshot: current.snapshot(),
        },
    };
    peer.send(sender, reply).await;
}

pub(super) async fn on_history(peer: &Peer, sender: &PeerInfo, snapshot: ObjectSnapshot) {
    let repository = peer.repository();
    let id = snapshot.id;

    let Some(local) = repository.get_object(&id).await else {
        if let Err(e) = repository.object_created(snapshot, sender.id).await {
            tracing::debug!("History for {} not applied: {}", id, e);
        }
        return;
    };
    if local.is_deleted() {
        tracing::debug!("History for deleted object {} ignored", id);
        return;
    }

    if snapshot.data.is_empty() {
        if let Err(e) = repository.update(snapshot, sender.id).await {
            tracing::debug!("History for {} not applied: {}", id, e);
        }
        return;
    }

    // Catch-up writes land together under one local transaction, which is
    // always completed so a failed write cannot leave it open.
    let tx = repository.begin_transaction(DEFAULT_TX_TIMEOUT).await;
    let stamp = Stamp::new(snapshot.last_modified, sender.id);
    for (key, value) in snapshot.data {
        if let Err(e) = repository.set_property(&id, stamp, Some(tx), key, value).await {
            tracing::debug!("History for {} not applied: {}", id, e);
            break;
        }
    }
    if let Err(e) = repository.complete(&tx).await {
        tracing::warn!("Catch-up transaction for {} failed: {}", id, e);
    }
}

pub(super) async fn on_inventory(
    peer: &Peer,
    sender: &PeerInfo,
    object: Uuid,
    owner: Uuid,
    last_modified: PseudoTime,
) {
    if sender.id == peer.id() || owner == peer.id() {
        return;
    }

    let stale = match peer.repository().get_object(&object).await {
        Some(local) => local.last_modified.before(&last_modified),
        None => true,
    };
    if stale {
        peer.request_history(owner, object).await;
    }
}
