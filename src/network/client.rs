//! Client API
//!
//! Request/response operations for applications running on top of a peer.
//! Each call waits for its correlated Value or Ack with the configured
//! request timeout.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use super::callbacks::{CallbackError, Reply};
use super::peer::Peer;
use crate::protocol::{Message, ObjectRef, ObjectSnapshot, PropertyMap, Value};
use crate::repository::{RepositoryError, Stamp};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Request failed: {0}")]
    Callback(#[from] CallbackError),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Unexpected reply: {0:?}")]
    UnexpectedReply(Reply),
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Application handle on a running peer
#[derive(Clone)]
pub struct Client {
    peer: Arc<Peer>,
}

impl Client {
    pub fn new(peer: Arc<Peer>) -> Self {
        Self { peer }
    }

    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    /// Create an object owned by this peer and push it to everyone
    pub async fn create_object(
        &self,
        object_type: &str,
        user: Uuid,
        data: PropertyMap,
    ) -> ClientResult<ObjectRef> {
        let now = self.peer.now();
        let snapshot = ObjectSnapshot {
            id: Uuid::new_v4(),
            device: self.peer.id(),
            object_type: object_type.to_string(),
            user,
            created: now,
            last_modified: now,
            data,
        };
        let object = ObjectRef::new(snapshot.id, snapshot.device);

        self.peer
            .repository()
            .object_created(snapshot.clone(), self.peer.id())
            .await?;
        self.peer.broadcast(Message::Update(snapshot)).await;
        Ok(object)
    }

    /// Delete an object everywhere. The local copy, if any, is tombstoned
    /// first; the Delete goes out either way.
    pub async fn delete_object(&self, object: Uuid) -> ClientResult<()> {
        let time = self.peer.now();
        let repository = self.peer.repository();
        if repository.contains(&object).await {
            repository.object_deleted(&object, time).await?;
        }
        self.peer.broadcast(Message::Delete { object, time }).await;
        Ok(())
    }

    /// Read a property from the object's owner
    pub async fn get(&self, object: ObjectRef, tx: Option<Uuid>, key: &str) -> ClientResult<Value> {
        if object.owner == self.peer.id() {
            let value = self
                .peer
                .repository()
                .get_property(&object.id, tx.as_ref(), key)
                .await?;
            return Ok(value);
        }

        let message = Message::Get {
            object,
            time: self.peer.now(),
            tx,
            key: key.to_string(),
        };
        match self.peer.request(object.owner, message).await? {
            Reply::Value(value) => Ok(value),
            other => Err(ClientError::UnexpectedReply(other)),
        }
    }

    /// Write a property at the object's owner
    pub async fn set(
        &self,
        object: ObjectRef,
        tx: Option<Uuid>,
        key: &str,
        value: Value,
    ) -> ClientResult<()> {
        let time = self.peer.now();
        if object.owner == self.peer.id() {
            let stamp = Stamp::new(time, self.peer.id());
            self.peer
                .repository()
                .set_property(&object.id, stamp, tx, key.to_string(), value)
                .await?;
            return Ok(());
        }

        let message = Message::Set {
            object,
            time,
            tx,
            key: key.to_string(),
            value,
        };
        match self.peer.request(object.owner, message).await? {
            Reply::Ack(_) => Ok(()),
            other => Err(ClientError::UnexpectedReply(other)),
        }
    }

    /// Open a transaction on `owner`
    pub async fn begin_transaction(&self, owner: Uuid, timeout: Duration) -> ClientResult<Uuid> {
        if owner == self.peer.id() {
            return Ok(self.peer.repository().begin_transaction(timeout).await);
        }

        let message = Message::BeginTx {
            recipient: owner,
            timeout_ms: i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX),
        };
        let reply = self.peer.request(owner, message).await?;
        let parsed = match &reply {
            Reply::Ack(data) => data.as_text().and_then(|id| id.parse::<Uuid>().ok()),
            Reply::Value(_) => None,
        };
        parsed.ok_or(ClientError::UnexpectedReply(reply))
    }

    /// Finalize a transaction on `owner`
    pub async fn commit(&self, owner: Uuid, tx: Uuid) -> ClientResult<()> {
        if owner == self.peer.id() {
            self.peer.repository().complete(&tx).await?;
            self.peer.announce_committed(tx, None).await;
            return Ok(());
        }

        let message = Message::Commit {
            recipient: owner,
            tx,
        };
        match self.peer.request(owner, message).await? {
            Reply::Ack(_) => Ok(()),
            other => Err(ClientError::UnexpectedReply(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::test_support::*;
    use crate::network::{NetworkConfig, Outbound, PeerDirectory, PeerInfo, Target};
    use crate::replication::dispatch;
    use crate::repository::MemoryRepository;
    use tokio::sync::mpsc;

    struct Side {
        peer: Arc<Peer>,
        rx: mpsc::Receiver<Outbound>,
        info: PeerInfo,
    }

    /// Two peers that list each other, with `request_timeout` on both
    fn pair(request_timeout: Duration) -> (Side, Side) {
        let (a_id, b_id) = (Uuid::new_v4(), Uuid::new_v4());
        let (a_info, b_info) = (info(a_id, 6101), info(b_id, 6102));
        let config = NetworkConfig {
            request_timeout,
            ..Default::default()
        };
        let side = |id: Uuid, me: PeerInfo, other: PeerInfo| {
            let (peer, rx) = Peer::new(
                id,
                "test".into(),
                config.clone(),
                Arc::new(MemoryRepository::new()),
                PeerDirectory::with_peers([other]),
            );
            Side {
                peer: Arc::new(peer),
                rx,
                info: me,
            }
        };
        (
            side(a_id, a_info.clone(), b_info.clone()),
            side(b_id, b_info, a_info),
        )
    }

    /// Wait for `from` to queue something, then deliver all of it to `to`
    async fn relay(from: &mut Side, to: &Side) -> Vec<Outbound> {
        let first = from.rx.recv().await.unwrap();
        let mut out = vec![first];
        out.extend(drain(&mut from.rx));
        for item in &out {
            dispatch(&to.peer, item.envelope.clone(), &from.info).await;
        }
        out
    }

    /// An object owned by `side`, held only there
    async fn remote_object(side: &Side, data: PropertyMap) -> ObjectRef {
        let now = side.peer.now();
        let snapshot = ObjectSnapshot {
            id: Uuid::new_v4(),
            device: side.peer.id(),
            object_type: "note".into(),
            user: Uuid::nil(),
            created: now,
            last_modified: now,
            data,
        };
        let object = ObjectRef::new(snapshot.id, snapshot.device);
        side.peer
            .repository()
            .object_created(snapshot, side.peer.id())
            .await
            .unwrap();
        object
    }

    #[tokio::test]
    async fn test_create_object_broadcasts_update() {
        let (peer, mut rx) = peer();
        let client = Client::new(Arc::new(peer));

        let mut data = PropertyMap::new();
        data.insert("title".into(), Value::from("hello"));
        let object = client.create_object("note", Uuid::new_v4(), data).await.unwrap();

        assert_eq!(object.owner, client.peer().id());
        assert!(client.peer().repository().contains(&object.id).await);

        let out = drain(&mut rx);
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0].target, Target::Broadcast));
        match &out[0].envelope.message {
            Message::Update(snapshot) => assert_eq!(snapshot.id, object.id),
            other => panic!("expected Update, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_local_get_and_set() {
        let (peer, _rx) = peer();
        let client = Client::new(Arc::new(peer));
        let object = client
            .create_object("note", Uuid::new_v4(), PropertyMap::new())
            .await
            .unwrap();

        client.set(object, None, "k", Value::from(4i32)).await.unwrap();
        assert_eq!(client.get(object, None, "k").await.unwrap(), Value::from(4i32));
    }

    #[tokio::test]
    async fn test_local_transaction() {
        let (peer, _rx) = peer();
        let client = Client::new(Arc::new(peer));
        let me = client.peer().id();
        let object = client
            .create_object("note", Uuid::new_v4(), PropertyMap::new())
            .await
            .unwrap();
        let mut committed = client.peer().subscribe_committed();

        let tx = client
            .begin_transaction(me, Duration::from_secs(5))
            .await
            .unwrap();
        client.set(object, Some(tx), "k", Value::from("staged")).await.unwrap();
        assert_eq!(client.get(object, None, "k").await.unwrap(), Value::Null);

        client.commit(me, tx).await.unwrap();
        assert_eq!(client.get(object, None, "k").await.unwrap(), Value::from("staged"));
        assert_eq!(committed.recv().await.unwrap(), tx);
    }

    #[tokio::test]
    async fn test_delete_object() {
        let (peer, mut rx) = peer();
        let client = Client::new(Arc::new(peer));
        let object = client
            .create_object("note", Uuid::new_v4(), PropertyMap::new())
            .await
            .unwrap();
        client.delete_object(object.id).await.unwrap();

        let stored = client.peer().repository().get_object(&object.id).await.unwrap();
        assert!(stored.is_deleted());
        let out = drain(&mut rx);
        assert!(matches!(out.last().unwrap().envelope.message, Message::Delete { .. }));
    }

    #[tokio::test]
    async fn test_delete_of_unheld_object_still_broadcasts() {
        let (peer, mut rx) = peer();
        let client = Client::new(Arc::new(peer));
        let object = Uuid::new_v4();

        client.delete_object(object).await.unwrap();

        assert!(!client.peer().repository().contains(&object).await);
        let out = drain(&mut rx);
        assert!(matches!(out[0].target, Target::Broadcast));
        assert!(matches!(out[0].envelope.message, Message::Delete { object: o, .. } if o == object));
    }

    #[tokio::test]
    async fn test_remote_get() {
        let (mut a, mut b) = pair(Duration::from_secs(5));
        let mut data = PropertyMap::new();
        data.insert("title".into(), Value::from("remote"));
        let object = remote_object(&b, data).await;

        let client = Client::new(a.peer.clone());
        let call = tokio::spawn(async move { client.get(object, None, "title").await });
        relay(&mut a, &b).await;
        relay(&mut b, &a).await;

        assert_eq!(call.await.unwrap().unwrap(), Value::from("remote"));
        assert_eq!(a.peer.callbacks().len().await, 0);
    }

    #[tokio::test]
    async fn test_remote_set_is_acked_and_applied() {
        let (mut a, mut b) = pair(Duration::from_secs(5));
        let object = remote_object(&b, PropertyMap::new()).await;

        let client = Client::new(a.peer.clone());
        let call = tokio::spawn(async move { client.set(object, None, "k", Value::from(7i64)).await });
        relay(&mut a, &b).await;
        let replies = relay(&mut b, &a).await;

        call.await.unwrap().unwrap();
        assert!(matches!(replies[0].envelope.message, Message::Ack { .. }));
        let stored = b.peer.repository().get_property(&object.id, None, "k").await.unwrap();
        assert_eq!(stored, Value::from(7i64));
    }

    #[tokio::test]
    async fn test_remote_transaction_commit() {
        let (mut a, mut b) = pair(Duration::from_secs(5));
        let owner = b.peer.id();
        let object = remote_object(&b, PropertyMap::new()).await;
        let mut committed = a.peer.subscribe_committed();
        let client = Client::new(a.peer.clone());

        let begin = {
            let client = client.clone();
            tokio::spawn(async move { client.begin_transaction(owner, Duration::from_secs(5)).await })
        };
        relay(&mut a, &b).await;
        relay(&mut b, &a).await;
        let tx = begin.await.unwrap().unwrap();
        assert!(b.peer.repository().has_transaction(&tx).await);

        let set = {
            let client = client.clone();
            tokio::spawn(async move { client.set(object, Some(tx), "k", Value::from("staged")).await })
        };
        relay(&mut a, &b).await;
        relay(&mut b, &a).await;
        set.await.unwrap().unwrap();
        let visible = b.peer.repository().get_property(&object.id, None, "k").await.unwrap();
        assert_eq!(visible, Value::Null);

        let commit = tokio::spawn(async move { client.commit(owner, tx).await });
        relay(&mut a, &b).await;
        let replies = relay(&mut b, &a).await;
        commit.await.unwrap().unwrap();

        assert!(replies
            .iter()
            .any(|o| o.envelope.message == Message::Committed { recipient: a.peer.id(), tx }));
        let applied = b.peer.repository().get_property(&object.id, None, "k").await.unwrap();
        assert_eq!(applied, Value::from("staged"));
        assert!(!b.peer.repository().has_transaction(&tx).await);
        assert_eq!(committed.recv().await.unwrap(), tx);
    }

    #[tokio::test]
    async fn test_remote_request_times_out() {
        let timeout = Duration::from_millis(20);
        let (a, b) = pair(timeout);
        let object = remote_object(&b, PropertyMap::new()).await;

        let client = Client::new(a.peer.clone());
        match client.get(object, None, "k").await {
            Err(ClientError::Callback(CallbackError::Timeout(_, waited))) => {
                assert_eq!(waited, timeout)
            }
            other => panic!("expected a timeout, got {:?}", other),
        }
        assert_eq!(a.peer.callbacks().len().await, 0);
    }
}
