//! Versioned object store
//!
//! The replication handlers only talk to the [`Repository`] trait. The
//! in-memory implementation resolves concurrent writes per property:
//! the write with the greater `(time, writer)` stamp wins.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::clock::PseudoTime;
use crate::protocol::{ObjectSnapshot, PropertyMap, Value};

/// Lifetime of a transaction opened implicitly by a write from elsewhere
pub const DEFAULT_TX_TIMEOUT: Duration = Duration::from_secs(30);

/// How many finished transaction ids are remembered
const RETIRED_LIMIT: usize = 4096;

/// Repository errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("Object not found: {0}")]
    NotFound(Uuid),

    #[error("Object deleted: {0}")]
    Deleted(Uuid),

    #[error("Unknown or expired transaction: {0}")]
    UnknownTransaction(Uuid),
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Ordering key for property writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Stamp {
    pub time: PseudoTime,
    /// Peer that issued the write, breaks ties between equal times
    pub writer: Uuid,
}

impl Stamp {
    pub fn new(time: PseudoTime, writer: Uuid) -> Self {
        Self { time, writer }
    }
}

/// One property and the stamp of its last write
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub value: Value,
    pub stamp: Stamp,
}

/// An object as held by the local peer
#[derive(Debug, Clone, PartialEq)]
pub struct RepositoryObject {
    pub id: Uuid,
    /// Owning device
    pub device: Uuid,
    pub object_type: String,
    pub user: Uuid,
    pub created: PseudoTime,
    pub last_modified: PseudoTime,
    pub properties: BTreeMap<String, Property>,
    /// Tombstone time, if deleted
    pub deleted: Option<PseudoTime>,
}

impl RepositoryObject {
    fn from_snapshot(snapshot: ObjectSnapshot, writer: Uuid) -> Self {
        let stamp = Stamp::new(snapshot.last_modified, writer);
        Self {
            id: snapshot.id,
            device: snapshot.device,
            object_type: snapshot.object_type,
            user: snapshot.user,
            created: snapshot.created,
            last_modified: snapshot.last_modified,
            properties: snapshot
                .data
                .into_iter()
                .map(|(key, value)| (key, Property { value, stamp }))
                .collect(),
            deleted: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.is_some()
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key).map(|p| &p.value)
    }

    /// Current property values
    pub fn data(&self) -> PropertyMap {
        self.properties
            .iter()
            .map(|(key, p)| (key.clone(), p.value.clone()))
            .collect()
    }

    pub fn snapshot(&self) -> ObjectSnapshot {
        ObjectSnapshot {
            id: self.id,
            device: self.device,
            object_type: self.object_type.clone(),
            user: self.user,
            created: self.created,
            last_modified: self.last_modified,
            data: self.data(),
        }
    }

    /// Apply a write if it is newer than what is held. Returns whether it won.
    fn apply(&mut self, key: String, value: Value, stamp: Stamp) -> bool {
        if stamp.time > self.last_modified {
            self.last_modified = stamp.time;
        }
        match self.properties.get(&key) {
            Some(current) if current.stamp >= stamp => false,
            _ => {
                self.properties.insert(key, Property { value, stamp });
                true
            }
        }
    }

    fn merge(&mut self, data: PropertyMap, stamp: Stamp) {
        for (key, value) in data {
            self.apply(key, value, stamp);
        }
    }
}

/// One line of a peer's inventory advertisement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InventoryEntry {
    pub id: Uuid,
    pub owner: Uuid,
    pub last_modified: PseudoTime,
}

/// Storage used by the replication protocol
#[async_trait]
pub trait Repository: Send + Sync {
    async fn contains(&self, id: &Uuid) -> bool;

    /// Copy of the object, tombstoned or not
    async fn get_object(&self, id: &Uuid) -> Option<RepositoryObject>;

    /// Create an object from a snapshot, merging if it already exists
    async fn object_created(&self, snapshot: ObjectSnapshot, writer: Uuid) -> RepositoryResult<()>;

    /// Tombstone an object
    async fn object_deleted(&self, id: &Uuid, time: PseudoTime) -> RepositoryResult<()>;

    /// Merge a snapshot into an existing object
    async fn update(&self, snapshot: ObjectSnapshot, writer: Uuid) -> RepositoryResult<()>;

    /// Open a transaction, returning its id
    async fn begin_transaction(&self, timeout: Duration) -> Uuid;

    /// Apply a transaction's staged writes atomically
    async fn complete(&self, tx: &Uuid) -> RepositoryResult<()>;

    async fn has_transaction(&self, tx: &Uuid) -> bool;

    /// Read a property, seeing the transaction's own staged write if any
    async fn get_property(
        &self,
        id: &Uuid,
        tx: Option<&Uuid>,
        key: &str,
    ) -> RepositoryResult<Value>;

    /// Write a property, staged under `tx` or applied immediately
    async fn set_property(
        &self,
        id: &Uuid,
        stamp: Stamp,
        tx: Option<Uuid>,
        key: String,
        value: Value,
    ) -> RepositoryResult<()>;

    /// Every object with its owner and version
    async fn inventory(&self) -> Vec<InventoryEntry>;
}

#[derive(Debug)]
struct StagedWrite {
    object: Uuid,
    key: String,
    value: Value,
    stamp: Stamp,
}

#[derive(Debug)]
struct Transaction {
    deadline: Instant,
    writes: Vec<StagedWrite>,
}

impl Transaction {
    fn new(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            writes: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    objects: HashMap<Uuid, RepositoryObject>,
    transactions: HashMap<Uuid, Transaction>,
    /// Expired or completed transactions, oldest first. A late write naming
    /// one of these must not reopen it.
    retired: HashSet<Uuid>,
    retired_order: VecDeque<Uuid>,
}

impl State {
    fn expire_transactions(&mut self) {
        let now = Instant::now();
        let mut expired = Vec::new();
        self.transactions.retain(|id, tx| {
            let live = tx.deadline > now;
            if !live {
                tracing::debug!("Transaction {} expired with {} staged writes", id, tx.writes.len());
                expired.push(*id);
            }
            live
        });
        for id in expired {
            self.retire(id);
        }
    }

    fn retire(&mut self, id: Uuid) {
        if !self.retired.insert(id) {
            return;
        }
        self.retired_order.push_back(id);
        if self.retired_order.len() > RETIRED_LIMIT {
            if let Some(oldest) = self.retired_order.pop_front() {
                self.retired.remove(&oldest);
            }
        }
    }

    fn live_object(&mut self, id: &Uuid) -> RepositoryResult<&mut RepositoryObject> {
        let object = self.objects.get_mut(id).ok_or(RepositoryError::NotFound(*id))?;
        if object.is_deleted() {
            return Err(RepositoryError::Deleted(*id));
        }
        Ok(object)
    }
}

/// Thread-safe in-memory repository
#[derive(Debug, Default)]
pub struct MemoryRepository {
    state: RwLock<State>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn open_transactions(&self) -> usize {
        self.state.read().await.transactions.len()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn contains(&self, id: &Uuid) -> bool {
        self.state.read().await.objects.contains_key(id)
    }

    async fn get_object(&self, id: &Uuid) -> Option<RepositoryObject> {
        self.state.read().await.objects.get(id).cloned()
    }

    async fn object_created(&self, snapshot: ObjectSnapshot, writer: Uuid) -> RepositoryResult<()> {
        let mut state = self.state.write().await;
        match state.objects.get_mut(&snapshot.id) {
            Some(existing) if existing.is_deleted() => Err(RepositoryError::Deleted(snapshot.id)),
            Some(existing) => {
                let stamp = Stamp::new(snapshot.last_modified, writer);
                existing.merge(snapshot.data, stamp);
                Ok(())
            }
            None => {
                let object = RepositoryObject::from_snapshot(snapshot, writer);
                tracing::debug!("Created object {} ({})", object.id, object.object_type);
                state.objects.insert(object.id, object);
                Ok(())
            }
        }
    }

    async fn object_deleted(&self, id: &Uuid, time: PseudoTime) -> RepositoryResult<()> {
        let mut state = self.state.write().await;
        let object = state.objects.get_mut(id).ok_or(RepositoryError::NotFound(*id))?;
        let tombstone = object.deleted.map_or(time, |t| t.max(time));
        object.deleted = Some(tombstone);
        object.last_modified = object.last_modified.max(tombstone);
        tracing::debug!("Deleted object {} at {}", id, tombstone);
        Ok(())
    }

    async fn update(&self, snapshot: ObjectSnapshot, writer: Uuid) -> RepositoryResult<()> {
        let mut state = self.state.write().await;
        let object = state.live_object(&snapshot.id)?;
        object.last_modified = object.last_modified.max(snapshot.last_modified);
        object.merge(snapshot.data, Stamp::new(snapshot.last_modified, writer));
        Ok(())
    }

    async fn begin_transaction(&self, timeout: Duration) -> Uuid {
        let mut state = self.state.write().await;
        state.expire_transactions();
        let id = Uuid::new_v4();
        state.transactions.insert(id, Transaction::new(timeout));
        id
    }

    async fn complete(&self, tx: &Uuid) -> RepositoryResult<()> {
        let mut state = self.state.write().await;
        state.expire_transactions();
        let transaction = state
            .transactions
            .remove(tx)
            .ok_or(RepositoryError::UnknownTransaction(*tx))?;
        state.retire(*tx);

        let count = transaction.writes.len();
        for write in transaction.writes {
            match state.live_object(&write.object) {
                Ok(object) => {
                    object.apply(write.key, write.value, write.stamp);
                }
                Err(e) => tracing::debug!("Dropping staged write in {}: {}", tx, e),
            }
        }
        tracing::debug!("Completed transaction {} ({} writes)", tx, count);
        Ok(())
    }

    async fn has_transaction(&self, tx: &Uuid) -> bool {
        let state = self.state.read().await;
        state
            .transactions
            .get(tx)
            .is_some_and(|t| t.deadline > Instant::now())
    }

    async fn get_property(
        &self,
        id: &Uuid,
        tx: Option<&Uuid>,
        key: &str,
    ) -> RepositoryResult<Value> {
        let state = self.state.read().await;
        let object = state.objects.get(id).ok_or(RepositoryError::NotFound(*id))?;

        let staged = tx
            .and_then(|tx| state.transactions.get(tx))
            .and_then(|t| {
                t.writes
                    .iter()
                    .rev()
                    .find(|w| w.object == *id && w.key == key)
            })
            .map(|w| w.value.clone());

        Ok(staged
            .or_else(|| object.property(key).cloned())
            .unwrap_or_default())
    }

    async fn set_property(
        &self,
        id: &Uuid,
        stamp: Stamp,
        tx: Option<Uuid>,
        key: String,
        value: Value,
    ) -> RepositoryResult<()> {
        let mut state = self.state.write().await;
        state.live_object(id)?;

        match tx {
            Some(tx) => {
                state.expire_transactions();
                if state.retired.contains(&tx) {
                    return Err(RepositoryError::UnknownTransaction(tx));
                }
                // A transaction opened on another peer is staged here too and
                // completed when its Committed notice arrives.
                let transaction = state
                    .transactions
                    .entry(tx)
                    .or_insert_with(|| Transaction::new(DEFAULT_TX_TIMEOUT));
                transaction.writes.push(StagedWrite {
                    object: *id,
                    key,
                    value,
                    stamp,
                });
            }
            None => {
                state.live_object(id)?.apply(key, value, stamp);
            }
        }
        Ok(())
    }

    async fn inventory(&self) -> Vec<InventoryEntry> {
        let state = self.state.read().await;
        let mut entries: Vec<_> = state
            .objects
            .values()
            .map(|o| InventoryEntry {
                id: o.id,
                owner: o.device,
                last_modified: o.last_modified,
            })
            .collect();
        entries.sort_by_key(|e| e.id);
        entries
    }
}
