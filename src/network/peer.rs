//! The local peer
//!
//! Owns everything the message handlers act on: identity, clock,
//! repository, peer directory and pending callbacks. Outbound messages are
//! queued on a channel drained by the node's send task, so handlers never
//! block on the socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use uuid::Uuid;

use super::callbacks::{CallbackError, PendingCallbacks, Reply};
use super::directory::{PeerDirectory, PeerInfo};
use super::filter::RequestThrottle;
use super::NetworkConfig;
use crate::clock::{LamportClock, PseudoTime};
use crate::protocol::{Envelope, Message};
use crate::repository::Repository;

/// Where an outbound envelope goes
#[derive(Debug, Clone)]
pub enum Target {
    Peer(PeerInfo),
    /// Every peer in the directory
    Broadcast,
}

/// An envelope waiting to be sealed and sent
#[derive(Debug, Clone)]
pub struct Outbound {
    pub target: Target,
    pub envelope: Envelope,
}

/// Capacity of the outbound queue
const OUTBOUND_QUEUE: usize = 1024;

pub struct Peer {
    id: Uuid,
    name: String,
    config: NetworkConfig,
    clock: LamportClock,
    repository: Arc<dyn Repository>,
    directory: PeerDirectory,
    callbacks: PendingCallbacks,
    history_requests: RequestThrottle,
    outbound: mpsc::Sender<Outbound>,
    committed: broadcast::Sender<Uuid>,
    shutdown: watch::Sender<bool>,
    stopped: AtomicBool,
}

impl Peer {
    /// Create a peer and the receiving end of its outbound queue
    pub fn new(
        id: Uuid,
        name: String,
        config: NetworkConfig,
        repository: Arc<dyn Repository>,
        directory: PeerDirectory,
    ) -> (Self, mpsc::Receiver<Outbound>) {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (committed, _) = broadcast::channel(64);
        let (shutdown, _) = watch::channel(false);

        let peer = Self {
            id,
            name,
            history_requests: RequestThrottle::new(config.history_throttle),
            config,
            clock: LamportClock::new(),
            repository,
            directory,
            callbacks: PendingCallbacks::new(),
            outbound,
            committed,
            shutdown,
            stopped: AtomicBool::new(false),
        };
        (peer, outbound_rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repository
    }

    pub fn directory(&self) -> &PeerDirectory {
        &self.directory
    }

    pub fn callbacks(&self) -> &PendingCallbacks {
        &self.callbacks
    }

    /// Tick the local clock
    pub fn now(&self) -> PseudoTime {
        self.clock.now()
    }

    /// Merge a timestamp received from another peer
    pub fn observe_time(&self, remote: PseudoTime) {
        self.clock.observe(remote);
    }

    /// Wrap a message in a fresh envelope from this peer
    pub fn envelope(&self, message: Message) -> Envelope {
        Envelope::new(self.id, self.now(), message)
    }

    /// Queue an already built envelope
    pub async fn send_envelope(&self, target: Target, envelope: Envelope) {
        tracing::trace!("Queueing {:?} {} for {:?}", envelope.message.kind(), envelope.id, target);
        if self.outbound.send(Outbound { target, envelope }).await.is_err() {
            tracing::warn!("Outbound queue closed, message dropped");
        }
    }

    /// Send to one peer, returning the message id
    pub async fn send(&self, to: &PeerInfo, message: Message) -> Uuid {
        let envelope = self.envelope(message);
        let id = envelope.id;
        self.send_envelope(Target::Peer(to.clone()), envelope).await;
        id
    }

    /// Send to a peer by id. Unknown ids fall back to a broadcast; the
    /// recipient field keeps everyone else from acting on it.
    pub async fn send_to_id(&self, to: Uuid, message: Message) -> Uuid {
        match self.directory.get(&to).await {
            Some(info) => self.send(&info, message).await,
            None => {
                tracing::debug!("Peer {} not in directory, broadcasting", to);
                self.broadcast(message).await
            }
        }
    }

    /// Send to every known peer, returning the message id
    pub async fn broadcast(&self, message: Message) -> Uuid {
        let envelope = self.envelope(message);
        let id = envelope.id;
        self.send_envelope(Target::Broadcast, envelope).await;
        id
    }

    /// Send a message and wait for the correlated Value or Ack
    pub async fn request(&self, to: Uuid, message: Message) -> Result<Reply, CallbackError> {
        let envelope = self.envelope(message);
        let id = envelope.id;
        let rx = self.callbacks.register(id).await;

        let target = match self.directory.get(&to).await {
            Some(info) => Target::Peer(info),
            None => Target::Broadcast,
        };
        self.send_envelope(target, envelope).await;
        self.callbacks.wait(id, rx, self.config.request_timeout).await
    }

    /// Deliver a reply to whoever is waiting on `request`
    pub async fn callback(&self, request: Uuid, reply: Reply) {
        if !self.callbacks.fulfil(&request, reply).await {
            tracing::debug!("No pending request {}", request);
        }
    }

    /// Ask `owner` for a full copy of `object`, at most once per throttle window
    pub async fn request_history(&self, owner: Uuid, object: Uuid) -> bool {
        if !self.history_requests.allow(object) {
            tracing::debug!("History for {} already requested recently", object);
            return false;
        }
        let instant = self.now();
        self.send_to_id(
            owner,
            Message::GetHistory {
                recipient: owner,
                object,
                instant,
            },
        )
        .await;
        true
    }

    /// Tell every known peer, and `committer` if it is not among them, that
    /// `tx` is final, then wake local subscribers
    pub async fn announce_committed(&self, tx: Uuid, committer: Option<&PeerInfo>) {
        let mut committer_told = false;
        for other in self.directory.all().await {
            if other.id == self.id {
                continue;
            }
            committer_told |= committer.is_some_and(|c| c.id == other.id);
            let notice = Message::Committed {
                recipient: other.id,
                tx,
            };
            self.send(&other, notice).await;
        }
        if let Some(committer) = committer.filter(|_| !committer_told) {
            let notice = Message::Committed {
                recipient: committer.id,
                tx,
            };
            self.send(committer, notice).await;
        }
        self.notify_committed(tx);
    }

    pub fn notify_committed(&self, tx: Uuid) {
        // Err only means nobody is listening.
        let _ = self.committed.send(tx);
    }

    pub fn subscribe_committed(&self) -> broadcast::Receiver<Uuid> {
        self.committed.subscribe()
    }

    /// Ask the node loop to exit
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            tracing::info!("Peer {} stopping", self.id);
            self.shutdown.send_replace(true);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Print local diagnostic state
    pub async fn print_info(&self) {
        let inventory = self.repository.inventory().await;
        let peers = self.directory.all().await;
        let pending = self.callbacks.len().await;

        tracing::info!(
            "Peer {} ({}): {} objects, {} peers, {} pending requests, clock {}",
            self.name,
            self.id,
            inventory.len(),
            peers.len(),
            pending,
            self.clock.current()
        );

        println!("\n========================================");
        println!("  Peer {} ({})", self.name, self.id);
        println!("========================================");
        println!("  Clock:   {}", self.clock.current());
        println!("  Pending: {}", pending);
        println!("  Peers:");
        for peer in &peers {
            let key = if peer.public_key.is_some() { "key" } else { "no key" };
            println!("    {} {} ({})", peer.id, peer.socket_addr(), key);
        }
        println!("  Objects:");
        for entry in &inventory {
            println!("    {} owner={} {}", entry.id, entry.owner, entry.last_modified);
        }
        println!("========================================\n");
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::repository::MemoryRepository;
    use std::net::SocketAddr;

    /// A peer backed by an in-memory repository, plus its outbound queue
    pub fn peer() -> (Peer, mpsc::Receiver<Outbound>) {
        peer_with(Uuid::new_v4(), PeerDirectory::new())
    }

    pub fn peer_with(id: Uuid, directory: PeerDirectory) -> (Peer, mpsc::Receiver<Outbound>) {
        Peer::new(
            id,
            "test".into(),
            NetworkConfig::default(),
            Arc::new(MemoryRepository::new()),
            directory,
        )
    }

    pub fn info(id: Uuid, port: u16) -> PeerInfo {
        PeerInfo::new(id, SocketAddr::from(([127, 0, 0, 1], port)), None)
    }

    /// Everything queued so far
    pub fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            out.push(item);
        }
        out
    }
}
