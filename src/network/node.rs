//! Node
//!
//! Binds the transport and drives the peer: one receive loop that decodes,
//! filters and dispatches datagrams in arrival order, one send task that
//! drains the outbound queue, and timers for Discovery and Inventory.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use std::time::Duration;
use tokio::time::{interval, Interval, MissedTickBehavior};
use uuid::Uuid;

use super::directory::PeerDirectory;
use super::filter::{DedupFilter, FilterChain, LoopbackFilter};
use super::peer::{Outbound, Peer, Target};
use super::transport::{Transport, TransportResult};
use super::NetworkConfig;
use crate::crypto::PeerKeys;
use crate::discovery;
use crate::protocol::{CommandRegistry, PacketCodec};
use crate::replication;
use crate::repository::Repository;

const MIN_TIMER_PERIOD: Duration = Duration::from_millis(1);

/// A running peer bound to a UDP socket
pub struct Node {
    peer: Arc<Peer>,
    transport: Transport,
    keys: Option<PeerKeys>,
    filters: FilterChain,
    outbound_rx: mpsc::Receiver<Outbound>,
}

impl Node {
    /// Bind the socket and build the local peer
    pub async fn bind(
        id: Uuid,
        name: String,
        config: NetworkConfig,
        keys: Option<PeerKeys>,
        repository: Arc<dyn Repository>,
        directory: PeerDirectory,
    ) -> TransportResult<Self> {
        let bind_addr = SocketAddr::new(config.bind_address, config.port);
        let transport = Transport::bind(bind_addr, PacketCodec::new(CommandRegistry::new())).await?;

        if keys.is_none() {
            tracing::warn!("No private key configured; inbound packets will be dropped");
        }

        let filters = FilterChain::new()
            .with(LoopbackFilter::new(id))
            .with(DedupFilter::new(config.dedup_ttl));

        let (peer, outbound_rx) = Peer::new(id, name, config, repository, directory);

        Ok(Self {
            peer: Arc::new(peer),
            transport,
            keys,
            filters,
            outbound_rx,
        })
    }

    pub fn peer(&self) -> Arc<Peer> {
        self.peer.clone()
    }

    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.transport.local_addr()
    }

    /// Run until the peer is stopped
    pub async fn run(self) -> TransportResult<()> {
        let Node {
            peer,
            transport,
            keys,
            filters,
            outbound_rx,
        } = self;

        let sender = tokio::spawn(send_loop(transport.clone(), peer.clone(), outbound_rx));

        let mut discovery_timer = timer(peer.config().discovery_interval);
        let mut inventory_timer = timer(peer.config().inventory_interval);
        let mut shutdown = peer.subscribe_shutdown();

        tracing::info!("Peer {} ({}) running", peer.name(), peer.id());

        while !peer.is_stopped() {
            tokio::select! {
                result = transport.recv() => {
                    match result {
                        Ok((packet, from)) => {
                            let private_key = keys.as_ref().map(|k| k.private_key());
                            let Some(envelope) = transport.open(&packet, from, private_key) else {
                                continue;
                            };
                            if !filters.admit(&envelope) {
                                continue;
                            }
                            let sender = peer.directory().observe(envelope.sender, from).await;
                            replication::dispatch(&peer, envelope, &sender).await;
                        }
                        Err(e) => {
                            tracing::error!("Receive error: {}", e);
                        }
                    }
                }
                _ = discovery_timer.tick() => {
                    discovery::announce(&peer).await;
                }
                _ = inventory_timer.tick() => {
                    discovery::advertise_inventory(&peer, None).await;
                }
                _ = shutdown.changed() => {}
            }
        }

        sender.abort();
        let stats = transport.stats();
        tracing::info!(
            "Peer {} stopped: sent {} datagrams ({} bytes), received {} ({} bytes), dropped {}",
            peer.id(),
            stats.datagrams_sent,
            stats.bytes_sent,
            stats.datagrams_received,
            stats.bytes_received,
            stats.dropped
        );
        Ok(())
    }
}

/// Periodic timer; `interval` panics on a zero period, so clamp to 1ms
fn timer(period: Duration) -> Interval {
    let mut timer = interval(period.max(MIN_TIMER_PERIOD));
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

/// Seal and send everything the peer queues
async fn send_loop(transport: Transport, peer: Arc<Peer>, mut rx: mpsc::Receiver<Outbound>) {
    while let Some(Outbound { target, envelope }) = rx.recv().await {
        let recipients = match target {
            Target::Peer(info) => vec![info],
            Target::Broadcast => peer
                .directory()
                .all()
                .await
                .into_iter()
                .filter(|p| p.id != peer.id())
                .collect(),
        };

        for to in &recipients {
            if let Err(e) = transport.send(&envelope, to).await {
                tracing::warn!(
                    "Skipped {:?} {} to {}: {}",
                    envelope.message.kind(),
                    envelope.id,
                    to.id,
                    e
                );
            }
        }
    }
}
