//! Network module - UDP transport and the local peer
//!
//! Provides:
//! - The local [`Peer`] that message handlers act on
//! - A peer directory and request/response correlation
//! - Inbound filtering between decode and dispatch
//! - The UDP transport and the node loop that drives it
//! - A request/response client API for applications

mod callbacks;
mod client;
mod directory;
mod filter;
mod node;
mod peer;
mod transport;

pub use callbacks::*;
pub use client::*;
pub use directory::*;
pub use filter::*;
pub use node::*;
pub use peer::*;
pub use transport::*;

#[cfg(test)]
pub(crate) use peer::test_support;

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Runtime settings for a node
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// UDP port to bind
    pub port: u16,
    /// Interface to bind
    pub bind_address: IpAddr,
    /// How often to announce ourselves with Discovery
    pub discovery_interval: Duration,
    /// How often to advertise our inventory
    pub inventory_interval: Duration,
    /// How long a request waits for its Value or Ack
    pub request_timeout: Duration,
    /// How long a message id is remembered for dedup
    pub dedup_ttl: Duration,
    /// Minimum gap between GetHistory requests for one object
    pub history_throttle: Duration,
    /// Pause between relaying a kill and stopping
    pub kill_delay: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: crate::protocol::DEFAULT_PORT,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            discovery_interval: Duration::from_secs(10),
            inventory_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(5),
            dedup_ttl: Duration::from_secs(60),
            history_throttle: Duration::from_secs(2),
            kill_delay: Duration::from_millis(500),
        }
    }
}
