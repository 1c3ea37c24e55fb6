//! Inbound filtering
//!
//! Runs between decode and dispatch. Peers re-broadcast some messages
//! unchanged, so without a dedup stage a broadcast could circulate forever.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::protocol::Envelope;

/// Decides whether a decoded envelope reaches the handlers
pub trait MessageFilter: Send + Sync {
    fn admit(&self, envelope: &Envelope) -> bool;
}

/// Drops envelopes whose message id was seen within the TTL
#[derive(Debug)]
pub struct DedupFilter {
    ttl: Duration,
    seen: Mutex<HashMap<Uuid, Instant>>,
}

impl DedupFilter {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            seen: Mutex::new(HashMap::new()),
        }
    }
}

impl MessageFilter for DedupFilter {
    fn admit(&self, envelope: &Envelope) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        seen.retain(|_, at| now.duration_since(*at) < self.ttl);

        if seen.contains_key(&envelope.id) {
            tracing::trace!("Duplicate message {}", envelope.id);
            return false;
        }
        seen.insert(envelope.id, now);
        true
    }
}

/// Drops our own messages echoed back to us
#[derive(Debug)]
pub struct LoopbackFilter {
    local: Uuid,
}

impl LoopbackFilter {
    pub fn new(local: Uuid) -> Self {
        Self { local }
    }
}

impl MessageFilter for LoopbackFilter {
    fn admit(&self, envelope: &Envelope) -> bool {
        envelope.sender != self.local
    }
}

/// Filters applied in order; the first rejection wins
#[derive(Default)]
pub struct FilterChain {
    filters: Vec<Box<dyn MessageFilter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, filter: impl MessageFilter + 'static) -> Self {
        self.filters.push(Box::new(filter));
        self
    }

    pub fn admit(&self, envelope: &Envelope) -> bool {
        self.filters.iter().all(|f| f.admit(envelope))
    }
}

/// Limits how often the same key may trigger an outbound request
#[derive(Debug)]
pub struct RequestThrottle {
    window: Duration,
    last: Mutex<HashMap<Uuid, Instant>>,
}

impl RequestThrottle {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: Mutex::new(HashMap::new()),
        }
    }

    /// True if no request for `key` went out within the window
    pub fn allow(&self, key: Uuid) -> bool {
        let now = Instant::now();
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        last.retain(|_, at| now.duration_since(*at) < self.window);

        if last.contains_key(&key) {
            return false;
        }
        last.insert(key, now);
        true
    }
}
