//! Logical time
//!
//! Each peer keeps a Lamport counter. Every local event ticks it and every
//! received envelope timestamp pulls it forward, so a reply is always
//! stamped later than the request that caused it.

use bytes::{Buf, BufMut};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::protocol::{need, CodecError};

/// A logical timestamp
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PseudoTime(u64);

impl PseudoTime {
    pub const ZERO: PseudoTime = PseudoTime(0);

    pub fn new(ticks: u64) -> Self {
        Self(ticks)
    }

    pub fn ticks(&self) -> u64 {
        self.0
    }

    /// Strictly earlier than `other`
    pub fn before(&self, other: &PseudoTime) -> bool {
        self.0 < other.0
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i64(self.0 as i64);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        need(buf, 8)?;
        Ok(Self(buf.get_i64() as u64))
    }
}

impl fmt::Display for PseudoTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Per-peer Lamport clock
#[derive(Debug, Default)]
pub struct LamportClock {
    counter: AtomicU64,
}

impl LamportClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tick for a local event and return the new time
    pub fn now(&self) -> PseudoTime {
        PseudoTime(self.counter.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Merge a timestamp seen on the wire
    pub fn observe(&self, remote: PseudoTime) {
        self.counter.fetch_max(remote.ticks(), Ordering::AcqRel);
    }

    /// Last issued or observed time, without ticking
    pub fn current(&self) -> PseudoTime {
        PseudoTime(self.counter.load(Ordering::Acquire))
    }
}
