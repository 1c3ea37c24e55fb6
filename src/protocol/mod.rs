//! Protocol module - Defines the wire protocol for peer replication
//!
//! Every UDP datagram is `encrypt(gzip(header ‖ body))`, where the header is:
//! - 4 bytes command code
//! - 16 bytes message id (low half, high half)
//! - 16 bytes sender peer id (low half, high half)
//! - 8 bytes sender logical timestamp
//!
//! All integers are big-endian.

mod codec;
mod ids;
mod message;
mod registry;
mod value;

pub use codec::*;
pub use ids::*;
pub use message::*;
pub use registry::*;
pub use value::*;

/// Default UDP port
pub const DEFAULT_PORT: u16 = 24900;
