//! Weave: serverless peer-to-peer text messaging.
//!
//! Two nodes behind NATs find each other through a DHT used purely as a
//! rendezvous directory: each publishes its own `{id, host, port}` record
//! and looks a peer's record up the same way. Public addresses come from
//! an ordered list of STUN servers with an HTTP address-echo fallback,
//! and messages travel as length-prefixed UTF-8 frames over a direct TCP
//! connection.

pub mod core;
pub mod network;
pub mod utils;

// Re-export main types
pub use crate::core::{Config, ConnectionState, NodeId, PeerRecord, Session, SessionState};
pub use crate::network::{AddressDiscovery, Dht, DhtNode, MessageChannel, PeerDirectory};
pub use crate::utils::{
    error::{Result, WeaveError},
    setup_logging,
};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
