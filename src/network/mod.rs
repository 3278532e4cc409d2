pub mod channel;
pub mod connection;
pub mod dht;
pub mod directory;
pub mod discovery;
pub mod stun;

pub use channel::MessageChannel;
pub use connection::ConnectionManager;
pub use dht::{Dht, DhtNode};
pub use directory::PeerDirectory;
pub use discovery::{AddressDiscovery, HttpIpEcho, IpEcho, Stun};
pub use stun::StunClient;
