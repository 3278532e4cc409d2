pub mod config;
pub mod identity;
pub mod record;
pub mod session;
pub mod state;

pub use config::{Config, DEFAULT_PORT};
pub use identity::NodeId;
pub use record::PeerRecord;
pub use session::Session;
pub use state::{ConnectionState, SessionState};
