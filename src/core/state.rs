use log::debug;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Connectivity status of the session, observed by the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Listening,
    Connecting,
    Connected,
    Failed(String),
}

/// Shared observable view of a session: connectivity state, the received
/// message list, and the candidate public address. Cloning yields another
/// handle onto the same data. Writers update whole values; readers never
/// see a partial update.
#[derive(Clone)]
pub struct SessionState {
    state: Arc<RwLock<ConnectionState>>,
    messages: Arc<RwLock<Vec<String>>>,
    public_addr: Arc<RwLock<Option<SocketAddr>>>,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            messages: Arc::new(RwLock::new(Vec::new())),
            public_addr: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn current(&self) -> ConnectionState {
        self.state.read().await.clone()
    }

    /// Record a transition. Only the other components drive this; the state
    /// machine itself has no timers or polling.
    pub async fn set(&self, state: ConnectionState) {
        debug!("connection state -> {:?}", state);
        *self.state.write().await = state;
    }

    pub async fn push_message(&self, text: String) {
        self.messages.write().await.push(text);
    }

    pub async fn messages(&self) -> Vec<String> {
        self.messages.read().await.clone()
    }

    pub async fn set_public_addr(&self, addr: SocketAddr) {
        *self.public_addr.write().await = Some(addr);
    }

    pub async fn public_addr(&self) -> Option<SocketAddr> {
        *self.public_addr.read().await
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}
