use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

use crate::core::NodeId;
use crate::utils::{Result, WeaveError};

/// Rendezvous directory contract. The session only ever needs put/get plus
/// joining the overlay; routing internals stay behind this seam so tests
/// can substitute an in-process overlay.
#[async_trait]
pub trait Dht: Send + Sync {
    async fn put(&self, key: NodeId, value: Vec<u8>) -> Result<()>;

    /// `Ok(None)` means the key is absent from the overlay, as opposed to
    /// the overlay being unreachable (`Err`).
    async fn get(&self, key: NodeId) -> Result<Option<Vec<u8>>>;

    /// Join an existing overlay via a known member.
    async fn bootstrap(&self, addr: SocketAddr) -> Result<()>;

    async fn shutdown(&self);
}

/// Overlay RPC messages. `txn` correlates a response with its request.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum DhtMessage {
    Ping {
        txn: u64,
        sender: NodeId,
    },
    Pong {
        txn: u64,
        sender: NodeId,
        contacts: Vec<SocketAddr>,
    },
    Store {
        txn: u64,
        sender: NodeId,
        key: NodeId,
        value: Vec<u8>,
    },
    StoreOk {
        txn: u64,
        sender: NodeId,
    },
    FindValue {
        txn: u64,
        sender: NodeId,
        key: NodeId,
    },
    FindValueResponse {
        txn: u64,
        sender: NodeId,
        value: Option<Vec<u8>>,
    },
}

impl DhtMessage {
    fn txn(&self) -> u64 {
        match self {
            DhtMessage::Ping { txn, .. } => *txn,
            DhtMessage::Pong { txn, .. } => *txn,
            DhtMessage::Store { txn, .. } => *txn,
            DhtMessage::StoreOk { txn, .. } => *txn,
            DhtMessage::FindValue { txn, .. } => *txn,
            DhtMessage::FindValueResponse { txn, .. } => *txn,
        }
    }

    fn is_response(&self) -> bool {
        matches!(
            self,
            DhtMessage::Pong { .. }
                | DhtMessage::StoreOk { .. }
                | DhtMessage::FindValueResponse { .. }
        )
    }
}

type Storage = Arc<RwLock<HashMap<u64, Vec<u8>>>>;
type Contacts = Arc<RwLock<HashSet<SocketAddr>>>;
type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<DhtMessage>>>>;

/// UDP key-value overlay node. Values are replicated to every known
/// contact on `put` and queried contact-by-contact on `get`; there is no
/// routing table, only the flat contact set learned from bootstrap and
/// inbound traffic.
pub struct DhtNode {
    node_id: NodeId,
    local_addr: SocketAddr,
    socket: Arc<UdpSocket>,
    storage: Storage,
    contacts: Contacts,
    pending: Pending,
    request_timeout: Duration,
    listen_task: Mutex<Option<JoinHandle<()>>>,
}

impl DhtNode {
    pub async fn new(node_id: NodeId, port: u16, request_timeout: Duration) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port))
            .await
            .map_err(|e| WeaveError::BindFailed(format!("DHT socket on port {}: {}", port, e)))?;
        let local_addr = socket.local_addr()?;

        info!("DHT node started on {} with id {}", local_addr, node_id);

        let socket = Arc::new(socket);
        let storage: Storage = Arc::new(RwLock::new(HashMap::new()));
        let contacts: Contacts = Arc::new(RwLock::new(HashSet::new()));
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));

        let listen_task = tokio::spawn(Self::listen_loop(
            node_id,
            socket.clone(),
            storage.clone(),
            contacts.clone(),
            pending.clone(),
        ));

        Ok(Self {
            node_id,
            local_addr,
            socket,
            storage,
            contacts,
            pending,
            request_timeout,
            listen_task: Mutex::new(Some(listen_task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn listen_loop(
        node_id: NodeId,
        socket: Arc<UdpSocket>,
        storage: Storage,
        contacts: Contacts,
        pending: Pending,
    ) {
        let mut buffer = vec![0u8; 65536];

        loop {
            let (len, from) = match socket.recv_from(&mut buffer).await {
                Ok(received) => received,
                Err(e) => {
                    error!("DHT socket error: {}", e);
                    break;
                }
            };

            let message: DhtMessage = match serde_json::from_slice(&buffer[..len]) {
                Ok(message) => message,
                Err(e) => {
                    warn!("Malformed DHT message from {}: {}", from, e);
                    continue;
                }
            };

            if message.is_response() {
                match pending.lock().await.remove(&message.txn()) {
                    Some(tx) => {
                        let _ = tx.send(message);
                    }
                    None => debug!("Unmatched DHT response from {}", from),
                }
                continue;
            }

            // Every requester becomes a contact for later replication.
            contacts.write().await.insert(from);

            let reply = match message {
                DhtMessage::Ping { txn, sender } => {
                    debug!("Ping from {} ({})", sender, from);
                    let known = contacts
                        .read()
                        .await
                        .iter()
                        .filter(|addr| **addr != from)
                        .cloned()
                        .collect();
                    DhtMessage::Pong {
                        txn,
                        sender: node_id,
                        contacts: known,
                    }
                }
                DhtMessage::Store {
                    txn, key, value, ..
                } => {
                    debug!("Storing key {} ({} bytes) from {}", key, value.len(), from);
                    storage.write().await.insert(key.raw(), value);
                    DhtMessage::StoreOk {
                        txn,
                        sender: node_id,
                    }
                }
                DhtMessage::FindValue { txn, key, .. } => {
                    let value = storage.read().await.get(&key.raw()).cloned();
                    DhtMessage::FindValueResponse {
                        txn,
                        sender: node_id,
                        value,
                    }
                }
                // Responses were handled above.
                _ => continue,
            };

            match serde_json::to_vec(&reply) {
                Ok(data) => {
                    if let Err(e) = socket.send_to(&data, from).await {
                        warn!("Failed to reply to {}: {}", from, e);
                    }
                }
                Err(e) => warn!("Failed to encode DHT reply: {}", e),
            }
        }
    }

    /// Send one request and await its correlated response, bounded by the
    /// per-request timeout.
    async fn request(&self, message: DhtMessage, to: SocketAddr) -> Result<DhtMessage> {
        let txn = message.txn();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(txn, tx);

        let data = serde_json::to_vec(&message)?;
        if let Err(e) = self.socket.send_to(&data, to).await {
            self.pending.lock().await.remove(&txn);
            return Err(WeaveError::IoError(e.to_string()));
        }

        match timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(WeaveError::IoError("DHT node shut down".to_string())),
            Err(_) => {
                self.pending.lock().await.remove(&txn);
                Err(WeaveError::IoError(format!(
                    "DHT request to {} timed out",
                    to
                )))
            }
        }
    }

    async fn contact_list(&self) -> Vec<SocketAddr> {
        self.contacts.read().await.iter().cloned().collect()
    }
}

#[async_trait]
impl Dht for DhtNode {
    async fn put(&self, key: NodeId, value: Vec<u8>) -> Result<()> {
        self.storage.write().await.insert(key.raw(), value.clone());

        // Per-contact failures are absorbed; the local store already makes
        // the value resolvable through this node.
        for addr in self.contact_list().await {
            let store = DhtMessage::Store {
                txn: rand::random(),
                sender: self.node_id,
                key,
                value: value.clone(),
            };
            match self.request(store, addr).await {
                Ok(DhtMessage::StoreOk { .. }) => debug!("Replicated key {} to {}", key, addr),
                Ok(other) => warn!("Unexpected reply to store from {}: {:?}", addr, other),
                Err(e) => warn!("Store on {} failed: {}", addr, e),
            }
        }

        Ok(())
    }

    async fn get(&self, key: NodeId) -> Result<Option<Vec<u8>>> {
        if let Some(value) = self.storage.read().await.get(&key.raw()).cloned() {
            return Ok(Some(value));
        }

        let contacts = self.contact_list().await;
        if contacts.is_empty() {
            // A one-node overlay holds everything it knows locally.
            return Ok(None);
        }

        let mut answered = false;
        for addr in contacts {
            let find = DhtMessage::FindValue {
                txn: rand::random(),
                sender: self.node_id,
                key,
            };
            match self.request(find, addr).await {
                Ok(DhtMessage::FindValueResponse {
                    value: Some(value), ..
                }) => return Ok(Some(value)),
                Ok(DhtMessage::FindValueResponse { value: None, .. }) => answered = true,
                Ok(other) => warn!("Unexpected reply to find from {}: {:?}", addr, other),
                Err(e) => warn!("Query to {} failed: {}", addr, e),
            }
        }

        if answered {
            Ok(None)
        } else {
            Err(WeaveError::LookupFailed(
                "no DHT contact responded".to_string(),
            ))
        }
    }

    async fn bootstrap(&self, addr: SocketAddr) -> Result<()> {
        let ping = DhtMessage::Ping {
            txn: rand::random(),
            sender: self.node_id,
        };

        match self.request(ping, addr).await {
            Ok(DhtMessage::Pong {
                sender,
                contacts: known,
                ..
            }) => {
                let mut contacts = self.contacts.write().await;
                contacts.insert(addr);
                contacts.extend(known);
                info!(
                    "Joined overlay via {} ({}), {} contacts known",
                    addr,
                    sender,
                    contacts.len()
                );
                Ok(())
            }
            Ok(other) => Err(WeaveError::BootstrapFailed(format!(
                "unexpected reply from {}: {:?}",
                addr, other
            ))),
            Err(e) => Err(WeaveError::BootstrapFailed(e.to_string())),
        }
    }

    async fn shutdown(&self) {
        if let Some(task) = self.listen_task.lock().await.take() {
            task.abort();
        }
        self.pending.lock().await.clear();
        debug!("DHT node {} shut down", self.node_id);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// In-process overlay honoring the put/get contract; handles created
    /// with `join` share one keyspace.
    pub(crate) struct MemoryDht {
        store: Arc<RwLock<HashMap<u64, Vec<u8>>>>,
        failing: Arc<AtomicBool>,
    }

    impl MemoryDht {
        pub(crate) fn new() -> Self {
            Self {
                store: Arc::new(RwLock::new(HashMap::new())),
                failing: Arc::new(AtomicBool::new(false)),
            }
        }

        pub(crate) fn join(&self) -> Self {
            Self {
                store: self.store.clone(),
                failing: Arc::new(AtomicBool::new(false)),
            }
        }

        pub(crate) fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        fn check(&self) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                Err(WeaveError::IoError("simulated overlay failure".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl Dht for MemoryDht {
        async fn put(&self, key: NodeId, value: Vec<u8>) -> Result<()> {
            self.check()?;
            self.store.write().await.insert(key.raw(), value);
            Ok(())
        }

        async fn get(&self, key: NodeId) -> Result<Option<Vec<u8>>> {
            self.check()?;
            Ok(self.store.read().await.get(&key.raw()).cloned())
        }

        async fn bootstrap(&self, _addr: SocketAddr) -> Result<()> {
            self.check()
        }

        async fn shutdown(&self) {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn node(id: u64) -> DhtNode {
        DhtNode::new(NodeId::from_raw(id), 0, Duration::from_millis(500))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_put_replicates_to_bootstrap_contact() {
        let a = node(1).await;
        let b = node(2).await;

        b.bootstrap(a.local_addr()).await.unwrap();
        b.put(NodeId::from_raw(42), b"record".to_vec()).await.unwrap();

        // b replicated to a, so a answers from local storage
        let value = a.get(NodeId::from_raw(42)).await.unwrap();
        assert_eq!(value, Some(b"record".to_vec()));

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_get_queries_contacts() {
        let a = node(1).await;
        a.put(NodeId::from_raw(7), b"held by a".to_vec())
            .await
            .unwrap();

        let c = node(3).await;
        c.bootstrap(a.local_addr()).await.unwrap();

        let value = c.get(NodeId::from_raw(7)).await.unwrap();
        assert_eq!(value, Some(b"held by a".to_vec()));

        a.shutdown().await;
        c.shutdown().await;
    }

    #[tokio::test]
    async fn test_get_absent_key_is_none_not_error() {
        let a = node(1).await;
        let b = node(2).await;
        b.bootstrap(a.local_addr()).await.unwrap();

        // a is reachable and answers "absent"
        assert_eq!(b.get(NodeId::from_raw(99)).await.unwrap(), None);
        // no contacts at all is also "absent", not a failure
        assert_eq!(a.get(NodeId::from_raw(12345)).await.unwrap(), None);

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_bootstrap_to_dead_member_fails() {
        let dead = {
            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            socket.local_addr().unwrap()
        };

        let a = node(1).await;
        let err = a.bootstrap(dead).await.unwrap_err();
        assert!(matches!(err, WeaveError::BootstrapFailed(_)));

        a.shutdown().await;
    }

    #[tokio::test]
    async fn test_pong_shares_known_contacts() {
        let a = node(1).await;
        let b = node(2).await;
        let c = node(3).await;

        b.bootstrap(a.local_addr()).await.unwrap();
        c.bootstrap(a.local_addr()).await.unwrap();

        // a knew b before c pinged, so c learned of b from the pong
        assert!(c.contact_list().await.len() >= 2);

        a.shutdown().await;
        b.shutdown().await;
        c.shutdown().await;
    }
}
