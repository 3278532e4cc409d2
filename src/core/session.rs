use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Duration;

use crate::core::{Config, ConnectionState, NodeId, PeerRecord, SessionState};
use crate::network::channel::MessageChannel;
use crate::network::connection::ConnectionManager;
use crate::network::dht::{Dht, DhtNode};
use crate::network::directory::PeerDirectory;
use crate::network::discovery::{AddressDiscovery, HttpIpEcho, IpEcho, Stun};
use crate::network::stun::StunClient;
use crate::utils::{Result, WeaveError};

/// One node's session: identity, observable state, and the operation
/// surface the presentation layer drives. Collaborators (DHT overlay,
/// STUN, HTTP echo) are injected so tests can run without a network.
pub struct Session {
    id: NodeId,
    config: Config,
    state: SessionState,
    dht: Arc<dyn Dht>,
    discovery: AddressDiscovery,
    directory: PeerDirectory,
    channel: MessageChannel,
    manager: ConnectionManager,
}

impl Session {
    /// Assemble a session with a freshly generated identity.
    pub fn new(
        config: Config,
        dht: Arc<dyn Dht>,
        stun: Arc<dyn Stun>,
        echo: Arc<dyn IpEcho>,
    ) -> Self {
        Self::with_id(NodeId::generate(), config, dht, stun, echo)
    }

    /// Assemble a session under a caller-chosen identity. `new` is the
    /// normal path; this exists for wiring where the id must be known
    /// before the collaborators are built.
    pub fn with_id(
        id: NodeId,
        config: Config,
        dht: Arc<dyn Dht>,
        stun: Arc<dyn Stun>,
        echo: Arc<dyn IpEcho>,
    ) -> Self {
        let state = SessionState::new();
        let channel = MessageChannel::new(state.clone());
        let manager = ConnectionManager::new(
            state.clone(),
            channel.clone(),
            Duration::from_secs(config.connect_timeout_secs),
        );
        let discovery = AddressDiscovery::new(
            stun,
            echo,
            config.stun_servers.clone(),
            config.listen_port,
        );
        let directory = PeerDirectory::new(dht.clone());

        info!("Session initialized with node id {}", id);

        Self {
            id,
            config,
            state,
            dht,
            discovery,
            directory,
            channel,
            manager,
        }
    }

    /// Start a session backed by the real collaborators: a DHT node on the
    /// configured UDP port, the STUN client, and the HTTP echo client.
    /// Begins listening immediately and joins the overlay when a bootstrap
    /// peer is configured.
    pub async fn start(config: Config) -> Result<Self> {
        let id = NodeId::generate();
        let request_timeout = Duration::from_secs(config.request_timeout_secs);

        let dht = Arc::new(DhtNode::new(id, config.dht_port, request_timeout).await?);
        let stun = Arc::new(StunClient::new(request_timeout));
        let echo = Arc::new(HttpIpEcho::new(config.ip_echo_url.clone(), request_timeout)?);

        let session = Self::with_id(id, config, dht, stun, echo);
        session.listen().await?;

        if let Some(bootstrap) = session.config.bootstrap_peer.clone() {
            let target = bootstrap
                .rsplit_once(':')
                .and_then(|(host, port)| port.parse::<u16>().ok().map(|p| (host.to_string(), p)));
            match target {
                Some((host, port)) => {
                    if let Err(e) = session.join_network(&host, port).await {
                        warn!("Bootstrap via {} failed: {}", bootstrap, e);
                    }
                }
                None => warn!("Ignoring malformed bootstrap address '{}'", bootstrap),
            }
        }

        Ok(session)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Bind the message listener on the configured port and return the
    /// bound address.
    pub async fn listen(&self) -> Result<SocketAddr> {
        self.manager.listen(self.config.listen_port).await
    }

    /// Run the discovery chain, remember the result as this node's
    /// candidate public address, and publish it to the directory.
    pub async fn fetch_public_address(&self) -> Result<SocketAddr> {
        info!("Fetching public address");

        let addr = match self.discovery.discover().await {
            Ok(addr) => addr,
            Err(e) => {
                self.state
                    .set(ConnectionState::Failed(e.to_string()))
                    .await;
                return Err(e);
            }
        };

        self.state.set_public_addr(addr).await;

        if let Err(e) = self.publish().await {
            self.state
                .set(ConnectionState::Failed(e.to_string()))
                .await;
            return Err(e);
        }

        Ok(addr)
    }

    /// Publish this node's record under its own id. Skipped silently while
    /// no public address is known yet, so callers can't publish an
    /// incomplete record.
    pub async fn publish(&self) -> Result<()> {
        let addr = match self.state.public_addr().await {
            Some(addr) => addr,
            None => {
                debug!("No public address known yet, skipping publish");
                return Ok(());
            }
        };

        let record = PeerRecord::new(self.id, addr.ip().to_string(), addr.port());
        self.directory.publish(&record).await?;
        info!("Published {} under id {}", record.addr(), self.id);
        Ok(())
    }

    /// Join an existing overlay through a known member.
    pub async fn join_network(&self, host: &str, port: u16) -> Result<()> {
        let target = format!("{}:{}", host, port);
        let addr = tokio::net::lookup_host(target.as_str())
            .await
            .map_err(|e| WeaveError::BootstrapFailed(format!("{}: {}", target, e)))?
            .next()
            .ok_or_else(|| WeaveError::BootstrapFailed(format!("{}: no addresses", target)))?;

        self.dht.bootstrap(addr).await
    }

    pub async fn resolve(&self, id: NodeId) -> Result<PeerRecord> {
        self.directory.resolve(id).await
    }

    /// Look a peer up in the directory and dial the recorded address. A
    /// failed lookup lands in the state machine without any socket work.
    pub async fn connect_to_peer(&self, id: NodeId) -> Result<()> {
        let record = match self.directory.resolve(id).await {
            Ok(record) => record,
            Err(e) => {
                let reason = match &e {
                    WeaveError::PeerNotFound(_) => "peer not found".to_string(),
                    other => format!("peer lookup failed: {}", other),
                };
                self.state.set(ConnectionState::Failed(reason)).await;
                return Err(e);
            }
        };

        info!("Resolved peer {} to {}", id, record.addr());
        self.manager.connect(&record.host, record.port).await
    }

    pub async fn send(&self, text: &str) -> Result<()> {
        self.channel.send(text).await
    }

    pub async fn messages(&self) -> Vec<String> {
        self.state.messages().await
    }

    /// Tear the session down: connections first, then overlay
    /// participation.
    pub async fn close(&self) {
        self.manager.close().await;
        self.dht.shutdown().await;
        info!("Session {} closed", self.id);
    }
}
