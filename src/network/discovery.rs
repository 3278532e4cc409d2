use async_trait::async_trait;
use log::{debug, info, warn};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::time::Duration;

use crate::utils::{Result, WeaveError};

/// One bounded-time query against a single STUN server.
#[async_trait]
pub trait Stun: Send + Sync {
    async fn query(&self, server: &str) -> Result<SocketAddr>;
}

/// Plaintext "what is my IP" service, the last resort when STUN fails.
#[async_trait]
pub trait IpEcho: Send + Sync {
    async fn fetch_public_ip(&self) -> Result<IpAddr>;
}

/// HTTP address-echo client against a service like api.ipify.org.
pub struct HttpIpEcho {
    client: reqwest::Client,
    url: String,
}

impl HttpIpEcho {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WeaveError::DiscoveryFailed(format!("HTTP client setup: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl IpEcho for HttpIpEcho {
    async fn fetch_public_ip(&self) -> Result<IpAddr> {
        let body = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| WeaveError::DiscoveryFailed(format!("GET {}: {}", self.url, e)))?
            .error_for_status()
            .map_err(|e| WeaveError::DiscoveryFailed(format!("GET {}: {}", self.url, e)))?
            .text()
            .await
            .map_err(|e| WeaveError::DiscoveryFailed(format!("GET {}: {}", self.url, e)))?;

        body.trim().parse::<IpAddr>().map_err(|_| {
            WeaveError::DiscoveryFailed(format!("address echo returned '{}'", body.trim()))
        })
    }
}

/// Ordered public-address discovery: STUN servers first, HTTP echo last.
pub struct AddressDiscovery {
    stun: Arc<dyn Stun>,
    echo: Arc<dyn IpEcho>,
    servers: Vec<String>,
    fallback_port: u16,
}

impl AddressDiscovery {
    pub fn new(
        stun: Arc<dyn Stun>,
        echo: Arc<dyn IpEcho>,
        servers: Vec<String>,
        fallback_port: u16,
    ) -> Self {
        Self {
            stun,
            echo,
            servers,
            fallback_port,
        }
    }

    /// Try each STUN server in order and return the first mapped address.
    /// Per-server failures are absorbed; only exhaustion of the whole
    /// chain, HTTP fallback included, surfaces as `DiscoveryFailed`.
    pub async fn discover(&self) -> Result<SocketAddr> {
        for server in &self.servers {
            debug!("Trying STUN server {}", server);
            match self.stun.query(server).await {
                Ok(mapped) => return Ok(mapped),
                Err(e) => warn!("STUN error on {}: {}", server, e),
            }
        }

        warn!("All STUN servers failed, falling back to HTTP");
        match self.echo.fetch_public_ip().await {
            Ok(ip) => {
                // The echo service only sees the IP. Pairing it with the
                // configured listen port assumes the NAT maps that port
                // through unchanged.
                let addr = SocketAddr::new(ip, self.fallback_port);
                info!("Public address via HTTP echo: {}", addr);
                Ok(addr)
            }
            Err(e) => Err(WeaveError::DiscoveryFailed(format!(
                "all {} STUN servers and the HTTP fallback failed, last error: {}",
                self.servers.len(),
                e
            ))),
        }
    }
}
