use log::debug;
use std::sync::Arc;

use crate::core::{NodeId, PeerRecord};
use crate::network::dht::Dht;
use crate::utils::{Result, WeaveError};

/// Publish/lookup of peer records, keyed by node id, on top of the DHT
/// collaborator.
pub struct PeerDirectory {
    dht: Arc<dyn Dht>,
}

impl PeerDirectory {
    pub fn new(dht: Arc<dyn Dht>) -> Self {
        Self { dht }
    }

    /// Store `record` under its own id. The DHT write is awaited to
    /// completion, so `Ok` means the record is visible to subsequent
    /// resolves against the same overlay.
    pub async fn publish(&self, record: &PeerRecord) -> Result<()> {
        if record.host.is_empty() {
            return Err(WeaveError::PublishFailed(
                "record has no address".to_string(),
            ));
        }

        let value = record
            .encode()
            .map_err(|e| WeaveError::PublishFailed(e.to_string()))?;
        self.dht
            .put(record.id, value)
            .await
            .map_err(|e| WeaveError::PublishFailed(e.to_string()))?;

        debug!("Published record for {}: {}", record.id, record.addr());
        Ok(())
    }

    /// Fetch and decode the record stored under `id`. An absent key is
    /// `PeerNotFound`; an unreachable or inconsistent overlay is
    /// `LookupFailed`. Callers usually present both as "cannot reach that
    /// peer" but they stay distinguishable.
    pub async fn resolve(&self, id: NodeId) -> Result<PeerRecord> {
        let value = self
            .dht
            .get(id)
            .await
            .map_err(|e| WeaveError::LookupFailed(e.to_string()))?;

        let bytes = match value {
            Some(bytes) => bytes,
            None => return Err(WeaveError::PeerNotFound(id.raw())),
        };

        let record =
            PeerRecord::decode(&bytes).map_err(|e| WeaveError::LookupFailed(e.to_string()))?;
        if record.id != id {
            return Err(WeaveError::LookupFailed(format!(
                "record under key {} carries id {}",
                id, record.id
            )));
        }

        Ok(record)
    }
}
