use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::utils::WeaveError;

/// Fixed-width node identifier in the DHT keyspace.
///
/// One `u64` serves as both the DHT key and the user-facing id, so the
/// value a peer types in is exactly the key its record lives under.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate an identifier from the current time plus a random salt.
    /// Called once per session; collisions are accepted, not mitigated.
    pub fn generate() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let salt: u64 = rand::random();

        let digest = Sha256::digest(format!("{}:{}", nanos, salt).as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        Self(u64::from_be_bytes(bytes))
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl FromStr for NodeId {
    type Err = WeaveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(NodeId)
            .map_err(|_| WeaveError::InvalidPeerId(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_is_distinct() {
        // 64-bit space; two draws colliding would point at a broken seed
        let a = NodeId::generate();
        let b = NodeId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_parse_round_trip() {
        let id = NodeId::from_raw(42);
        let parsed: NodeId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = "not-a-number".parse::<NodeId>().unwrap_err();
        assert!(matches!(err, WeaveError::InvalidPeerId(_)));

        let err = "-5".parse::<NodeId>().unwrap_err();
        assert!(matches!(err, WeaveError::InvalidPeerId(_)));
    }

    #[test]
    fn test_parse_trims_whitespace() {
        let id: NodeId = "  1234  ".parse().unwrap();
        assert_eq!(id.raw(), 1234);
    }
}
