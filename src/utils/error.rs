use thiserror::Error;

pub type Result<T> = std::result::Result<T, WeaveError>;

#[derive(Error, Debug)]
pub enum WeaveError {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("bind failed: {0}")]
    BindFailed(String),

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("address discovery failed: {0}")]
    DiscoveryFailed(String),

    #[error("publish failed: {0}")]
    PublishFailed(String),

    #[error("peer lookup failed: {0}")]
    LookupFailed(String),

    #[error("no peer record for id {0}")]
    PeerNotFound(u64),

    #[error("bootstrap failed: {0}")]
    BootstrapFailed(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("stream error: {0}")]
    StreamError(String),

    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),

    #[error("serialization error: {0}")]
    SerializationError(String),
}

impl From<std::io::Error> for WeaveError {
    fn from(err: std::io::Error) -> Self {
        WeaveError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for WeaveError {
    fn from(err: serde_json::Error) -> Self {
        WeaveError::SerializationError(err.to_string())
    }
}
