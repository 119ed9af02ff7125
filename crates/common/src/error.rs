use thiserror::Error;

/// Common error type for the tunnel subsystem
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Malformed cell: {0}")]
    MalformedCell(String),

    #[error("Crypto failure: {0}")]
    Crypto(String),

    #[error("No cached request for {0}")]
    CacheMiss(String),

    #[error("Admission rejected: {0}")]
    AdmissionRejected(String),

    #[error("Circuit creation failed: {0}")]
    CircuitCreationFailed(String),

    #[error("Circuit not found: {0}")]
    CircuitNotFound(u32),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type for tunnel operations
pub type Result<T, E = TunnelError> = std::result::Result<T, E>;

impl TunnelError {
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedCell(msg.into())
    }

    pub fn crypto(msg: impl Into<String>) -> Self {
        Self::Crypto(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
