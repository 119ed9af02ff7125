pub mod circuit;
pub mod identity;
pub mod peer;
pub mod protocol;
pub mod service;
pub mod tunnel;

pub use identity::{
    ExportableIdentity, Identity, KeyPair, KeyPairError, NodeId, NodeIdError, PublicKey,
};
pub use protocol::{Address, Cell, Message, MessageType};

// Re-export circuit types
pub use circuit::{
    circuit_id_from_virtual_ip, virtual_ip, Circuit, CircuitId, CircuitState, CircuitType,
    CryptoError, ExitSocket, RelayRoute, SessionKeys,
};

// Re-export peer types
pub use peer::{Candidate, CandidateManager};

// Re-export hidden-service types
pub use service::{DownloadState, DownloadStatus};

// Re-export the community
pub use tunnel::{
    CircuitRequest, Clock, ManualClock, RemovalReason, SystemClock, TunnelAction,
    TunnelCommunity, TunnelStats,
};
