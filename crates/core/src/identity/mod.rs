mod identity;
mod keypair;
mod node_id;

pub use identity::{ExportableIdentity, Identity};
pub use keypair::{KeyPair, KeyPairError, PublicKey, PUBLIC_KEY_LEN};
pub use node_id::{NodeId, NodeIdError, NODE_ID_LEN};
