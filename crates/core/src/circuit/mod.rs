mod crypto;
mod exit;
mod path_selection;
mod relay;
mod types;

pub use crypto::{
    respond_to_handshake, CryptoError, DhResponse, DhSecret, KeyDirection, SessionKeys, AUTH_LEN,
    LAYER_OVERHEAD, SESSION_KEY_MATERIAL_LEN,
};
pub use exit::{EgressDecision, ExitSocket};
pub use path_selection::{PathSelectionCriteria, PathSelector};
pub use relay::{RelayDirection, RelayRoute, RelayTable};
pub use types::{
    circuit_id_from_virtual_ip, virtual_ip, Circuit, CircuitId, CircuitState, CircuitType, Hop,
};
