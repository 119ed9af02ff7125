use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Tunnel protocol constants
pub mod protocol {
    use std::time::Duration;

    /// Default UDP port for overlay communication
    pub const DEFAULT_PORT: u16 = 7759;

    /// Interval between circuit pings
    pub const PING_INTERVAL: Duration = Duration::from_secs(15);

    /// How long a ping may stay unanswered before the circuit is destroyed
    pub const PING_TIMEOUT: Duration = Duration::from_secs(20);

    /// Port used by virtual peers that stand for a rendezvous circuit
    pub const CIRCUIT_ID_PORT: u16 = 1024;

    /// Delay before retrying a circuit that found no first hop
    pub const CREATE_RETRY_DELAY: Duration = Duration::from_secs(5);

    /// Interval of the circuit maintenance loop
    pub const CIRCUIT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5);

    /// Time allowed for one create/extend round trip
    pub const CIRCUIT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

    /// Time a relay keeps its candidate list around waiting for an EXTEND
    pub const CREATED_CACHE_TIMEOUT: Duration = Duration::from_secs(10);

    /// Timeout for hidden-service control requests
    pub const HIDDEN_SERVICE_TIMEOUT: Duration = Duration::from_secs(15);

    /// Timeout for a tunneled DHT lookup
    pub const DHT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

    /// Introduction circuits that have not registered within this window are rebuilt
    pub const INTRO_RECREATE_THRESHOLD: Duration = Duration::from_secs(30);

    /// Upper bound on peers carried in a key-response
    pub const MAX_PEX_PEERS: usize = 50;

    /// Number of candidate keys a hop offers in its created message
    pub const MAX_CANDIDATES_IN_CREATED: usize = 4;

    /// Outstanding requests kept per request-cache category
    pub const MAX_PENDING_REQUESTS: usize = 1024;

    /// Destinations an exit socket tracks for its flood guard
    pub const MAX_EXIT_DESTINATIONS: usize = 1024;
}

/// Tunable behaviour of the tunnel community
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelSettings {
    /// Default number of hops for data circuits
    pub circuit_length: usize,

    /// Number of ready circuits per hop count considered "ready"
    pub min_circuits: usize,

    /// Number of circuits kept per hop count
    pub max_circuits: usize,

    /// Admission cap for acting as relay or exit
    pub max_relays_or_exits: usize,

    /// Hard age cap for circuits, relays and exits (seconds)
    pub max_time: u64,

    /// Inactivity timeout (seconds)
    pub max_time_inactive: u64,

    /// Byte cap per circuit, relay or exit
    pub max_traffic: u64,

    /// Unanswered datagrams allowed towards one destination
    pub max_packets_without_reply: i64,

    /// One SOCKS5 port per supported hop count (index 0 is 1 hop)
    pub socks_listen_ports: Vec<u16>,

    /// Minimum gap between hidden-service DHT lookups (seconds)
    pub dht_lookup_interval: u64,

    /// Whether this node carries clearnet exit traffic
    pub become_exitnode: bool,

    /// Run a circuit self-test at startup
    pub do_test: bool,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            circuit_length: 3,
            min_circuits: 4,
            max_circuits: 8,
            max_relays_or_exits: 100,
            max_time: 600,
            max_time_inactive: 20,
            max_traffic: 55 * 1024 * 1024,
            max_packets_without_reply: 50,
            socks_listen_ports: vec![1080, 1081, 1082],
            dht_lookup_interval: 30,
            become_exitnode: false,
            do_test: false,
        }
    }
}

impl TunnelSettings {
    pub fn max_time(&self) -> Duration {
        Duration::from_secs(self.max_time)
    }

    pub fn max_time_inactive(&self) -> Duration {
        Duration::from_secs(self.max_time_inactive)
    }

    pub fn dht_lookup_interval(&self) -> Duration {
        Duration::from_secs(self.dht_lookup_interval)
    }

    pub fn with_circuit_length(mut self, hops: usize) -> Self {
        self.circuit_length = hops;
        self
    }

    pub fn with_max_circuits(mut self, max_circuits: usize) -> Self {
        self.max_circuits = max_circuits;
        self
    }

    pub fn with_exitnode(mut self, become_exitnode: bool) -> Self {
        self.become_exitnode = become_exitnode;
        self
    }
}

/// A statically configured peer used to seed the candidate table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapPeer {
    /// `host:port` of the peer's overlay socket
    pub address: String,

    /// Hex-encoded Curve25519 public key
    pub public_key: String,
}

/// Node configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Listen address
    pub listen_addr: String,

    /// Listen port
    pub listen_port: u16,

    /// Data directory
    pub data_dir: String,

    /// Enable verbose logging
    pub verbose: bool,

    /// Peers known at startup
    pub bootstrap_peers: Vec<BootstrapPeer>,

    /// Tunnel behaviour
    pub tunnel: TunnelSettings,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            listen_port: protocol::DEFAULT_PORT,
            data_dir: "./data".to_string(),
            verbose: false,
            bootstrap_peers: Vec::new(),
            tunnel: TunnelSettings::default(),
        }
    }
}

impl NodeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    pub fn with_bootstrap_peers(mut self, peers: Vec<BootstrapPeer>) -> Self {
        self.bootstrap_peers = peers;
        self
    }

    pub fn with_data_dir(mut self, dir: String) -> Self {
        self.data_dir = dir;
        self
    }

    pub fn with_tunnel(mut self, tunnel: TunnelSettings) -> Self {
        self.tunnel = tunnel;
        self
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError(e.to_string()))?;

        toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &PathBuf) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::WriteError(e.to_string()))?;

        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeError(String),

    #[error("Failed to write config file: {0}")]
    WriteError(String),
}
