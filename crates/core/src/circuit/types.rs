use super::crypto::{DhSecret, SessionKeys};
use crate::identity::{NodeId, PublicKey};
use crate::peer::Candidate;
use crate::service::ReadyHook;
use anontunnel_common::InfoHash;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Instant;

/// Locally unique circuit identifier; 0 is reserved for plain messages
pub type CircuitId = u32;

/// Address a rendezvous circuit is known by to the local torrent client
pub fn virtual_ip(circuit_id: CircuitId) -> Ipv4Addr {
    Ipv4Addr::from(circuit_id)
}

pub fn circuit_id_from_virtual_ip(ip: Ipv4Addr) -> CircuitId {
    u32::from(ip)
}

/// Role a circuit plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitType {
    /// Clearnet traffic through an exit
    Data,

    /// Seeder's circuit to its introduction point
    IntroductionPoint,

    /// Seeder's half of a hidden connection, ending at the rendezvous point
    RendezvousPoint,

    /// Downloader's half of a hidden connection
    Rendezvous,

    /// Downloader's circuit used to reach an introduction point
    Introduce,
}

impl CircuitType {
    /// Circuits that end at a rendezvous splice and carry end-to-end keys
    pub fn is_hidden_link(&self) -> bool {
        matches!(self, Self::RendezvousPoint | Self::Rendezvous)
    }
}

impl std::fmt::Display for CircuitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Data => "DATA",
            Self::IntroductionPoint => "IP",
            Self::RendezvousPoint => "RP",
            Self::Rendezvous => "RENDEZVOUS",
            Self::Introduce => "INTRODUCE",
        };
        f.write_str(name)
    }
}

/// State of a circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Still adding hops
    Extending,

    /// All hops verified
    Ready,

    /// Torn down, waiting to be dropped
    Broken,
}

/// A single hop in a circuit
#[derive(Debug)]
pub struct Hop {
    pub public_key: PublicKey,
    pub node_id: NodeId,

    /// Known for the first hop and for forced exits
    pub address: Option<SocketAddr>,

    /// Installed once the hop's handshake reply is verified
    pub session_keys: Option<SessionKeys>,

    /// Our half of the handshake while the hop is pending
    pub dh_secret: Option<DhSecret>,
}

impl Hop {
    pub fn new(public_key: PublicKey, address: Option<SocketAddr>, dh_secret: DhSecret) -> Self {
        Self {
            node_id: NodeId::from_public_key(&public_key),
            public_key,
            address,
            session_keys: None,
            dh_secret: Some(dh_secret),
        }
    }
}

/// A circuit this node originated
#[derive(Debug)]
pub struct Circuit {
    pub circuit_id: CircuitId,

    /// Target length
    pub goal_hops: usize,

    /// Verified hops, entry first
    pub hops: Vec<Hop>,

    /// Hop whose created/extended reply we are waiting for
    pub unverified_hop: Option<Hop>,

    pub first_hop: SocketAddr,
    pub ctype: CircuitType,

    /// Peer that must be the last hop
    pub required_exit: Option<Candidate>,

    /// Anonymised info hash for hidden-service circuits
    pub info_hash: Option<InfoHash>,

    /// End-to-end keys for circuits spliced at a rendezvous point
    pub hs_session_keys: Option<SessionKeys>,

    /// Run once when the circuit becomes ready
    pub on_ready: Option<ReadyHook>,

    pub bytes_up: u64,
    pub bytes_down: u64,
    pub creation_time: Instant,
    pub last_incoming: Instant,
    broken: bool,
}

impl Circuit {
    pub fn new(
        circuit_id: CircuitId,
        goal_hops: usize,
        first_hop: SocketAddr,
        ctype: CircuitType,
        now: Instant,
    ) -> Self {
        Self {
            circuit_id,
            goal_hops,
            hops: Vec::new(),
            unverified_hop: None,
            first_hop,
            ctype,
            required_exit: None,
            info_hash: None,
            hs_session_keys: None,
            on_ready: None,
            bytes_up: 0,
            bytes_down: 0,
            creation_time: now,
            last_incoming: now,
            broken: false,
        }
    }

    pub fn state(&self) -> CircuitState {
        if self.broken {
            CircuitState::Broken
        } else if self.hops.len() < self.goal_hops || self.unverified_hop.is_some() {
            CircuitState::Extending
        } else {
            CircuitState::Ready
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state() == CircuitState::Ready
    }

    /// Hop count under which the SOCKS5 side knows this circuit
    ///
    /// A downloader's rendezvous circuit carries one extra hop (the
    /// rendezvous point itself) on top of the anonymity level it serves.
    pub fn socks_hops(&self) -> usize {
        match self.ctype {
            CircuitType::Rendezvous => self.goal_hops.saturating_sub(1),
            _ => self.goal_hops,
        }
    }

    /// Promote the pending hop once its keys are installed
    pub fn add_hop(&mut self, hop: Hop) {
        self.hops.push(hop);
    }

    /// Public keys already on (or being added to) this circuit
    pub fn used_public_keys(&self) -> Vec<PublicKey> {
        self.hops
            .iter()
            .chain(self.unverified_hop.iter())
            .map(|hop| hop.public_key)
            .collect()
    }

    /// Record that something arrived on this circuit
    pub fn beat_heart(&mut self, now: Instant) {
        self.last_incoming = now;
    }

    pub fn add_sent(&mut self, bytes: u64) {
        self.bytes_up += bytes;
    }

    pub fn add_received(&mut self, bytes: u64) {
        self.bytes_down += bytes;
    }

    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::KeyPair;

    fn test_circuit(goal_hops: usize) -> Circuit {
        Circuit::new(
            7,
            goal_hops,
            "10.0.0.1:7759".parse().unwrap(),
            CircuitType::Data,
            Instant::now(),
        )
    }

    fn test_hop() -> Hop {
        Hop::new(KeyPair::generate().public_key(), None, DhSecret::generate())
    }

    #[test]
    fn test_state_progression() {
        let mut circuit = test_circuit(2);
        assert_eq!(circuit.state(), CircuitState::Extending);

        circuit.add_hop(test_hop());
        assert_eq!(circuit.state(), CircuitState::Extending);

        circuit.unverified_hop = Some(test_hop());
        circuit.add_hop(test_hop());
        assert_eq!(circuit.state(), CircuitState::Extending);

        circuit.unverified_hop = None;
        assert!(circuit.is_ready());

        circuit.mark_broken();
        assert_eq!(circuit.state(), CircuitState::Broken);
    }

    #[test]
    fn test_used_keys_include_pending_hop() {
        let mut circuit = test_circuit(3);
        let verified = test_hop();
        let pending = test_hop();
        let expected = vec![verified.public_key, pending.public_key];

        circuit.add_hop(verified);
        circuit.unverified_hop = Some(pending);
        assert_eq!(circuit.used_public_keys(), expected);
    }

    #[test]
    fn test_virtual_ip_mapping() {
        assert_eq!(virtual_ip(0x0a000001), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(circuit_id_from_virtual_ip(Ipv4Addr::new(1, 2, 3, 4)), 0x01020304);
    }

    #[test]
    fn test_socks_hops_for_rendezvous() {
        let mut circuit = test_circuit(3);
        assert_eq!(circuit.socks_hops(), 3);
        circuit.ctype = CircuitType::Rendezvous;
        assert_eq!(circuit.socks_hops(), 2);
    }
}
