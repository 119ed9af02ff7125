use crate::circuit::{CircuitId, CircuitType};
use crate::protocol::Address;
use anontunnel_common::InfoHash;
use std::fmt;
use std::net::{SocketAddr, SocketAddrV4};
use std::time::Duration;

/// Work the community hands to its host
///
/// The community never touches a socket; everything it wants done on the
/// network, the DHT or the torrent client comes out as one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelAction {
    /// Overlay datagram to a neighbour
    Send { to: SocketAddr, packet: Vec<u8> },

    /// Datagram out of the exit socket of `circuit_id`
    ExitSend {
        circuit_id: CircuitId,
        destination: Address,
        payload: Vec<u8>,
    },

    /// Close the exit socket of `circuit_id`, if one was opened
    ExitClose { circuit_id: CircuitId },

    /// Datagram that came out of a circuit, for the SOCKS5 session serving `hops`
    Deliver {
        hops: usize,
        circuit_id: CircuitId,
        origin: Address,
        payload: Vec<u8>,
    },

    /// Look up peers on behalf of the originator of `circuit_id`
    DhtLookup {
        circuit_id: CircuitId,
        identifier: u16,
        info_hash: InfoHash,
    },

    DhtAnnounce { info_hash: InfoHash },

    /// Hand a peer to the download with this (real) info hash
    AddPeer {
        info_hash: InfoHash,
        peer: SocketAddrV4,
    },

    CircuitReady {
        circuit_id: CircuitId,
        ctype: CircuitType,
    },

    CircuitRemoved {
        circuit_id: CircuitId,
        reason: RemovalReason,
    },

    /// A ping we sent on `circuit_id` came back
    Pong { circuit_id: CircuitId, rtt: Duration },
}

/// Why a circuit, relay or exit went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    PingTimeout,
    TooOld,
    NoCandidates,
    Inactive,
    Traffic,
    Crypto,
    Timeout,
    Flooded,
    StoppedSeeding,
    Unload,

    /// Peer-sent destroy with its reason code
    Destroyed(u16),
}

impl RemovalReason {
    /// Code carried in the destroy cell we send
    pub fn wire_code(&self) -> u16 {
        match self {
            Self::Destroyed(code) => *code,
            _ => 0,
        }
    }
}

impl fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PingTimeout => f.write_str("ping timeout"),
            Self::TooOld => f.write_str("too old"),
            Self::NoCandidates => f.write_str("no candidates to extend"),
            Self::Inactive => f.write_str("inactive"),
            Self::Traffic => f.write_str("traffic"),
            Self::Crypto => f.write_str("crypto"),
            Self::Timeout => f.write_str("timeout"),
            Self::Flooded => f.write_str("too many packets without reply"),
            Self::StoppedSeeding => f.write_str("stopped seeding"),
            Self::Unload => f.write_str("unload"),
            Self::Destroyed(code) => write!(f, "destroyed ({})", code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_strings() {
        assert_eq!(RemovalReason::PingTimeout.to_string(), "ping timeout");
        assert_eq!(RemovalReason::NoCandidates.to_string(), "no candidates to extend");
        assert_eq!(RemovalReason::Destroyed(3).to_string(), "destroyed (3)");
        assert_eq!(RemovalReason::TooOld.wire_code(), 0);
        assert_eq!(RemovalReason::Destroyed(3).wire_code(), 3);
    }
}
