use super::types::CircuitId;
use crate::protocol::{filter, Address};
use anontunnel_common::protocol;
use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4};
use std::time::Instant;

/// Outcome of asking an exit socket to send a datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EgressDecision {
    Send,

    /// Payload doesn't look like any protocol we carry
    Filtered,

    /// Too many unanswered datagrams to one destination; the socket must go
    Flooded,

    /// New destination while every tracked one is still unanswered
    TooManyDestinations,
}

/// Terminal end of a circuit on this node
///
/// The UDP socket itself is owned by the host and opened on first use;
/// this is the bookkeeping that decides what may go through it.
#[derive(Debug)]
pub struct ExitSocket {
    pub circuit_id: CircuitId,

    /// Previous hop, the only peer that may use or destroy this exit
    pub sock_addr: SocketAddr,

    /// Set once the first datagram has gone out
    pub enabled: bool,

    /// Per-destination unanswered sends; -1 once a reply has been seen
    ips: HashMap<Address, i64>,

    /// Where the host resolved hostname destinations to
    resolved: HashMap<SocketAddrV4, Address>,
    max_destinations: usize,

    pub bytes_up: u64,
    pub bytes_down: u64,
    pub creation_time: Instant,
    pub last_incoming: Instant,
}

impl ExitSocket {
    pub fn new(circuit_id: CircuitId, sock_addr: SocketAddr, now: Instant) -> Self {
        Self {
            circuit_id,
            sock_addr,
            enabled: false,
            ips: HashMap::new(),
            resolved: HashMap::new(),
            max_destinations: protocol::MAX_EXIT_DESTINATIONS,
            bytes_up: 0,
            bytes_down: 0,
            creation_time: now,
            last_incoming: now,
        }
    }

    pub fn with_max_destinations(mut self, max_destinations: usize) -> Self {
        self.max_destinations = max_destinations;
        self
    }

    /// Decide whether `payload` may go to `destination`, updating the
    /// flood guard
    pub fn check_outgoing(
        &mut self,
        destination: &Address,
        payload: &[u8],
        max_packets_without_reply: i64,
    ) -> EgressDecision {
        if !filter::is_allowed(payload) {
            return EgressDecision::Filtered;
        }
        if !self.ips.contains_key(destination)
            && self.ips.len() >= self.max_destinations
            && !self.evict_answered()
        {
            return EgressDecision::TooManyDestinations;
        }

        let count = self.ips.entry(destination.clone()).or_insert(0);
        if *count >= 0 {
            *count += 1;
            if *count > max_packets_without_reply {
                return EgressDecision::Flooded;
            }
        }

        self.enabled = true;
        self.bytes_up += payload.len() as u64;
        EgressDecision::Send
    }

    /// Make room by forgetting one destination that has already replied
    fn evict_answered(&mut self) -> bool {
        let Some(answered) = self
            .ips
            .iter()
            .find(|(_, count)| **count < 0)
            .map(|(destination, _)| destination.clone())
        else {
            return false;
        };
        self.ips.remove(&answered);
        self.resolved.retain(|_, domain| *domain != answered);
        true
    }

    /// The host resolved hostname `destination` to `address`; replies from
    /// `address` count for the hostname
    pub fn record_resolved(&mut self, destination: &Address, address: SocketAddrV4) {
        if !matches!(destination, Address::Domain(..)) || !self.ips.contains_key(destination) {
            return;
        }
        if !self.resolved.contains_key(&address) && self.resolved.len() >= self.max_destinations {
            return;
        }
        self.resolved.insert(address, destination.clone());
    }

    /// A reply from `source` lifts the limit of whatever destination it
    /// answers for; sources we never sent to are not tracked
    pub fn record_incoming(&mut self, source: SocketAddr, bytes: usize) {
        if let SocketAddr::V4(v4) = source {
            if let Some(count) = self.ips.get_mut(&Address::Ipv4(v4)) {
                *count = -1;
            }
            if let Some(domain) = self.resolved.get(&v4) {
                if let Some(count) = self.ips.get_mut(domain) {
                    *count = -1;
                }
            }
        }
        self.bytes_down += bytes as u64;
    }

    pub fn tracked_destinations(&self) -> usize {
        self.ips.len()
    }

    /// Unanswered-send counter for a destination (test and stats helper)
    pub fn pending_count(&self, destination: &Address) -> Option<i64> {
        self.ips.get(destination).copied()
    }

    pub fn beat_heart(&mut self, now: Instant) {
        self.last_incoming = now;
    }
}
