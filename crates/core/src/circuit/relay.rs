use super::types::CircuitId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

/// Which way a relayed cell travels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayDirection {
    /// Towards the exit: peel one layer
    ExitBound,

    /// Towards the originator: add one layer
    OriginBound,
}

/// Where cells arriving on a circuit id are forwarded to
#[derive(Debug, Clone)]
pub struct RelayRoute {
    /// Id to put on the forwarded cell
    pub circuit_id: CircuitId,

    /// Neighbour the forwarded cell goes to
    pub peer: SocketAddr,

    pub direction: RelayDirection,

    /// Splice between two circuits at a rendezvous point
    pub rendezvous_relay: bool,

    pub creation_time: Instant,
    pub last_incoming: Instant,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

impl RelayRoute {
    pub fn new(
        circuit_id: CircuitId,
        peer: SocketAddr,
        direction: RelayDirection,
        rendezvous_relay: bool,
        now: Instant,
    ) -> Self {
        Self {
            circuit_id,
            peer,
            direction,
            rendezvous_relay,
            creation_time: now,
            last_incoming: now,
            bytes_up: 0,
            bytes_down: 0,
        }
    }

    pub fn beat_heart(&mut self, now: Instant) {
        self.last_incoming = now;
    }
}

/// Relay table: both halves of every relayed flow, keyed by the id cells
/// arrive on
#[derive(Debug, Default)]
pub struct RelayTable {
    routes: HashMap<CircuitId, RelayRoute>,
}

impl RelayTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `a ↔ b`: cells on `a` from `peer_a` go to `peer_b` as `b`,
    /// and the reverse
    pub fn link(
        &mut self,
        (id_a, peer_a): (CircuitId, SocketAddr),
        (id_b, peer_b): (CircuitId, SocketAddr),
        rendezvous_relay: bool,
        now: Instant,
    ) {
        let (dir_a, dir_b) = if rendezvous_relay {
            (RelayDirection::ExitBound, RelayDirection::ExitBound)
        } else {
            (RelayDirection::ExitBound, RelayDirection::OriginBound)
        };
        self.routes.insert(
            id_a,
            RelayRoute::new(id_b, peer_b, dir_a, rendezvous_relay, now),
        );
        self.routes.insert(
            id_b,
            RelayRoute::new(id_a, peer_a, dir_b, rendezvous_relay, now),
        );
    }

    pub fn get(&self, circuit_id: &CircuitId) -> Option<&RelayRoute> {
        self.routes.get(circuit_id)
    }

    pub fn get_mut(&mut self, circuit_id: &CircuitId) -> Option<&mut RelayRoute> {
        self.routes.get_mut(circuit_id)
    }

    pub fn contains(&self, circuit_id: &CircuitId) -> bool {
        self.routes.contains_key(circuit_id)
    }

    /// Neighbour on the `circuit_id` side of a flow, i.e. the only peer
    /// allowed to send cells (and destroys) on that id
    pub fn neighbour(&self, circuit_id: &CircuitId) -> Option<SocketAddr> {
        let route = self.routes.get(circuit_id)?;
        self.routes.get(&route.circuit_id).map(|mirror| mirror.peer)
    }

    /// Remove both halves of the flow `circuit_id` belongs to
    pub fn unlink(&mut self, circuit_id: &CircuitId) -> Option<(RelayRoute, Option<RelayRoute>)> {
        let route = self.routes.remove(circuit_id)?;
        let mirror = self.routes.remove(&route.circuit_id);
        Some((route, mirror))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CircuitId, &RelayRoute)> {
        self.routes.iter()
    }
}
