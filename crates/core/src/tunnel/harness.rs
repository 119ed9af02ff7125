//! In-memory network of tunnel communities for protocol tests

use super::{ManualClock, TunnelAction, TunnelCommunity};
use crate::circuit::CircuitId;
use crate::identity::Identity;
use crate::protocol::{to_ipv4, Cell, MessageType};
use anontunnel_common::{protocol, InfoHash, TunnelSettings};
use std::collections::{HashMap, HashSet};
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;

const MAX_ROUNDS: usize = 10_000;

pub(crate) struct TestNetwork {
    pub clock: ManualClock,
    pub nodes: Vec<TunnelCommunity>,
    addresses: Vec<SocketAddr>,

    exit_addresses: HashMap<(usize, CircuitId), SocketAddr>,
    exit_owners: HashMap<SocketAddr, (usize, CircuitId)>,

    /// Clearnet hosts that send every datagram straight back
    pub echo_servers: HashSet<SocketAddr>,

    /// Addresses whose traffic silently disappears
    pub blackholed: HashSet<SocketAddr>,

    pub dht: HashMap<InfoHash, Vec<SocketAddrV4>>,

    /// Every action other than `Send`, by node
    pub events: Vec<(usize, TunnelAction)>,

    /// Every overlay datagram, by sending node
    pub sent: Vec<(usize, SocketAddr, Cell)>,
}

impl TestNetwork {
    pub fn new(count: usize, settings: TunnelSettings) -> Self {
        let clock = ManualClock::new();
        let mut nodes = Vec::with_capacity(count);
        let mut addresses = Vec::with_capacity(count);

        for i in 0..count {
            let address = SocketAddrV4::new([10, 0, 0, i as u8 + 1].into(), protocol::DEFAULT_PORT);
            let mut node = TunnelCommunity::new(
                Identity::generate(),
                settings.clone(),
                Arc::new(clock.clone()),
            );
            node.set_local_address(address);
            nodes.push(node);
            addresses.push(SocketAddr::V4(address));
        }

        Self {
            clock,
            nodes,
            addresses,
            exit_addresses: HashMap::new(),
            exit_owners: HashMap::new(),
            echo_servers: HashSet::new(),
            blackholed: HashSet::new(),
            dht: HashMap::new(),
            events: Vec::new(),
            sent: Vec::new(),
        }
    }

    pub fn address(&self, node: usize) -> SocketAddr {
        self.addresses[node]
    }

    /// `node` learns about `other`
    pub fn introduce(&mut self, node: usize, other: usize) {
        let key = self.nodes[other].public_key();
        let address = self.addresses[other];
        self.nodes[node].add_candidate(address, key);
    }

    /// Deliver queued actions until every node is quiet
    pub fn pump(&mut self) {
        for _ in 0..MAX_ROUNDS {
            let mut progressed = false;
            for i in 0..self.nodes.len() {
                let actions = self.nodes[i].drain_actions();
                progressed |= !actions.is_empty();
                for action in actions {
                    self.route(i, action);
                }
            }
            if !progressed {
                return;
            }
        }
        panic!("network did not settle");
    }

    pub fn events_of(&self, node: usize) -> impl Iterator<Item = &TunnelAction> {
        self.events
            .iter()
            .filter(move |(i, _)| *i == node)
            .map(|(_, action)| action)
    }

    /// Message types `node` sent to `to`, in order
    pub fn sent_types(&self, node: usize, to: SocketAddr) -> Vec<MessageType> {
        self.sent
            .iter()
            .filter(|(i, dest, _)| *i == node && *dest == to)
            .map(|(_, _, cell)| cell.message_type)
            .collect()
    }

    fn node_at(&self, address: &SocketAddr) -> Option<usize> {
        self.addresses.iter().position(|a| a == address)
    }

    fn exit_address(&mut self, node: usize, circuit_id: CircuitId) -> SocketAddr {
        if let Some(address) = self.exit_addresses.get(&(node, circuit_id)) {
            return *address;
        }
        let port = 10_000 + self.exit_addresses.len() as u16;
        let address = SocketAddr::from(([172, 16, node as u8, 0], port));
        self.exit_addresses.insert((node, circuit_id), address);
        self.exit_owners.insert(address, (node, circuit_id));
        address
    }

    fn route(&mut self, from: usize, action: TunnelAction) {
        let from_address = self.addresses[from];

        match action {
            TunnelAction::Send { to, packet } => {
                let cell = Cell::from_wire(&packet).expect("nodes only send valid cells");
                self.sent.push((from, to, cell));
                if self.blackholed.contains(&to) {
                    return;
                }
                if let Some(node) = self.node_at(&to) {
                    self.nodes[node].on_packet(from_address, &packet);
                } else if let Some((node, circuit_id)) = self.exit_owners.get(&to).copied() {
                    self.nodes[node].on_exit_packet(circuit_id, from_address, packet);
                }
            }
            TunnelAction::ExitSend {
                circuit_id,
                ref destination,
                ref payload,
            } => {
                let exit = self.exit_address(from, circuit_id);
                let target = destination.as_socket_addr();
                let payload = payload.clone();
                self.events.push((from, action));

                let Some(target) = target else {
                    return;
                };
                if self.blackholed.contains(&target) {
                    return;
                }
                if self.echo_servers.contains(&target) {
                    self.nodes[from].on_exit_packet(circuit_id, target, payload);
                } else if let Some(node) = self.node_at(&target) {
                    self.nodes[node].on_packet(exit, &payload);
                }
            }
            TunnelAction::DhtAnnounce { info_hash } => {
                if let Some(address) = to_ipv4(&from_address) {
                    self.dht.entry(info_hash).or_default().push(address);
                }
                self.events.push((from, action));
            }
            TunnelAction::DhtLookup {
                circuit_id,
                identifier,
                info_hash,
            } => {
                let peers = self.dht.get(&info_hash).cloned().unwrap_or_default();
                self.events.push((from, action));
                self.nodes[from].on_dht_result(circuit_id, identifier, info_hash, peers);
            }
            other => self.events.push((from, other)),
        }
    }
}
