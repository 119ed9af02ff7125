//! Incoming cell routing and the circuit-building message handlers

use super::action::{RemovalReason, TunnelAction};
use super::cache::{CacheCategory, CacheEntry};
use super::community::{end_to_end_direction, TunnelCommunity};
use crate::circuit::{
    respond_to_handshake, virtual_ip, Circuit, CircuitId, CryptoError, DhSecret, EgressDecision,
    ExitSocket, Hop, KeyDirection, PathSelectionCriteria, PathSelector, RelayDirection,
};
use crate::identity::{NodeId, PublicKey};
use crate::protocol::{
    decode_candidate_list, encode_candidate_list, filter, to_ipv4, Address, Cell, CreateMessage,
    CreatedMessage, DataMessage, DestroyMessage, ExtendMessage, Message, MessageType,
    PingMessage, COMMUNITY_PREFIX,
};
use anontunnel_common::{protocol, Result, TunnelError};
use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4};
use tracing::{debug, info, warn};

/// Our position on the circuit a decrypted cell arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Originator,
    Exit,
}

impl TunnelCommunity {
    /// Overlay datagram from a neighbour
    pub fn on_packet(&mut self, from: SocketAddr, packet: &[u8]) {
        let cell = match Cell::from_wire(packet) {
            Ok(cell) => cell,
            Err(e) => {
                debug!("Dropping malformed packet from {}: {}", from, e);
                return;
            }
        };

        let circuit_id = cell.circuit_id;
        let message_type = cell.message_type;
        if let Err(e) = self.handle_cell(from, cell) {
            debug!(
                "Dropped {} on circuit {} from {}: {}",
                message_type, circuit_id, from, e
            );
        }
    }

    fn handle_cell(&mut self, from: SocketAddr, cell: Cell) -> Result<()> {
        let circuit_id = cell.circuit_id;

        if cell.is_plain() {
            let message = Message::decode(cell.message_type, &cell.body)?;
            return self.handle_plain_message(from, message);
        }

        match cell.message_type {
            MessageType::Create => {
                let Message::Create(create) = Message::decode(cell.message_type, &cell.body)? else {
                    return Err(TunnelError::malformed("expected create"));
                };
                return self.handle_create(from, circuit_id, create);
            }
            MessageType::Created => {
                let Message::Created(created) = Message::decode(cell.message_type, &cell.body)?
                else {
                    return Err(TunnelError::malformed("expected created"));
                };
                return if self.relays.contains(&circuit_id) {
                    self.handle_created_as_relay(from, circuit_id, created)
                } else {
                    self.handle_created(from, circuit_id, created)
                };
            }
            MessageType::Destroy => {
                let Message::Destroy(destroy) = Message::decode(cell.message_type, &cell.body)?
                else {
                    return Err(TunnelError::malformed("expected destroy"));
                };
                self.handle_destroy(from, circuit_id, destroy);
                return Ok(());
            }
            _ => {}
        }

        if self.relays.contains(&circuit_id) && !self.waiting_for.contains(&circuit_id) {
            return self.relay_cell(from, cell);
        }

        let (role, plaintext) = self.unwrap_layers(from, &cell)?;
        let message = Message::decode(cell.message_type, &plaintext)?;
        self.handle_message(from, circuit_id, role, message)
    }

    /// Peel the layers of a cell on a circuit we originate or terminate
    fn unwrap_layers(&mut self, from: SocketAddr, cell: &Cell) -> Result<(Role, Vec<u8>)> {
        let circuit_id = cell.circuit_id;
        let now = self.now();

        if let Some(circuit) = self.circuits.get_mut(&circuit_id) {
            if circuit.first_hop != from {
                return Err(TunnelError::protocol(format!(
                    "cell for circuit {} from {} instead of first hop",
                    circuit_id, from
                )));
            }

            return match peel_backward(circuit, cell) {
                Ok(data) => {
                    circuit.beat_heart(now);
                    circuit.add_received(cell.body.len() as u64);
                    Ok((Role::Originator, data))
                }
                Err(e) => {
                    self.remove_circuit(circuit_id, RemovalReason::Crypto, true);
                    Err(e.into())
                }
            };
        }

        if let Some(exit) = self.exit_sockets.get_mut(&circuit_id) {
            if exit.sock_addr != from {
                return Err(TunnelError::protocol(format!(
                    "cell for exit {} from {} instead of {}",
                    circuit_id, from, exit.sock_addr
                )));
            }
            exit.beat_heart(now);

            let keys = self
                .relay_session_keys
                .get_mut(&circuit_id)
                .ok_or(CryptoError::MissingKeys)?;
            let data = keys.decrypt(KeyDirection::Forward, &cell.body)?;
            return Ok((Role::Exit, data));
        }

        Err(TunnelError::CircuitNotFound(circuit_id))
    }

    /// Move a cell one hop along a relayed flow, applying exactly one layer
    fn relay_cell(&mut self, from: SocketAddr, cell: Cell) -> Result<()> {
        let circuit_id = cell.circuit_id;
        if self.relays.neighbour(&circuit_id) != Some(from) {
            return Err(TunnelError::protocol(format!(
                "relay cell on {} from unexpected peer {}",
                circuit_id, from
            )));
        }
        let route = self
            .relays
            .get(&circuit_id)
            .cloned()
            .ok_or(TunnelError::CircuitNotFound(circuit_id))?;

        if route.rendezvous_relay && cell.message_type == MessageType::Ping {
            return self.answer_spliced_ping(from, &cell);
        }

        let body = if route.rendezvous_relay {
            let plain = self
                .relay_session_keys
                .get_mut(&circuit_id)
                .ok_or(CryptoError::MissingKeys)?
                .decrypt(KeyDirection::Forward, &cell.body)?;
            self.relay_session_keys
                .get_mut(&route.circuit_id)
                .ok_or(CryptoError::MissingKeys)?
                .encrypt(KeyDirection::Backward, &plain)?
        } else {
            let keys = self
                .relay_session_keys
                .get_mut(&circuit_id)
                .ok_or(CryptoError::MissingKeys)?;
            match route.direction {
                RelayDirection::ExitBound => keys.decrypt(KeyDirection::Forward, &cell.body)?,
                RelayDirection::OriginBound => keys.encrypt(KeyDirection::Backward, &cell.body)?,
            }
        };

        let now = self.now();
        if let Some(incoming) = self.relays.get_mut(&circuit_id) {
            incoming.beat_heart(now);
            incoming.bytes_down += cell.body.len() as u64;
        }
        if let Some(outgoing) = self.relays.get_mut(&route.circuit_id) {
            outgoing.beat_heart(now);
            outgoing.bytes_up += body.len() as u64;
        }

        let packet = Cell::new(route.circuit_id, cell.message_type, body).to_wire();
        self.push_action(TunnelAction::Send {
            to: route.peer,
            packet,
        });
        Ok(())
    }

    /// Pings on a spliced circuit end here: the other side holds no hop
    /// keys for them
    fn answer_spliced_ping(&mut self, from: SocketAddr, cell: &Cell) -> Result<()> {
        let circuit_id = cell.circuit_id;
        let keys = self
            .relay_session_keys
            .get_mut(&circuit_id)
            .ok_or(CryptoError::MissingKeys)?;
        let plain = keys.decrypt(KeyDirection::Forward, &cell.body)?;
        let Message::Ping(ping) = Message::decode(MessageType::Ping, &plain)? else {
            return Err(TunnelError::malformed("expected ping"));
        };
        let pong = Message::Pong(PingMessage {
            circuit_id,
            identifier: ping.identifier,
        });
        let body = keys.encrypt(KeyDirection::Backward, &pong.encode())?;

        let now = self.now();
        if let Some(route) = self.relays.get_mut(&circuit_id) {
            route.beat_heart(now);
        }
        let packet = Cell::new(circuit_id, MessageType::Pong, body).to_wire();
        self.push_action(TunnelAction::Send { to: from, packet });
        Ok(())
    }

    fn handle_message(
        &mut self,
        from: SocketAddr,
        circuit_id: CircuitId,
        role: Role,
        message: Message,
    ) -> Result<()> {
        match (role, message) {
            (Role::Exit, Message::Extend(extend)) => self.handle_extend(from, circuit_id, extend),
            (Role::Originator, Message::Extended(extended)) => {
                self.handle_extended(circuit_id, extended)
            }
            (Role::Exit, Message::Ping(ping)) => {
                let pong = Message::Pong(PingMessage {
                    circuit_id,
                    identifier: ping.identifier,
                });
                self.send_backward(circuit_id, &pong)
            }
            (Role::Originator, Message::Pong(pong)) => self.handle_pong(circuit_id, pong),
            (Role::Exit, Message::Data(data)) => self.handle_data_at_exit(circuit_id, data),
            (Role::Originator, Message::Data(data)) => {
                self.handle_data_at_origin(circuit_id, data)
            }
            (role, message) => self.handle_hidden_message(circuit_id, role, message),
        }
    }

    // ------------------------------------------------------------------
    // Create / created / extend / extended
    // ------------------------------------------------------------------

    fn handle_create(
        &mut self,
        from: SocketAddr,
        circuit_id: CircuitId,
        create: CreateMessage,
    ) -> Result<()> {
        if create.node_public_key != self.public_key() || create.node_id != self.identity.node_id() {
            return Err(TunnelError::protocol("create addressed to another node"));
        }
        if circuit_id == 0 || self.exit_sockets.contains_key(&circuit_id) || self.relays.contains(&circuit_id) {
            return Err(TunnelError::protocol(format!("circuit id {} in use", circuit_id)));
        }
        if self.relays.len() + self.exit_sockets.len() >= self.settings.max_relays_or_exits {
            info!("Too many relays/exits, refusing create from {}", from);
            return Err(TunnelError::AdmissionRejected(from.to_string()));
        }

        let response = respond_to_handshake(&create.key, self.identity.keypair())?;
        let mut keys = response.keys;

        let own_key = self.public_key();
        let offered = PathSelector::sample_candidates(
            &self.candidates.candidates(),
            &PathSelectionCriteria::new().exclude_key(own_key),
            protocol::MAX_CANDIDATES_IN_CREATED,
        );
        let public_keys: Vec<_> = offered.iter().map(|c| c.public_key).collect();
        let candidate_list_enc = keys.encrypt(KeyDirection::Backward, &encode_candidate_list(&public_keys))?;
        let candidates: HashMap<_, _> = offered
            .into_iter()
            .map(|c| (c.public_key, c.address))
            .collect();

        let now = self.now();
        self.cache.add(
            circuit_id,
            CacheEntry::Created {
                circuit_id,
                candidates,
            },
            now,
            protocol::CREATED_CACHE_TIMEOUT,
        );
        self.relay_session_keys.insert(circuit_id, keys);
        self.exit_sockets
            .insert(circuit_id, ExitSocket::new(circuit_id, from, now));

        debug!("Accepted create for circuit {} from {}", circuit_id, from);
        let created = Message::Created(CreatedMessage {
            circuit_id,
            key: response.public,
            auth: response.auth,
            candidate_list_enc,
        });
        self.send_cleartext(from, circuit_id, &created);
        Ok(())
    }

    fn handle_created(
        &mut self,
        from: SocketAddr,
        circuit_id: CircuitId,
        created: CreatedMessage,
    ) -> Result<()> {
        let first_hop = self
            .circuits
            .get(&circuit_id)
            .map(|c| c.first_hop)
            .ok_or(TunnelError::CircuitNotFound(circuit_id))?;
        if first_hop != from || !self.waiting_for.contains(&circuit_id) {
            return Err(TunnelError::CacheMiss(format!("created for {}", circuit_id)));
        }
        self.cache
            .pop(CacheCategory::Circuit, circuit_id)
            .ok_or_else(|| TunnelError::CacheMiss(format!("created for {}", circuit_id)))?;
        self.waiting_for.remove(&circuit_id);

        self.complete_extension(circuit_id, created)
    }

    fn handle_extended(&mut self, circuit_id: CircuitId, extended: CreatedMessage) -> Result<()> {
        self.cache
            .pop(CacheCategory::Circuit, circuit_id)
            .ok_or_else(|| TunnelError::CacheMiss(format!("extended for {}", circuit_id)))?;
        self.complete_extension(circuit_id, extended)
    }

    /// Verify the pending hop, install its keys and either extend further
    /// or declare the circuit ready
    fn complete_extension(&mut self, circuit_id: CircuitId, reply: CreatedMessage) -> Result<()> {
        let now = self.now();
        let circuit = self
            .circuits
            .get_mut(&circuit_id)
            .ok_or(TunnelError::CircuitNotFound(circuit_id))?;
        let Some(mut hop) = circuit.unverified_hop.take() else {
            return Err(TunnelError::CacheMiss(format!("no pending hop on {}", circuit_id)));
        };

        let offered = match verify_hop(&mut hop, &reply) {
            Ok(offered) => offered,
            Err(e) => {
                warn!("Handshake with hop of circuit {} failed: {}", circuit_id, e);
                self.remove_circuit(circuit_id, RemovalReason::Crypto, true);
                return Err(e);
            }
        };

        circuit.add_hop(hop);
        circuit.beat_heart(now);
        debug!(
            "Circuit {} now has {}/{} hops",
            circuit_id,
            circuit.hops.len(),
            circuit.goal_hops
        );

        if circuit.hops.len() < circuit.goal_hops {
            self.extend_circuit(circuit_id, offered)
        } else {
            self.circuit_ready(circuit_id);
            Ok(())
        }
    }

    fn extend_circuit(&mut self, circuit_id: CircuitId, offered: Vec<PublicKey>) -> Result<()> {
        let own_key = self.public_key();
        let circuit = self
            .circuits
            .get(&circuit_id)
            .ok_or(TunnelError::CircuitNotFound(circuit_id))?;

        let next_is_last = circuit.hops.len() + 1 == circuit.goal_hops;
        let target = match (&circuit.required_exit, next_is_last) {
            (Some(exit), true) => Some((exit.public_key, to_ipv4(&exit.address))),
            (required_exit, _) => {
                let mut criteria = PathSelectionCriteria::new()
                    .exclude_key(own_key)
                    .exclude_keys(circuit.used_public_keys());
                if let Some(exit) = required_exit {
                    criteria = criteria.exclude_key(exit.public_key);
                }
                PathSelector::select_extension(&offered, &criteria).map(|key| {
                    let known = self
                        .candidates
                        .find_by_key(&key)
                        .and_then(|c| to_ipv4(&c.address));
                    (key, known)
                })
            }
        };

        let Some((public_key, node_addr)) = target else {
            info!("No candidates to extend circuit {}", circuit_id);
            self.remove_circuit(circuit_id, RemovalReason::NoCandidates, true);
            return Ok(());
        };

        let dh_secret = DhSecret::generate();
        let key = dh_secret.public();
        let hop = Hop::new(public_key, node_addr.map(SocketAddr::V4), dh_secret);
        let node_id = hop.node_id;

        if let Some(circuit) = self.circuits.get_mut(&circuit_id) {
            circuit.unverified_hop = Some(hop);
        }
        let now = self.now();
        self.cache.add(
            circuit_id,
            CacheEntry::Circuit { circuit_id },
            now,
            protocol::CIRCUIT_REQUEST_TIMEOUT,
        );

        debug!("Extending circuit {} to {}", circuit_id, public_key);
        let extend = Message::Extend(ExtendMessage {
            circuit_id,
            node_id,
            node_public_key: public_key,
            key,
            node_addr,
        });
        self.send_cell(circuit_id, &extend)
    }

    /// We are the last hop and the originator wants one more
    fn handle_extend(&mut self, from: SocketAddr, circuit_id: CircuitId, extend: ExtendMessage) -> Result<()> {
        let Some(CacheEntry::Created { candidates, .. }) =
            self.cache.pop(CacheCategory::Created, circuit_id)
        else {
            return Err(TunnelError::CacheMiss(format!("extend for {}", circuit_id)));
        };

        let target = candidates
            .get(&extend.node_public_key)
            .copied()
            .or_else(|| {
                self.candidates
                    .find_by_key(&extend.node_public_key)
                    .map(|c| c.address)
            })
            .or(extend.node_addr.map(SocketAddr::V4))
            .ok_or_else(|| TunnelError::protocol("extend target unknown"))?;

        let new_id = self.allocate_circuit_id();
        let now = self.now();
        let keys = self
            .relay_session_keys
            .get(&circuit_id)
            .cloned()
            .ok_or(CryptoError::MissingKeys)?;

        self.relays.link((circuit_id, from), (new_id, target), false, now);
        self.relay_session_keys.insert(new_id, keys);
        if let Some(exit) = self.exit_sockets.remove(&circuit_id) {
            if exit.enabled {
                self.push_action(TunnelAction::ExitClose { circuit_id });
            }
        }
        self.waiting_for.insert(new_id);

        info!(
            "Relaying circuit {} from {} as {} to {}",
            circuit_id, from, new_id, target
        );
        let create = Message::Create(CreateMessage {
            circuit_id: new_id,
            node_id: NodeId::from_public_key(&extend.node_public_key),
            node_public_key: extend.node_public_key,
            key: extend.key,
        });
        self.send_cleartext(target, new_id, &create);
        Ok(())
    }

    /// The next hop answered our create; pass it back as extended
    fn handle_created_as_relay(
        &mut self,
        from: SocketAddr,
        circuit_id: CircuitId,
        created: CreatedMessage,
    ) -> Result<()> {
        if !self.waiting_for.contains(&circuit_id) || self.relays.neighbour(&circuit_id) != Some(from) {
            return Err(TunnelError::CacheMiss(format!("created for relay {}", circuit_id)));
        }
        self.waiting_for.remove(&circuit_id);

        let route = self
            .relays
            .get(&circuit_id)
            .cloned()
            .ok_or(TunnelError::CircuitNotFound(circuit_id))?;
        let extended = Message::Extended(CreatedMessage {
            circuit_id: route.circuit_id,
            ..created
        });
        let body = self
            .relay_session_keys
            .get_mut(&circuit_id)
            .ok_or(CryptoError::MissingKeys)?
            .encrypt(KeyDirection::Backward, &extended.encode())?;

        let packet = Cell::new(route.circuit_id, MessageType::Extended, body).to_wire();
        self.push_action(TunnelAction::Send {
            to: route.peer,
            packet,
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Destroy / ping
    // ------------------------------------------------------------------

    fn handle_destroy(&mut self, from: SocketAddr, circuit_id: CircuitId, destroy: DestroyMessage) {
        let reason = RemovalReason::Destroyed(destroy.reason);

        if let Some(circuit) = self.circuits.get(&circuit_id) {
            if circuit.first_hop == from {
                self.remove_circuit(circuit_id, reason, false);
            } else {
                warn!("Ignoring destroy for circuit {} from {}", circuit_id, from);
            }
        } else if self.relays.contains(&circuit_id) {
            if self.relays.neighbour(&circuit_id) != Some(from) {
                warn!("Ignoring destroy for relay {} from {}", circuit_id, from);
                return;
            }
            if let Some(route) = self.relays.get(&circuit_id).cloned() {
                let forward = Message::Destroy(DestroyMessage {
                    circuit_id: route.circuit_id,
                    reason: destroy.reason,
                });
                self.send_cleartext(route.peer, route.circuit_id, &forward);
            }
            self.remove_relay(circuit_id, reason, false);
        } else if let Some(exit) = self.exit_sockets.get(&circuit_id) {
            if exit.sock_addr == from {
                self.remove_exit_socket(circuit_id, reason, false);
            } else {
                warn!("Ignoring destroy for exit {} from {}", circuit_id, from);
            }
        }
    }

    fn handle_pong(&mut self, circuit_id: CircuitId, pong: PingMessage) -> Result<()> {
        let key = pong.identifier as u32;
        let ours = matches!(
            self.cache.get(CacheCategory::Ping, key),
            Some(CacheEntry::Ping { circuit_id: pinged }) if *pinged == circuit_id
        );
        if !ours {
            return Err(TunnelError::CacheMiss(format!("pong on {}", circuit_id)));
        }
        let now = self.now();
        let rtt = self
            .cache
            .deadline(CacheCategory::Ping, key)
            .map(|deadline| (now + protocol::PING_TIMEOUT).saturating_duration_since(deadline))
            .unwrap_or_default();
        self.cache.pop(CacheCategory::Ping, key);
        debug!("Pong on circuit {} after {:?}", circuit_id, rtt);
        self.push_action(TunnelAction::Pong { circuit_id, rtt });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Data
    // ------------------------------------------------------------------

    fn handle_data_at_exit(&mut self, circuit_id: CircuitId, data: DataMessage) -> Result<()> {
        if !self.settings.become_exitnode && !filter::looks_like_overlay(&data.payload) {
            return Err(TunnelError::protocol("not an exit node"));
        }

        let max = self.settings.max_packets_without_reply;
        let exit = self
            .exit_sockets
            .get_mut(&circuit_id)
            .ok_or(TunnelError::CircuitNotFound(circuit_id))?;

        match exit.check_outgoing(&data.destination, &data.payload, max) {
            EgressDecision::Send => {
                self.push_action(TunnelAction::ExitSend {
                    circuit_id,
                    destination: data.destination,
                    payload: data.payload,
                });
                Ok(())
            }
            EgressDecision::Filtered => Err(TunnelError::protocol(format!(
                "payload to {} blocked by egress filter",
                data.destination
            ))),
            EgressDecision::Flooded => {
                warn!(
                    "Exit {} sent too many packets to {} without reply",
                    circuit_id, data.destination
                );
                self.remove_exit_socket(circuit_id, RemovalReason::Flooded, true);
                Ok(())
            }
            EgressDecision::TooManyDestinations => {
                debug!(
                    "Exit {} tracks too many unanswered destinations, dropping datagram to {}",
                    circuit_id, data.destination
                );
                Ok(())
            }
        }
    }

    fn handle_data_at_origin(&mut self, circuit_id: CircuitId, data: DataMessage) -> Result<()> {
        if data.payload.starts_with(&COMMUNITY_PREFIX) {
            let from = data
                .origin
                .as_socket_addr()
                .ok_or_else(|| TunnelError::InvalidAddress(data.origin.to_string()))?;
            let cell = Cell::decode(&data.payload)?;
            if !cell.is_plain() {
                return Err(TunnelError::protocol("tunnelled cell is not plain"));
            }
            let message = Message::decode(cell.message_type, &cell.body)?;
            return self.handle_plain_message(from, message);
        }

        let circuit = self
            .circuits
            .get(&circuit_id)
            .ok_or(TunnelError::CircuitNotFound(circuit_id))?;
        let origin = if circuit.ctype.is_hidden_link() {
            Address::Ipv4(SocketAddrV4::new(
                virtual_ip(circuit_id),
                protocol::CIRCUIT_ID_PORT,
            ))
        } else {
            data.origin
        };

        let hops = circuit.socks_hops();
        self.push_action(TunnelAction::Deliver {
            hops,
            circuit_id,
            origin,
            payload: data.payload,
        });
        Ok(())
    }
}

/// Remove every hop layer of a backward cell, then the end-to-end layer
/// if the circuit is a hidden link
fn peel_backward(circuit: &mut Circuit, cell: &Cell) -> std::result::Result<Vec<u8>, CryptoError> {
    let mut data = cell.body.clone();
    for hop in circuit.hops.iter_mut() {
        let keys = hop.session_keys.as_mut().ok_or(CryptoError::MissingKeys)?;
        data = keys.decrypt(KeyDirection::Backward, &data)?;
    }
    if cell.message_type == MessageType::Data && circuit.ctype.is_hidden_link() {
        let direction = end_to_end_direction(circuit.ctype, false);
        let keys = circuit
            .hs_session_keys
            .as_mut()
            .ok_or(CryptoError::MissingKeys)?;
        data = keys.decrypt(direction, &data)?;
    }
    Ok(data)
}

/// Check a hop's created/extended reply and install its session keys;
/// returns the candidate keys the hop offered for the next extension
fn verify_hop(hop: &mut Hop, reply: &CreatedMessage) -> Result<Vec<PublicKey>> {
    let dh_secret = hop.dh_secret.take().ok_or(CryptoError::MissingKeys)?;
    let mut keys = dh_secret.verify_and_derive(&reply.key, &reply.auth, &hop.public_key)?;
    let list = keys.decrypt(KeyDirection::Backward, &reply.candidate_list_enc)?;
    let offered = decode_candidate_list(&list)?;
    hop.session_keys = Some(keys);
    Ok(offered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::harness::TestNetwork;
    use crate::tunnel::CircuitRequest;
    use anontunnel_common::TunnelSettings;
    use std::time::Duration;

    fn settings() -> TunnelSettings {
        TunnelSettings::default()
            .with_circuit_length(1)
            .with_max_circuits(1)
            .with_exitnode(true)
    }

    /// Shaped like a UDP tracker connect request, so the exit lets it out
    fn tracker_packet(tag: u8) -> Vec<u8> {
        let mut packet = vec![0u8; 16];
        packet[15] = tag;
        packet
    }

    fn ready_circuit(network: &mut TestNetwork, node: usize, hops: usize) -> CircuitId {
        let circuit_id = network.nodes[node]
            .create_circuit(CircuitRequest::data(hops))
            .expect("first hop available");
        network.pump();
        assert!(network.nodes[node].circuit(circuit_id).unwrap().is_ready());
        circuit_id
    }

    #[test]
    fn test_one_hop_udp_echo() {
        let mut network = TestNetwork::new(2, settings());
        network.introduce(0, 1);
        let circuit_id = ready_circuit(&mut network, 0, 1);
        assert!(network.events_of(0).any(|a| matches!(
            a,
            TunnelAction::CircuitReady { circuit_id: id, .. } if *id == circuit_id
        )));

        let echo = SocketAddrV4::new([203, 0, 113, 5].into(), 7);
        network.echo_servers.insert(SocketAddr::V4(echo));

        let payload = tracker_packet(1);
        assert!(network.nodes[0].send_socks_datagram(1, Address::Ipv4(echo), payload.clone()));
        network.pump();

        assert!(network.events_of(1).any(|a| matches!(
            a,
            TunnelAction::ExitSend { destination, .. } if *destination == Address::Ipv4(echo)
        )));
        let delivered = TunnelAction::Deliver {
            hops: 1,
            circuit_id,
            origin: Address::Ipv4(echo),
            payload: payload.clone(),
        };
        assert!(network.events_of(0).any(|a| *a == delivered));

        let circuit = network.nodes[0].circuit(circuit_id).unwrap();
        assert!(circuit.bytes_up >= payload.len() as u64);
        assert!(circuit.bytes_down >= payload.len() as u64);

        let exit = network.nodes[1].exit_socket(circuit_id).unwrap();
        assert!(exit.enabled);
        assert_eq!(exit.pending_count(&Address::Ipv4(echo)), Some(-1));
    }

    #[test]
    fn test_non_exit_node_drops_clearnet_data() {
        let mut network = TestNetwork::new(2, settings().with_exitnode(false));
        network.introduce(0, 1);
        ready_circuit(&mut network, 0, 1);

        let echo = SocketAddrV4::new([203, 0, 113, 5].into(), 7);
        network.echo_servers.insert(SocketAddr::V4(echo));
        assert!(network.nodes[0].send_socks_datagram(1, Address::Ipv4(echo), tracker_packet(1)));
        network.pump();

        assert!(!network
            .events_of(1)
            .any(|a| matches!(a, TunnelAction::ExitSend { .. })));
        assert!(!network
            .events_of(0)
            .any(|a| matches!(a, TunnelAction::Deliver { .. })));
    }

    #[test]
    fn test_filtered_payload_never_leaves_exit() {
        let mut network = TestNetwork::new(2, settings());
        network.introduce(0, 1);
        ready_circuit(&mut network, 0, 1);

        let echo = SocketAddrV4::new([203, 0, 113, 5].into(), 7);
        network.echo_servers.insert(SocketAddr::V4(echo));
        network.nodes[0].send_socks_datagram(1, Address::Ipv4(echo), vec![0xab; 3]);
        network.pump();

        assert!(!network
            .events_of(1)
            .any(|a| matches!(a, TunnelAction::ExitSend { .. })));
    }

    #[test]
    fn test_extension_without_candidates_destroys_circuit() {
        let mut network = TestNetwork::new(2, settings());
        network.introduce(0, 1);
        // the first hop only knows the originator
        network.introduce(1, 0);

        let circuit_id = network.nodes[0]
            .create_circuit(CircuitRequest::data(2))
            .unwrap();
        network.pump();

        assert!(network.nodes[0].circuit(circuit_id).is_none());
        assert!(network.events_of(0).any(|a| *a
            == TunnelAction::CircuitRemoved {
                circuit_id,
                reason: RemovalReason::NoCandidates,
            }));
        let first_hop = network.address(1);
        assert_eq!(
            network.sent_types(0, first_hop),
            vec![MessageType::Create, MessageType::Destroy]
        );
        assert_eq!(network.nodes[1].exit_sockets().count(), 0);
    }

    #[test]
    fn test_two_hop_circuit_and_destroy_propagation() {
        let mut network = TestNetwork::new(3, settings());
        network.introduce(0, 1);
        network.introduce(1, 2);
        let circuit_id = ready_circuit(&mut network, 0, 2);

        let relays = network.nodes[1].relays();
        assert_eq!(relays.len(), 2);
        let outgoing = relays.get(&circuit_id).unwrap().circuit_id;
        assert_eq!(relays.get(&outgoing).unwrap().circuit_id, circuit_id);
        assert!(network.nodes[2].exit_socket(outgoing).is_some());

        network.nodes[0].remove_circuit(circuit_id, RemovalReason::Unload, true);
        network.pump();

        assert!(network.nodes[1].relays().is_empty());
        assert!(network.nodes[2].exit_socket(outgoing).is_none());

        let (_, _, forwarded) = network
            .sent
            .iter()
            .find(|(node, to, cell)| {
                *node == 1 && *to == network.address(2) && cell.message_type == MessageType::Destroy
            })
            .expect("relay forwards the destroy");
        assert_eq!(forwarded.circuit_id, outgoing);
        let Message::Destroy(destroy) = Message::decode(MessageType::Destroy, &forwarded.body).unwrap()
        else {
            panic!("expected destroy");
        };
        assert_eq!(destroy.reason, 0);
    }

    #[test]
    fn test_unload_at_relay_tears_down_both_sides() {
        let mut network = TestNetwork::new(3, settings());
        network.introduce(0, 1);
        network.introduce(1, 2);
        let circuit_id = ready_circuit(&mut network, 0, 2);

        network.nodes[1].unload();
        network.pump();

        assert!(network.nodes[1].relays().is_empty());
        assert!(network.nodes[0].circuit(circuit_id).is_none());
        assert_eq!(network.nodes[2].exit_sockets().count(), 0);
    }

    #[test]
    fn test_destroy_from_wrong_peer_is_ignored() {
        let mut network = TestNetwork::new(3, settings());
        network.introduce(0, 1);
        network.introduce(1, 2);
        let circuit_id = ready_circuit(&mut network, 0, 2);
        let outgoing = network.nodes[1].relays().get(&circuit_id).unwrap().circuit_id;

        let forged = Cell::new(
            outgoing,
            MessageType::Destroy,
            Message::Destroy(DestroyMessage {
                circuit_id: outgoing,
                reason: 0,
            })
            .encode(),
        );
        let intruder = network.address(0);
        network.nodes[2].on_packet(intruder, &forged.to_wire());
        assert!(network.nodes[2].exit_socket(outgoing).is_some());

        let forged = Cell::new(
            circuit_id,
            MessageType::Destroy,
            Message::Destroy(DestroyMessage {
                circuit_id,
                reason: 0,
            })
            .encode(),
        );
        let wrong_side = network.address(2);
        network.nodes[1].on_packet(wrong_side, &forged.to_wire());
        assert_eq!(network.nodes[1].relays().len(), 2);
    }

    #[test]
    fn test_pong_keeps_circuit_alive() {
        let mut network = TestNetwork::new(2, settings());
        network.introduce(0, 1);
        let circuit_id = ready_circuit(&mut network, 0, 1);

        network.nodes[0].do_ping();
        network.pump();
        assert!(network.nodes[0].cache.is_empty());
        assert!(network
            .events_of(0)
            .any(|a| matches!(a, TunnelAction::Pong { circuit_id: id, .. } if *id == circuit_id)));

        network.clock.advance(protocol::PING_TIMEOUT * 2);
        network.nodes[0].tick();
        assert!(network.nodes[0].circuit(circuit_id).is_some());
    }

    #[test]
    fn test_unanswered_pings_remove_circuit() {
        let mut inactive_tolerant = settings();
        inactive_tolerant.max_time_inactive = 1_000;
        let mut network = TestNetwork::new(2, inactive_tolerant);
        network.introduce(0, 1);
        let circuit_id = ready_circuit(&mut network, 0, 1);
        let first_hop = network.address(1);
        network.blackholed.insert(first_hop);

        for _ in 0..3 {
            network.clock.advance(protocol::PING_INTERVAL);
            network.nodes[0].do_ping();
            network.nodes[0].tick();
            network.pump();
        }
        network.clock.advance(protocol::PING_INTERVAL / 2 + Duration::from_millis(1));
        network.nodes[0].tick();
        network.pump();

        assert!(network.nodes[0].circuit(circuit_id).is_none());
        assert!(network.events_of(0).any(|a| *a
            == TunnelAction::CircuitRemoved {
                circuit_id,
                reason: RemovalReason::PingTimeout,
            }));
        assert_eq!(
            network.sent_types(0, first_hop).last(),
            Some(&MessageType::Destroy)
        );
    }

    #[test]
    fn test_old_circuit_is_removed() {
        let mut network = TestNetwork::new(2, settings());
        network.introduce(0, 1);
        let circuit_id = ready_circuit(&mut network, 0, 1);

        let max_time = network.nodes[0].settings().max_time();
        network.nodes[0].age_everything(max_time + Duration::from_secs(1));
        network.nodes[0].do_remove();
        network.pump();

        assert!(network.events_of(0).any(|a| *a
            == TunnelAction::CircuitRemoved {
                circuit_id,
                reason: RemovalReason::TooOld,
            }));
        assert_eq!(
            network.sent_types(0, network.address(1)).last(),
            Some(&MessageType::Destroy)
        );
        assert!(network.nodes[1].exit_socket(circuit_id).is_none());
    }

    #[test]
    fn test_create_rejected_over_admission_cap() {
        let mut capped = settings();
        capped.max_relays_or_exits = 0;
        let mut network = TestNetwork::new(2, capped);
        network.introduce(0, 1);

        let circuit_id = network.nodes[0]
            .create_circuit(CircuitRequest::data(1))
            .unwrap();
        network.pump();

        assert!(!network.nodes[0].circuit(circuit_id).unwrap().is_ready());
        assert_eq!(network.nodes[1].exit_sockets().count(), 0);
    }

    #[test]
    fn test_tampered_created_breaks_circuit() {
        let mut network = TestNetwork::new(2, settings());
        network.introduce(0, 1);
        let circuit_id = network.nodes[0]
            .create_circuit(CircuitRequest::data(1))
            .unwrap();
        network.nodes[0].drain_actions();

        let impostor = crate::identity::KeyPair::generate();
        let response =
            respond_to_handshake(&crate::identity::KeyPair::generate().public_key(), &impostor)
                .unwrap();
        let created = Message::Created(CreatedMessage {
            circuit_id,
            key: response.public,
            auth: response.auth,
            candidate_list_enc: vec![0; 40],
        });
        let cell = Cell::new(circuit_id, MessageType::Created, created.encode());
        let first_hop = network.address(1);
        network.nodes[0].on_packet(first_hop, &cell.to_wire());

        assert!(network.nodes[0].circuit(circuit_id).is_none());
        assert!(network.nodes[0].drain_actions().contains(&TunnelAction::CircuitRemoved {
            circuit_id,
            reason: RemovalReason::Crypto,
        }));
    }
}
