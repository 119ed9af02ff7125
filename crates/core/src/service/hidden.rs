//! Hidden-service protocol on top of the tunnel community
//!
//! Covers the four roles a node can play for a hidden download: seeder,
//! introduction point, rendezvous point and downloader. Messages that are not
//! bound to a circuit travel as plain cells inside data messages and are
//! relayed by the introduction point.

use super::{
    generate_cookie, DownloadState, DownloadStatus, IntroductionCircuit, ReadyHook,
    RendezvousPoint,
};
use crate::circuit::{
    respond_to_handshake, virtual_ip, CircuitId, CircuitType, CryptoError, DhSecret,
};
use crate::identity::NodeId;
use crate::peer::Candidate;
use crate::protocol::{
    Acknowledgement, Address, Cell, CookieMessage, CreateE2eMessage, CreatedE2eMessage,
    DataMessage, DhtResponseMessage, InfoHashRequest, KeyResponseMessage, Message,
    RendezvousEstablishedMessage, RendezvousInfo,
};
use crate::tunnel::{
    end_to_end_direction, CacheCategory, CacheEntry, CircuitRequest, RemovalReason, Role,
    TunnelAction, TunnelCommunity,
};
use anontunnel_common::{protocol, InfoHash, Result, TunnelError};
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tracing::{debug, info, warn};

impl TunnelCommunity {
    // ------------------------------------------------------------------
    // Download monitoring
    // ------------------------------------------------------------------

    /// Drive introduction points, DHT lookups and key requests from the
    /// torrent client's view of its downloads
    pub fn monitor_downloads(&mut self, downloads: &[DownloadState]) {
        let now = self.now();
        let mut seeding = HashSet::new();

        for download in downloads.iter().filter(|d| d.hops > 0) {
            let info_hash = self.hidden.track_download(download.info_hash, download.hops);
            self.download_peers
                .insert(download.info_hash, download.peers.iter().copied().collect());

            match download.status {
                DownloadStatus::Seeding => {
                    seeding.insert(info_hash);
                    self.ensure_intro_circuit(info_hash, download.hops);
                }
                DownloadStatus::Downloading => {
                    let due = self
                        .hidden
                        .last_dht_lookup
                        .get(&info_hash)
                        .map_or(true, |last| now.duration_since(*last) >= self.settings.dht_lookup_interval());
                    if due {
                        self.do_dht_lookup(info_hash);
                    }
                    if let Some(intro_point) = self.hidden.pop_pex(&info_hash) {
                        self.do_key_request(info_hash, intro_point);
                    }
                }
                DownloadStatus::Stopped | DownloadStatus::Other => {}
            }
        }

        let stopped: Vec<(InfoHash, IntroductionCircuit)> = self
            .hidden
            .intro_circuits
            .iter()
            .filter(|(info_hash, _)| !seeding.contains(*info_hash))
            .map(|(info_hash, intro)| (*info_hash, *intro))
            .collect();
        for (info_hash, intro) in stopped {
            info!("Stopped seeding {}, dropping its introduction point", info_hash);
            self.hidden.forget_download(&info_hash);
            self.remove_circuit(intro.circuit_id, RemovalReason::StoppedSeeding, true);
        }
    }

    fn ensure_intro_circuit(&mut self, info_hash: InfoHash, hops: usize) {
        let now = self.now();
        if !self
            .hidden
            .needs_intro_circuit(&info_hash, now, protocol::INTRO_RECREATE_THRESHOLD)
        {
            return;
        }

        if let Some(stale) = self.hidden.intro_circuits.remove(&info_hash) {
            debug!("Introduction circuit {} never registered, rebuilding", stale.circuit_id);
            self.remove_circuit(stale.circuit_id, RemovalReason::Timeout, true);
        }

        let request = CircuitRequest::data(hops + 1)
            .with_ctype(CircuitType::IntroductionPoint)
            .with_info_hash(info_hash)
            .with_on_ready(ReadyHook::EstablishIntro { info_hash });
        if let Some(circuit_id) = self.create_circuit(request) {
            self.hidden.intro_circuits.insert(
                info_hash,
                IntroductionCircuit {
                    circuit_id,
                    created: now,
                    established: false,
                },
            );
        }
    }

    fn hops_for(&self, info_hash: &InfoHash) -> usize {
        self.hidden
            .hops
            .get(info_hash)
            .copied()
            .unwrap_or(self.settings.circuit_length)
    }

    /// Ask the exit of one of our data circuits to look up introduction points
    fn do_dht_lookup(&mut self, info_hash: InfoHash) {
        let hops = self.hops_for(&info_hash);
        let Some(circuit_id) = self.active_data_circuits(hops).first().copied() else {
            debug!("No {}-hop circuit for DHT lookup of {}, building", hops, info_hash);
            self.build_tunnels(hops);
            return;
        };

        let now = self.now();
        let identifier = match self.cache.add_with_identifier(
            CacheEntry::DhtRequest {
                circuit_id,
                info_hash,
            },
            now,
            protocol::DHT_REQUEST_TIMEOUT,
        ) {
            Ok(identifier) => identifier,
            Err(e) => {
                debug!("Skipping DHT lookup for {}: {}", info_hash, e);
                return;
            }
        };
        self.hidden.last_dht_lookup.insert(info_hash, now);

        debug!("DHT lookup for {} via circuit {}", info_hash, circuit_id);
        let request = Message::DhtRequest(InfoHashRequest {
            circuit_id,
            identifier,
            info_hash,
        });
        if let Err(e) = self.send_cell(circuit_id, &request) {
            debug!("Failed to send dht-request: {}", e);
        }
    }

    /// Ask an introduction point for the seeder's hidden-service key
    fn do_key_request(&mut self, info_hash: InfoHash, intro_point: SocketAddrV4) {
        let now = self.now();
        let identifier = match self.cache.add_with_identifier(
            CacheEntry::KeyRequest { info_hash },
            now,
            protocol::HIDDEN_SERVICE_TIMEOUT,
        ) {
            Ok(identifier) => identifier,
            Err(e) => {
                debug!("Skipping key request for {}: {}", info_hash, e);
                return;
            }
        };

        debug!("Key request for {} to {}", info_hash, intro_point);
        let request = Message::KeyRequest(InfoHashRequest {
            circuit_id: 0,
            identifier,
            info_hash,
        });
        let hops = self.hops_for(&info_hash);
        if let Err(e) = self.send_plain(hops, intro_point, &request) {
            debug!("Failed to send key-request to {}: {}", intro_point, e);
        }
    }

    /// Tunnel a plain message to `to` through one of our data circuits
    fn send_plain(&mut self, hops: usize, to: SocketAddrV4, message: &Message) -> Result<()> {
        let destination = Address::Ipv4(to);
        let active = self.active_data_circuits(hops);
        let circuit_id = self
            .dispatcher
            .select(hops, &destination, &active)
            .ok_or_else(|| TunnelError::CircuitCreationFailed(format!("no {}-hop circuit", hops)))?;

        let data = Message::Data(DataMessage {
            circuit_id,
            destination,
            origin: Address::unspecified(),
            payload: Cell::plain(message).encode(),
        });
        self.send_cell(circuit_id, &data)
    }

    /// Plain message straight to a peer's overlay socket
    fn send_plain_direct(&mut self, to: SocketAddr, message: &Message) {
        let packet = Cell::plain(message).encode();
        self.push_action(TunnelAction::Send { to, packet });
    }

    /// The host's DHT answered a lookup an originator asked us to run
    pub fn on_dht_result(
        &mut self,
        circuit_id: CircuitId,
        identifier: u16,
        info_hash: InfoHash,
        peers: Vec<SocketAddrV4>,
    ) {
        let response = Message::DhtResponse(DhtResponseMessage {
            circuit_id,
            identifier,
            info_hash,
            peers,
        });
        if let Err(e) = self.send_backward(circuit_id, &response) {
            debug!("Failed to return DHT result on {}: {}", circuit_id, e);
        }
    }

    // ------------------------------------------------------------------
    // Ready hooks
    // ------------------------------------------------------------------

    pub(crate) fn run_ready_hook(&mut self, circuit_id: CircuitId, hook: ReadyHook) {
        let message = match self.ready_hook_message(circuit_id, hook) {
            Ok(message) => message,
            Err(e) => {
                warn!("Ready hook for circuit {} failed: {}", circuit_id, e);
                return;
            }
        };

        if let Err(e) = self.send_cell(circuit_id, &message) {
            warn!("Failed to send {} on {}: {}", message.message_type(), circuit_id, e);
        }
    }

    fn ready_hook_message(&mut self, circuit_id: CircuitId, hook: ReadyHook) -> Result<Message> {
        let now = self.now();
        let message = match hook {
            ReadyHook::EstablishIntro { info_hash } => {
                let identifier = self.cache.add_with_identifier(
                    CacheEntry::EstablishIntro {
                        circuit_id,
                        info_hash,
                    },
                    now,
                    protocol::HIDDEN_SERVICE_TIMEOUT,
                )?;
                Message::EstablishIntro(InfoHashRequest {
                    circuit_id,
                    identifier,
                    info_hash,
                })
            }
            ReadyHook::EstablishRendezvous => {
                let cookie = self
                    .hidden
                    .rendezvous_points
                    .get(&circuit_id)
                    .map(|rp| rp.cookie)
                    .ok_or_else(|| TunnelError::CacheMiss(format!("rendezvous point {}", circuit_id)))?;
                let identifier = self.cache.add_with_identifier(
                    CacheEntry::EstablishRendezvous { circuit_id },
                    now,
                    protocol::HIDDEN_SERVICE_TIMEOUT,
                )?;
                Message::EstablishRendezvous(CookieMessage {
                    circuit_id,
                    identifier,
                    cookie,
                })
            }
            ReadyHook::LinkE2e { cookie, info_hash } => {
                let identifier = self.cache.add_with_identifier(
                    CacheEntry::LinkRequest {
                        circuit_id,
                        info_hash,
                    },
                    now,
                    protocol::HIDDEN_SERVICE_TIMEOUT,
                )?;
                Message::LinkE2e(CookieMessage {
                    circuit_id,
                    identifier,
                    cookie,
                })
            }
        };
        Ok(message)
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    pub(crate) fn handle_hidden_message(
        &mut self,
        circuit_id: CircuitId,
        role: Role,
        message: Message,
    ) -> Result<()> {
        match (role, message) {
            (Role::Exit, Message::EstablishIntro(m)) => self.on_establish_intro(circuit_id, m),
            (Role::Originator, Message::IntroEstablished(m)) => {
                self.on_intro_established(circuit_id, m)
            }
            (Role::Originator, Message::KeyRequest(m)) => self.on_key_request(circuit_id, m),
            (Role::Exit, Message::KeyResponse(m)) => self.return_key_response(m),
            (Role::Originator, Message::CreateE2e(m)) => self.on_create_e2e(circuit_id, m),
            (Role::Exit, Message::CreatedE2e(m)) => self.return_created_e2e(m),
            (Role::Exit, Message::EstablishRendezvous(m)) => {
                self.on_establish_rendezvous(circuit_id, m)
            }
            (Role::Originator, Message::RendezvousEstablished(m)) => {
                self.on_rendezvous_established(circuit_id, m)
            }
            (Role::Exit, Message::LinkE2e(m)) => self.on_link_e2e(circuit_id, m),
            (Role::Originator, Message::LinkedE2e(m)) => self.on_linked_e2e(circuit_id, m),
            (Role::Exit, Message::DhtRequest(m)) => {
                self.push_action(TunnelAction::DhtLookup {
                    circuit_id,
                    identifier: m.identifier,
                    info_hash: m.info_hash,
                });
                Ok(())
            }
            (Role::Originator, Message::DhtResponse(m)) => self.on_dht_response(circuit_id, m),
            (role, message) => Err(TunnelError::protocol(format!(
                "unexpected {} on circuit {} as {:?}",
                message.message_type(),
                circuit_id,
                role
            ))),
        }
    }

    /// Hidden-service messages that reach us outside any circuit
    pub(crate) fn handle_plain_message(&mut self, from: SocketAddr, message: Message) -> Result<()> {
        match message {
            Message::KeyRequest(m) => self.relay_key_request(from, m),
            Message::CreateE2e(m) => self.relay_create_e2e(from, m),
            Message::KeyResponse(m) => self.on_key_response(from, m),
            Message::CreatedE2e(m) => self.on_created_e2e(m),
            other => Err(TunnelError::protocol(format!(
                "{} is not a plain message",
                other.message_type()
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Introduction point
    // ------------------------------------------------------------------

    fn on_establish_intro(&mut self, circuit_id: CircuitId, request: InfoHashRequest) -> Result<()> {
        info!("Becoming introduction point for {} on {}", request.info_hash, circuit_id);
        self.hidden
            .intro_point_for
            .insert(request.info_hash, circuit_id);

        let reply = Message::IntroEstablished(Acknowledgement {
            circuit_id,
            identifier: request.identifier,
        });
        self.send_backward(circuit_id, &reply)?;
        self.push_action(TunnelAction::DhtAnnounce {
            info_hash: request.info_hash,
        });
        Ok(())
    }

    fn intro_circuit_for(&self, info_hash: &InfoHash) -> Result<CircuitId> {
        self.hidden
            .intro_point_for
            .get(info_hash)
            .copied()
            .ok_or_else(|| TunnelError::CacheMiss(format!("not an introduction point for {}", info_hash)))
    }

    fn relay_key_request(&mut self, from: SocketAddr, request: InfoHashRequest) -> Result<()> {
        let circuit_id = self.intro_circuit_for(&request.info_hash)?;
        let now = self.now();
        let identifier = self.cache.add_with_identifier(
            CacheEntry::KeyRelay {
                requester: from,
                identifier: request.identifier,
            },
            now,
            protocol::HIDDEN_SERVICE_TIMEOUT,
        )?;

        debug!("Relaying key-request from {} to seeder on {}", from, circuit_id);
        let forward = Message::KeyRequest(InfoHashRequest {
            circuit_id,
            identifier,
            info_hash: request.info_hash,
        });
        self.send_backward(circuit_id, &forward)
    }

    fn relay_create_e2e(&mut self, from: SocketAddr, request: CreateE2eMessage) -> Result<()> {
        let circuit_id = self.intro_circuit_for(&request.info_hash)?;
        let now = self.now();
        let identifier = self.cache.add_with_identifier(
            CacheEntry::E2eRelay {
                requester: from,
                identifier: request.identifier,
            },
            now,
            protocol::HIDDEN_SERVICE_TIMEOUT,
        )?;

        debug!("Relaying create-e2e from {} to seeder on {}", from, circuit_id);
        let forward = Message::CreateE2e(CreateE2eMessage {
            identifier,
            ..request
        });
        self.send_backward(circuit_id, &forward)
    }

    fn return_key_response(&mut self, response: KeyResponseMessage) -> Result<()> {
        let Some(CacheEntry::KeyRelay {
            requester,
            identifier,
        }) = self.cache.pop(CacheCategory::KeyRelay, response.identifier as u32)
        else {
            return Err(TunnelError::CacheMiss("key-response".to_string()));
        };

        let reply = Message::KeyResponse(KeyResponseMessage {
            identifier,
            ..response
        });
        self.send_plain_direct(requester, &reply);
        Ok(())
    }

    fn return_created_e2e(&mut self, response: CreatedE2eMessage) -> Result<()> {
        let Some(CacheEntry::E2eRelay {
            requester,
            identifier,
        }) = self.cache.pop(CacheCategory::E2eRelay, response.identifier as u32)
        else {
            return Err(TunnelError::CacheMiss("created-e2e".to_string()));
        };

        let reply = Message::CreatedE2e(CreatedE2eMessage {
            identifier,
            ..response
        });
        self.send_plain_direct(requester, &reply);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Seeder
    // ------------------------------------------------------------------

    fn on_intro_established(&mut self, circuit_id: CircuitId, ack: Acknowledgement) -> Result<()> {
        match self.cache.pop(CacheCategory::EstablishIntro, ack.identifier as u32) {
            Some(CacheEntry::EstablishIntro {
                circuit_id: pending, ..
            }) if pending == circuit_id => {}
            _ => return Err(TunnelError::CacheMiss("intro-established".to_string())),
        }

        if let Some(info_hash) = self.hidden.mark_intro_established(circuit_id) {
            info!("Introduction point for {} ready on circuit {}", info_hash, circuit_id);
        }
        Ok(())
    }

    fn check_intro_circuit(&self, circuit_id: CircuitId) -> Result<()> {
        match self.circuits.get(&circuit_id) {
            Some(c) if c.ctype == CircuitType::IntroductionPoint => Ok(()),
            _ => Err(TunnelError::protocol(format!(
                "{} is not an introduction circuit",
                circuit_id
            ))),
        }
    }

    fn on_key_request(&mut self, circuit_id: CircuitId, request: InfoHashRequest) -> Result<()> {
        self.check_intro_circuit(circuit_id)?;

        let pex_peers = self
            .hidden
            .known_intro_points(&request.info_hash, protocol::MAX_PEX_PEERS);
        debug!("Answering key-request for {} on {}", request.info_hash, circuit_id);
        let response = Message::KeyResponse(KeyResponseMessage {
            identifier: request.identifier,
            public_key: self.hs_keypair.public_key(),
            pex_peers,
        });
        self.send_cell(circuit_id, &response)
    }

    fn on_create_e2e(&mut self, circuit_id: CircuitId, request: CreateE2eMessage) -> Result<()> {
        self.check_intro_circuit(circuit_id)?;
        if request.node_public_key != self.hs_keypair.public_key() {
            return Err(TunnelError::protocol("create-e2e for another service key"));
        }

        let response = respond_to_handshake(&request.key, &self.hs_keypair)?;
        let hops = self.hops_for(&request.info_hash);
        let circuit_request = CircuitRequest::data(hops)
            .with_ctype(CircuitType::RendezvousPoint)
            .with_info_hash(request.info_hash)
            .with_session_keys(response.keys)
            .with_on_ready(ReadyHook::EstablishRendezvous);

        let Some(rp_circuit) = self.create_circuit(circuit_request) else {
            return Err(TunnelError::CircuitCreationFailed(
                "no first hop for rendezvous circuit".to_string(),
            ));
        };

        info!(
            "Building rendezvous circuit {} for {}",
            rp_circuit, request.info_hash
        );
        self.hidden.rendezvous_points.insert(
            rp_circuit,
            RendezvousPoint {
                circuit_id: rp_circuit,
                cookie: generate_cookie(),
                info_hash: request.info_hash,
                intro_circuit_id: circuit_id,
                relay_identifier: request.identifier,
                e2e_public: response.public,
                auth: response.auth,
                rp_info: None,
            },
        );
        Ok(())
    }

    fn on_rendezvous_established(
        &mut self,
        circuit_id: CircuitId,
        established: RendezvousEstablishedMessage,
    ) -> Result<()> {
        match self
            .cache
            .pop(CacheCategory::EstablishRendezvous, established.identifier as u32)
        {
            Some(CacheEntry::EstablishRendezvous { circuit_id: pending }) if pending == circuit_id => {}
            _ => return Err(TunnelError::CacheMiss("rendezvous-established".to_string())),
        }
        if established.rendezvous_point_addr.ip() == &Ipv4Addr::UNSPECIFIED {
            return Err(TunnelError::protocol("rendezvous point does not know its address"));
        }

        let circuit = self
            .circuits
            .get_mut(&circuit_id)
            .ok_or(TunnelError::CircuitNotFound(circuit_id))?;
        let rendezvous_key = circuit
            .hops
            .last()
            .map(|hop| hop.public_key)
            .ok_or_else(|| TunnelError::internal("ready circuit without hops"))?;
        let rp = self
            .hidden
            .rendezvous_points
            .get_mut(&circuit_id)
            .ok_or_else(|| TunnelError::CacheMiss(format!("rendezvous point {}", circuit_id)))?;

        let info = RendezvousInfo {
            address: established.rendezvous_point_addr,
            public_key: rendezvous_key,
            cookie: rp.cookie,
        };
        let direction = end_to_end_direction(circuit.ctype, true);
        let keys = circuit
            .hs_session_keys
            .as_mut()
            .ok_or(CryptoError::MissingKeys)?;
        let rp_info_enc = keys.encrypt(direction, &info.encode())?;
        rp.rp_info = Some(info);

        let reply = Message::CreatedE2e(CreatedE2eMessage {
            identifier: rp.relay_identifier,
            key: rp.e2e_public,
            auth: rp.auth,
            rp_info_enc,
        });
        let intro_circuit = rp.intro_circuit_id;
        debug!(
            "Rendezvous point for circuit {} at {}, answering via {}",
            circuit_id, established.rendezvous_point_addr, intro_circuit
        );
        self.send_cell(intro_circuit, &reply)
    }

    // ------------------------------------------------------------------
    // Rendezvous point
    // ------------------------------------------------------------------

    fn on_establish_rendezvous(&mut self, circuit_id: CircuitId, request: CookieMessage) -> Result<()> {
        debug!("Becoming rendezvous point on {}", circuit_id);
        self.hidden
            .rendezvous_point_for
            .insert(request.cookie, circuit_id);

        let address = self
            .local_address
            .unwrap_or_else(|| SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
        let reply = Message::RendezvousEstablished(RendezvousEstablishedMessage {
            circuit_id,
            identifier: request.identifier,
            rendezvous_point_addr: address,
        });
        self.send_backward(circuit_id, &reply)
    }

    /// Splice the downloader's circuit onto the seeder's
    fn on_link_e2e(&mut self, circuit_id: CircuitId, request: CookieMessage) -> Result<()> {
        let seeder_circuit = self
            .hidden
            .rendezvous_point_for
            .remove(&request.cookie)
            .ok_or_else(|| TunnelError::CacheMiss("link-e2e with unknown cookie".to_string()))?;
        if seeder_circuit == circuit_id {
            return Err(TunnelError::protocol("link-e2e on the seeder's own circuit"));
        }

        let seeder_peer = self
            .exit_sockets
            .get(&seeder_circuit)
            .map(|exit| exit.sock_addr)
            .ok_or(TunnelError::CircuitNotFound(seeder_circuit))?;
        let downloader_peer = self
            .exit_sockets
            .get(&circuit_id)
            .map(|exit| exit.sock_addr)
            .ok_or(TunnelError::CircuitNotFound(circuit_id))?;

        let reply = Message::LinkedE2e(Acknowledgement {
            circuit_id,
            identifier: request.identifier,
        });
        self.send_backward(circuit_id, &reply)?;

        let now = self.now();
        self.relays.link(
            (seeder_circuit, seeder_peer),
            (circuit_id, downloader_peer),
            true,
            now,
        );
        for id in [seeder_circuit, circuit_id] {
            self.cache.pop(CacheCategory::Created, id);
            if let Some(exit) = self.exit_sockets.remove(&id) {
                if exit.enabled {
                    self.push_action(TunnelAction::ExitClose { circuit_id: id });
                }
            }
        }

        info!(
            "Spliced circuits {} and {} at rendezvous point",
            seeder_circuit, circuit_id
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Downloader
    // ------------------------------------------------------------------

    fn on_dht_response(&mut self, circuit_id: CircuitId, response: DhtResponseMessage) -> Result<()> {
        match self
            .cache
            .pop(CacheCategory::DhtRequest, response.identifier as u32)
        {
            Some(CacheEntry::DhtRequest {
                circuit_id: pending,
                info_hash,
            }) if pending == circuit_id && info_hash == response.info_hash => {}
            _ => return Err(TunnelError::CacheMiss("dht-response".to_string())),
        }

        let info_hash = response.info_hash;
        let added = self.hidden.add_pex(info_hash, response.peers);
        debug!("DHT returned {} new introduction points for {}", added, info_hash);
        while let Some(intro_point) = self.hidden.pop_pex(&info_hash) {
            self.do_key_request(info_hash, intro_point);
        }
        Ok(())
    }

    fn on_key_response(&mut self, from: SocketAddr, response: KeyResponseMessage) -> Result<()> {
        let Some(CacheEntry::KeyRequest { info_hash }) = self
            .cache
            .pop(CacheCategory::KeyRequest, response.identifier as u32)
        else {
            return Err(TunnelError::CacheMiss("key-response".to_string()));
        };
        let intro_point = match from {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => return Err(TunnelError::InvalidAddress(from.to_string())),
        };

        self.hidden.add_pex(info_hash, response.pex_peers);

        let hops = self.hops_for(&info_hash);
        let dh_secret = DhSecret::generate();
        let key = dh_secret.public();
        let service_key = response.public_key;
        let now = self.now();
        let identifier = self.cache.add_with_identifier(
            CacheEntry::E2eRequest {
                info_hash,
                dh_secret,
                service_key,
                hops,
            },
            now,
            protocol::HIDDEN_SERVICE_TIMEOUT,
        )?;

        debug!("Got service key for {}, sending create-e2e to {}", info_hash, intro_point);
        let request = Message::CreateE2e(CreateE2eMessage {
            identifier,
            info_hash,
            node_id: NodeId::from_public_key(&service_key),
            node_public_key: service_key,
            key,
        });
        self.send_plain(hops, intro_point, &request)
    }

    fn on_created_e2e(&mut self, response: CreatedE2eMessage) -> Result<()> {
        let Some(CacheEntry::E2eRequest {
            info_hash,
            dh_secret,
            service_key,
            hops,
        }) = self
            .cache
            .pop(CacheCategory::E2eRequest, response.identifier as u32)
        else {
            return Err(TunnelError::CacheMiss("created-e2e".to_string()));
        };

        let mut keys = dh_secret.verify_and_derive(&response.key, &response.auth, &service_key)?;
        let plain = keys.decrypt(
            end_to_end_direction(CircuitType::Rendezvous, false),
            &response.rp_info_enc,
        )?;
        let info = RendezvousInfo::decode(&plain)?;

        info!(
            "Seeder of {} picked rendezvous point {}",
            info_hash, info.address
        );
        let request = CircuitRequest::data(hops + 1)
            .with_ctype(CircuitType::Rendezvous)
            .with_required_exit(Candidate::new(SocketAddr::V4(info.address), info.public_key))
            .with_info_hash(info_hash)
            .with_session_keys(keys)
            .with_on_ready(ReadyHook::LinkE2e {
                cookie: info.cookie,
                info_hash,
            });
        self.create_circuit(request)
            .map(|_| ())
            .ok_or_else(|| TunnelError::CircuitCreationFailed("no first hop for rendezvous".to_string()))
    }

    fn on_linked_e2e(&mut self, circuit_id: CircuitId, ack: Acknowledgement) -> Result<()> {
        let info_hash = match self.cache.pop(CacheCategory::LinkRequest, ack.identifier as u32) {
            Some(CacheEntry::LinkRequest {
                circuit_id: pending,
                info_hash,
            }) if pending == circuit_id => info_hash,
            _ => return Err(TunnelError::CacheMiss("linked-e2e".to_string())),
        };

        let Some(real) = self.hidden.real_info_hash(&info_hash) else {
            warn!("Linked circuit {} for unknown download {}", circuit_id, info_hash);
            return Ok(());
        };
        let peer = SocketAddrV4::new(virtual_ip(circuit_id), protocol::CIRCUIT_ID_PORT);
        info!("Hidden connection for {} ready as peer {}", real, peer);
        self.push_action(TunnelAction::AddPeer {
            info_hash: real,
            peer,
        });
        Ok(())
    }
}
