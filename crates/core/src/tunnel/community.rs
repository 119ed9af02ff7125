use super::action::{RemovalReason, TunnelAction};
use super::cache::{CacheEntry, RequestCache};
use super::clock::Clock;
use super::dispatcher::Dispatcher;
use crate::circuit::{
    circuit_id_from_virtual_ip, Circuit, CircuitId, CircuitType, CryptoError, DhSecret,
    ExitSocket, Hop, KeyDirection, PathSelectionCriteria, PathSelector, RelayTable, SessionKeys,
};
use crate::identity::{Identity, KeyPair, PublicKey};
use crate::peer::{Candidate, CandidateManager};
use crate::protocol::{
    to_ipv4, Address, Cell, CreateMessage, DataMessage, DestroyMessage, Message, MessageType,
    PingMessage,
};
use crate::service::{HiddenServiceState, ReadyHook};
use anontunnel_common::{protocol, ByteCount, InfoHash, Result, TunnelError, TunnelSettings};
use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Parameters of a circuit to build
#[derive(Debug, Clone)]
pub struct CircuitRequest {
    pub goal_hops: usize,
    pub ctype: CircuitType,

    /// Peer that must be the last hop
    pub required_exit: Option<Candidate>,

    pub info_hash: Option<InfoHash>,
    pub hs_session_keys: Option<SessionKeys>,
    pub on_ready: Option<ReadyHook>,

    /// How often to retry when no first hop is available
    pub max_retries: u32,
}

impl CircuitRequest {
    pub fn data(goal_hops: usize) -> Self {
        Self {
            goal_hops,
            ctype: CircuitType::Data,
            required_exit: None,
            info_hash: None,
            hs_session_keys: None,
            on_ready: None,
            max_retries: 0,
        }
    }

    pub fn with_ctype(mut self, ctype: CircuitType) -> Self {
        self.ctype = ctype;
        self
    }

    pub fn with_required_exit(mut self, exit: Candidate) -> Self {
        self.required_exit = Some(exit);
        self
    }

    pub fn with_info_hash(mut self, info_hash: InfoHash) -> Self {
        self.info_hash = Some(info_hash);
        self
    }

    pub fn with_session_keys(mut self, keys: SessionKeys) -> Self {
        self.hs_session_keys = Some(keys);
        self
    }

    pub fn with_on_ready(mut self, hook: ReadyHook) -> Self {
        self.on_ready = Some(hook);
        self
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Counters for status reporting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelStats {
    pub circuits: usize,
    pub ready_circuits: usize,
    pub relays: usize,
    pub exit_sockets: usize,
    pub candidates: usize,
    pub bytes_up: ByteCount,
    pub bytes_down: ByteCount,
}

/// The tunnel community of one node
///
/// Owns every circuit this node originates, relays or terminates, and the
/// hidden-service state on top of them. It is driven entirely by its host:
/// packets and timer ticks go in, [`TunnelAction`]s come out.
pub struct TunnelCommunity {
    pub(crate) identity: Identity,

    /// Long-term key the hidden-service end-to-end handshake runs against
    pub(crate) hs_keypair: KeyPair,

    pub(crate) settings: TunnelSettings,
    clock: Arc<dyn Clock>,

    /// Our address as seen by others, reported when acting as rendezvous point
    pub(crate) local_address: Option<SocketAddrV4>,

    pub(crate) candidates: CandidateManager,
    pub(crate) circuits: HashMap<CircuitId, Circuit>,
    pub(crate) relays: RelayTable,
    pub(crate) exit_sockets: HashMap<CircuitId, ExitSocket>,

    /// Keys of the circuits we relay or terminate, one entry per id
    pub(crate) relay_session_keys: HashMap<CircuitId, SessionKeys>,

    /// Ids whose created/extended reply has not arrived yet
    pub(crate) waiting_for: HashSet<CircuitId>,

    pub(crate) cache: RequestCache,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) hidden: HiddenServiceState,

    /// Data circuits to keep per hop count
    circuits_needed: HashMap<usize, usize>,

    /// Circuit requests waiting for a first hop to show up
    pending_creates: Vec<(Instant, CircuitRequest)>,

    /// Peers of each download (real info hash), as last reported
    pub(crate) download_peers: HashMap<InfoHash, HashSet<SocketAddrV4>>,

    /// Peers that lost their circuit, re-added once a new one is ready
    readd_buffer: HashMap<InfoHash, HashSet<SocketAddrV4>>,

    actions: VecDeque<TunnelAction>,
}

impl TunnelCommunity {
    pub fn new(identity: Identity, settings: TunnelSettings, clock: Arc<dyn Clock>) -> Self {
        let mut circuits_needed = HashMap::new();
        if settings.max_circuits > 0 {
            circuits_needed.insert(settings.circuit_length, settings.max_circuits);
        }

        Self {
            identity,
            hs_keypair: KeyPair::generate(),
            settings,
            clock,
            local_address: None,
            candidates: CandidateManager::default(),
            circuits: HashMap::new(),
            relays: RelayTable::new(),
            exit_sockets: HashMap::new(),
            relay_session_keys: HashMap::new(),
            waiting_for: HashSet::new(),
            cache: RequestCache::new(),
            dispatcher: Dispatcher::new(),
            hidden: HiddenServiceState::new(),
            circuits_needed,
            pending_creates: Vec::new(),
            download_peers: HashMap::new(),
            readd_buffer: HashMap::new(),
            actions: VecDeque::new(),
        }
    }

    pub(crate) fn now(&self) -> Instant {
        self.clock.now()
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn public_key(&self) -> PublicKey {
        self.identity.public_key()
    }

    pub fn settings(&self) -> &TunnelSettings {
        &self.settings
    }

    pub fn set_local_address(&mut self, address: SocketAddrV4) {
        self.local_address = Some(address);
    }

    /// Take everything queued for the host
    pub fn drain_actions(&mut self) -> Vec<TunnelAction> {
        self.actions.drain(..).collect()
    }

    pub(crate) fn push_action(&mut self, action: TunnelAction) {
        self.actions.push_back(action);
    }

    // ------------------------------------------------------------------
    // Candidates
    // ------------------------------------------------------------------

    pub fn add_candidate(&mut self, address: SocketAddr, public_key: PublicKey) -> bool {
        if public_key == self.public_key() {
            return false;
        }
        let now = self.now();
        self.candidates
            .add_candidate(Candidate::new(address, public_key), now)
    }

    pub fn remove_candidate(&mut self, address: &SocketAddr) {
        if self.candidates.remove_candidate(address).is_some() {
            debug!("Removed candidate {}", address);
        }
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn circuit(&self, circuit_id: CircuitId) -> Option<&Circuit> {
        self.circuits.get(&circuit_id)
    }

    pub fn circuits(&self) -> impl Iterator<Item = &Circuit> {
        self.circuits.values()
    }

    pub fn relays(&self) -> &RelayTable {
        &self.relays
    }

    pub fn exit_socket(&self, circuit_id: CircuitId) -> Option<&ExitSocket> {
        self.exit_sockets.get(&circuit_id)
    }

    pub fn exit_sockets(&self) -> impl Iterator<Item = &ExitSocket> {
        self.exit_sockets.values()
    }

    /// Ready data circuits of a hop count, ordered by id
    pub fn active_data_circuits(&self, hops: usize) -> Vec<CircuitId> {
        let mut ids: Vec<CircuitId> = self
            .circuits
            .values()
            .filter(|c| c.ctype == CircuitType::Data && c.goal_hops == hops && c.is_ready())
            .map(|c| c.circuit_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Share of the wanted ready data circuits of `hops` that exist, capped at 1
    pub fn tunnels_ready(&self, hops: usize) -> f64 {
        if self.settings.min_circuits == 0 {
            return 1.0;
        }
        let ready = self.active_data_circuits(hops).len() as f64;
        (ready / self.settings.min_circuits as f64).min(1.0)
    }

    pub fn stats(&self) -> TunnelStats {
        let (bytes_up, bytes_down) = self
            .circuits
            .values()
            .fold((0, 0), |(up, down), c| (up + c.bytes_up, down + c.bytes_down));
        TunnelStats {
            circuits: self.circuits.len(),
            ready_circuits: self.circuits.values().filter(|c| c.is_ready()).count(),
            relays: self.relays.len(),
            exit_sockets: self.exit_sockets.len(),
            candidates: self.candidates.len(),
            bytes_up: ByteCount::from_bytes(bytes_up),
            bytes_down: ByteCount::from_bytes(bytes_down),
        }
    }

    // ------------------------------------------------------------------
    // Circuit construction
    // ------------------------------------------------------------------

    /// Keep `max_circuits` data circuits of `hops` around from now on
    pub fn build_tunnels(&mut self, hops: usize) {
        self.circuits_needed
            .insert(hops, self.settings.max_circuits.max(1));
        self.fill_circuits();
    }

    /// Random nonzero id unused by any circuit, relay or exit
    pub(crate) fn allocate_circuit_id(&self) -> CircuitId {
        let mut rng = rand::thread_rng();
        loop {
            let id: CircuitId = rng.gen();
            if id != 0 && !self.circuit_id_in_use(id) {
                return id;
            }
        }
    }

    fn circuit_id_in_use(&self, id: CircuitId) -> bool {
        self.circuits.contains_key(&id)
            || self.relays.contains(&id)
            || self.exit_sockets.contains_key(&id)
            || self.relay_session_keys.contains_key(&id)
    }

    fn select_first_hop(&self, request: &CircuitRequest) -> Option<Candidate> {
        if request.goal_hops == 1 {
            if let Some(exit) = &request.required_exit {
                return Some(exit.clone());
            }
        }

        let mut criteria = PathSelectionCriteria::new()
            .exclude_addresses(self.circuits.values().map(|c| c.first_hop))
            .exclude_key(self.public_key());
        if let Some(exit) = &request.required_exit {
            criteria = criteria.exclude_key(exit.public_key);
        }

        PathSelector::select_first_hop(&self.candidates.candidates(), &criteria).cloned()
    }

    /// Start building a circuit; returns its id, or `None` when no first
    /// hop is available (a retry is scheduled while retries remain)
    pub fn create_circuit(&mut self, mut request: CircuitRequest) -> Option<CircuitId> {
        let now = self.now();
        if request.goal_hops == 0 {
            warn!("Refusing to build a circuit without hops");
            return None;
        }

        let Some(first_hop) = self.select_first_hop(&request) else {
            if request.max_retries > 0 {
                request.max_retries -= 1;
                debug!(
                    "No first hop for {} circuit, retrying in {:?}",
                    request.ctype,
                    protocol::CREATE_RETRY_DELAY
                );
                self.pending_creates
                    .push((now + protocol::CREATE_RETRY_DELAY, request));
            } else {
                debug!("No first hop for {} circuit", request.ctype);
            }
            return None;
        };

        let circuit_id = self.allocate_circuit_id();
        let dh_secret = DhSecret::generate();
        let key = dh_secret.public();
        let hop = Hop::new(first_hop.public_key, Some(first_hop.address), dh_secret);

        let mut circuit = Circuit::new(
            circuit_id,
            request.goal_hops,
            first_hop.address,
            request.ctype,
            now,
        );
        circuit.required_exit = request.required_exit;
        circuit.info_hash = request.info_hash;
        circuit.hs_session_keys = request.hs_session_keys;
        circuit.on_ready = request.on_ready;
        circuit.unverified_hop = Some(hop);

        info!(
            "Creating {} circuit {} ({} hops) via {}",
            circuit.ctype, circuit_id, circuit.goal_hops, first_hop.address
        );

        self.circuits.insert(circuit_id, circuit);
        self.waiting_for.insert(circuit_id);
        self.cache.add(
            circuit_id,
            CacheEntry::Circuit { circuit_id },
            now,
            protocol::CIRCUIT_REQUEST_TIMEOUT,
        );

        let create = Message::Create(CreateMessage {
            circuit_id,
            node_id: first_hop.node_id,
            node_public_key: first_hop.public_key,
            key,
        });
        self.send_cleartext(first_hop.address, circuit_id, &create);
        Some(circuit_id)
    }

    fn fill_circuits(&mut self) {
        let mut needed: Vec<(usize, usize)> =
            self.circuits_needed.iter().map(|(h, n)| (*h, *n)).collect();
        needed.sort_unstable();

        for (hops, wanted) in needed {
            let have = self
                .circuits
                .values()
                .filter(|c| c.ctype == CircuitType::Data && c.goal_hops == hops)
                .count();
            for _ in have..wanted {
                if self.create_circuit(CircuitRequest::data(hops)).is_none() {
                    break;
                }
            }
        }
    }

    /// Circuit maintenance tick: top up the data circuit pools, then evict
    /// whatever is too old, too busy or idle
    pub fn do_circuits(&mut self) {
        self.fill_circuits();
        self.do_remove();
    }

    /// Ping every ready circuit except a downloader's rendezvous circuit
    ///
    /// A seeder's rendezvous-point circuit is pinged too; once spliced, the
    /// rendezvous point answers in place of the far side.
    pub fn do_ping(&mut self) {
        let targets: Vec<CircuitId> = self
            .circuits
            .values()
            .filter(|c| c.is_ready() && c.ctype != CircuitType::Rendezvous)
            .map(|c| c.circuit_id)
            .collect();

        for circuit_id in targets {
            if let Err(e) = self.ping_circuit(circuit_id) {
                debug!("Failed to ping circuit {}: {}", circuit_id, e);
            }
        }
    }

    /// Send one ping down `circuit_id`; the answer shows up as `TunnelAction::Pong`
    pub fn ping_circuit(&mut self, circuit_id: CircuitId) -> Result<()> {
        let now = self.now();
        let identifier = self.cache.add_with_identifier(
            CacheEntry::Ping { circuit_id },
            now,
            protocol::PING_TIMEOUT,
        )?;
        let ping = Message::Ping(PingMessage {
            circuit_id,
            identifier,
        });
        self.send_cell(circuit_id, &ping)
    }

    /// Expire request caches and retry circuit creations that are due
    pub fn tick(&mut self) {
        let now = self.now();
        for entry in self.cache.expire(now) {
            self.on_cache_timeout(entry);
        }

        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending_creates)
            .into_iter()
            .partition(|(at, _)| *at <= now);
        self.pending_creates = waiting;
        for (_, request) in due {
            self.create_circuit(request);
        }
    }

    fn on_cache_timeout(&mut self, entry: CacheEntry) {
        match entry {
            CacheEntry::Circuit { circuit_id } => {
                if self.circuits.get(&circuit_id).is_some_and(|c| !c.is_ready()) {
                    self.remove_circuit(circuit_id, RemovalReason::Timeout, true);
                }
            }
            CacheEntry::Ping { circuit_id } => {
                self.remove_circuit(circuit_id, RemovalReason::PingTimeout, true);
            }
            CacheEntry::EstablishRendezvous { circuit_id }
            | CacheEntry::LinkRequest { circuit_id, .. } => {
                self.remove_circuit(circuit_id, RemovalReason::Timeout, true);
            }
            other => debug!("Request timed out: {:?}", other.category()),
        }
    }

    // ------------------------------------------------------------------
    // Removal
    // ------------------------------------------------------------------

    /// Remove an originated circuit; idempotent
    pub fn remove_circuit(&mut self, circuit_id: CircuitId, reason: RemovalReason, destroy: bool) {
        let Some(mut circuit) = self.circuits.remove(&circuit_id) else {
            return;
        };
        circuit.mark_broken();
        info!(
            "Removing {} circuit {}: {}",
            circuit.ctype, circuit_id, reason
        );

        if destroy {
            self.send_destroy(circuit.first_hop, circuit_id, reason);
        }

        self.waiting_for.remove(&circuit_id);
        self.cache.forget_circuit(circuit_id);
        self.hidden.forget_circuit(circuit_id);

        let affected = self.dispatcher.circuit_dead(circuit_id);
        if !affected.is_empty() {
            for (info_hash, peers) in &self.download_peers {
                let lost: Vec<SocketAddrV4> = peers
                    .iter()
                    .filter(|peer| affected.contains(&Address::Ipv4(**peer)))
                    .copied()
                    .collect();
                if !lost.is_empty() {
                    self.readd_buffer.entry(*info_hash).or_default().extend(lost);
                }
            }
        }

        self.push_action(TunnelAction::CircuitRemoved { circuit_id, reason });
    }

    /// Remove both halves of a relayed flow
    pub fn remove_relay(&mut self, circuit_id: CircuitId, reason: RemovalReason, destroy: bool) {
        let Some((route, mirror)) = self.relays.unlink(&circuit_id) else {
            return;
        };
        info!(
            "Removing relay {} <-> {}: {}",
            circuit_id, route.circuit_id, reason
        );

        if destroy {
            self.send_destroy(route.peer, route.circuit_id, reason);
            if let Some(mirror) = &mirror {
                self.send_destroy(mirror.peer, circuit_id, reason);
            }
        }

        for id in [circuit_id, route.circuit_id] {
            self.relay_session_keys.remove(&id);
            self.waiting_for.remove(&id);
        }
    }

    /// Close the exit side of a circuit
    pub fn remove_exit_socket(&mut self, circuit_id: CircuitId, reason: RemovalReason, destroy: bool) {
        let Some(exit) = self.exit_sockets.remove(&circuit_id) else {
            return;
        };
        info!("Removing exit socket {}: {}", circuit_id, reason);

        if exit.enabled {
            self.push_action(TunnelAction::ExitClose { circuit_id });
        }
        if destroy {
            self.send_destroy(exit.sock_addr, circuit_id, reason);
        }

        self.relay_session_keys.remove(&circuit_id);
        self.cache.pop(super::cache::CacheCategory::Created, circuit_id);
        self.hidden.forget_circuit(circuit_id);
    }

    fn removal_reason(
        &self,
        creation_time: Instant,
        last_incoming: Instant,
        bytes: u64,
        now: Instant,
    ) -> Option<RemovalReason> {
        if now.duration_since(creation_time) > self.settings.max_time() {
            Some(RemovalReason::TooOld)
        } else if bytes > self.settings.max_traffic {
            Some(RemovalReason::Traffic)
        } else if now.duration_since(last_incoming) > self.settings.max_time_inactive() {
            Some(RemovalReason::Inactive)
        } else {
            None
        }
    }

    /// Evict circuits, relays and exits that exceeded their age, traffic or
    /// inactivity limits
    pub fn do_remove(&mut self) {
        let now = self.now();

        let circuits: Vec<(CircuitId, RemovalReason)> = self
            .circuits
            .values()
            .filter_map(|c| {
                self.removal_reason(c.creation_time, c.last_incoming, c.bytes_up + c.bytes_down, now)
                    .map(|reason| (c.circuit_id, reason))
            })
            .collect();
        for (circuit_id, reason) in circuits {
            self.remove_circuit(circuit_id, reason, true);
        }

        let relays: Vec<(CircuitId, RemovalReason)> = self
            .relays
            .iter()
            .filter_map(|(id, route)| {
                self.removal_reason(
                    route.creation_time,
                    route.last_incoming,
                    route.bytes_up + route.bytes_down,
                    now,
                )
                .map(|reason| (*id, reason))
            })
            .collect();
        for (circuit_id, reason) in relays {
            self.remove_relay(circuit_id, reason, true);
        }

        let exits: Vec<(CircuitId, RemovalReason)> = self
            .exit_sockets
            .values()
            .filter_map(|e| {
                self.removal_reason(e.creation_time, e.last_incoming, e.bytes_up + e.bytes_down, now)
                    .map(|reason| (e.circuit_id, reason))
            })
            .collect();
        for (circuit_id, reason) in exits {
            self.remove_exit_socket(circuit_id, reason, true);
        }
    }

    /// Tear everything down with destroys to every neighbour; used on shutdown
    pub fn unload(&mut self) {
        self.circuits_needed.clear();
        self.pending_creates.clear();

        let circuits: Vec<CircuitId> = self.circuits.keys().copied().collect();
        for circuit_id in circuits {
            self.remove_circuit(circuit_id, RemovalReason::Unload, true);
        }
        let relays: Vec<CircuitId> = self.relays.iter().map(|(id, _)| *id).collect();
        for circuit_id in relays {
            self.remove_relay(circuit_id, RemovalReason::Unload, true);
        }
        let exits: Vec<CircuitId> = self.exit_sockets.keys().copied().collect();
        for circuit_id in exits {
            self.remove_exit_socket(circuit_id, RemovalReason::Unload, true);
        }
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    pub(crate) fn send_cleartext(&mut self, to: SocketAddr, circuit_id: CircuitId, message: &Message) {
        let cell = Cell::new(circuit_id, message.message_type(), message.encode());
        self.push_action(TunnelAction::Send {
            to,
            packet: cell.to_wire(),
        });
    }

    fn send_destroy(&mut self, to: SocketAddr, circuit_id: CircuitId, reason: RemovalReason) {
        let destroy = Message::Destroy(DestroyMessage {
            circuit_id,
            reason: reason.wire_code(),
        });
        self.send_cleartext(to, circuit_id, &destroy);
    }

    /// Send a message down one of our circuits, adding one layer per hop
    pub(crate) fn send_cell(&mut self, circuit_id: CircuitId, message: &Message) -> Result<()> {
        let circuit = self
            .circuits
            .get_mut(&circuit_id)
            .ok_or(TunnelError::CircuitNotFound(circuit_id))?;

        let message_type = message.message_type();
        let mut body = message.encode();

        if message_type == MessageType::Data && circuit.ctype.is_hidden_link() {
            let direction = end_to_end_direction(circuit.ctype, true);
            let keys = circuit
                .hs_session_keys
                .as_mut()
                .ok_or(CryptoError::MissingKeys)?;
            body = keys.encrypt(direction, &body)?;
        }

        for hop in circuit.hops.iter_mut().rev() {
            let keys = hop.session_keys.as_mut().ok_or(CryptoError::MissingKeys)?;
            body = keys.encrypt(KeyDirection::Forward, &body)?;
        }

        let packet = Cell::new(circuit_id, message_type, body).to_wire();
        circuit.add_sent(packet.len() as u64);
        let to = circuit.first_hop;
        self.push_action(TunnelAction::Send { to, packet });
        Ok(())
    }

    /// Send a message from the exit end of a circuit back towards its originator
    pub(crate) fn send_backward(&mut self, circuit_id: CircuitId, message: &Message) -> Result<()> {
        let to = self
            .exit_sockets
            .get(&circuit_id)
            .map(|exit| exit.sock_addr)
            .ok_or(TunnelError::CircuitNotFound(circuit_id))?;
        let keys = self
            .relay_session_keys
            .get_mut(&circuit_id)
            .ok_or(CryptoError::MissingKeys)?;

        let body = keys.encrypt(KeyDirection::Backward, &message.encode())?;
        let packet = Cell::new(circuit_id, message.message_type(), body).to_wire();
        self.push_action(TunnelAction::Send { to, packet });
        Ok(())
    }

    /// Route a SOCKS5 datagram into a circuit; false if it was dropped
    pub fn send_socks_datagram(&mut self, hops: usize, destination: Address, payload: Vec<u8>) -> bool {
        if let Address::Ipv4(addr) = &destination {
            if addr.port() == protocol::CIRCUIT_ID_PORT {
                let circuit_id = circuit_id_from_virtual_ip(*addr.ip());
                let hidden_link = self
                    .circuits
                    .get(&circuit_id)
                    .is_some_and(|c| c.ctype.is_hidden_link() && c.is_ready());
                if hidden_link {
                    return self.send_data(circuit_id, destination, payload);
                }
            }
        }

        let active = self.active_data_circuits(hops);
        match self.dispatcher.select(hops, &destination, &active) {
            Some(circuit_id) => self.send_data(circuit_id, destination, payload),
            None => {
                debug!("No {}-hop circuit for datagram to {}", hops, destination);
                false
            }
        }
    }

    fn send_data(&mut self, circuit_id: CircuitId, destination: Address, payload: Vec<u8>) -> bool {
        let data = Message::Data(DataMessage {
            circuit_id,
            destination,
            origin: Address::unspecified(),
            payload,
        });
        match self.send_cell(circuit_id, &data) {
            Ok(()) => true,
            Err(e) => {
                debug!("Failed to send data on circuit {}: {}", circuit_id, e);
                false
            }
        }
    }

    /// The host resolved a hostname one of our exits sent to
    pub fn on_exit_resolved(&mut self, circuit_id: CircuitId, destination: &Address, resolved: SocketAddrV4) {
        if let Some(exit) = self.exit_sockets.get_mut(&circuit_id) {
            exit.record_resolved(destination, resolved);
        }
    }

    /// Data returned by an exit socket's remote peer
    pub fn on_exit_packet(&mut self, circuit_id: CircuitId, from: SocketAddr, payload: Vec<u8>) {
        let Some(exit) = self.exit_sockets.get_mut(&circuit_id) else {
            debug!("Packet for unknown exit socket {}", circuit_id);
            return;
        };
        exit.record_incoming(from, payload.len());

        let Some(origin) = to_ipv4(&from) else {
            return;
        };
        let data = Message::Data(DataMessage {
            circuit_id,
            destination: Address::unspecified(),
            origin: Address::Ipv4(origin),
            payload,
        });
        if let Err(e) = self.send_backward(circuit_id, &data) {
            debug!("Failed to return exit data on {}: {}", circuit_id, e);
        }
    }

    // ------------------------------------------------------------------
    // Readiness
    // ------------------------------------------------------------------

    pub(crate) fn circuit_ready(&mut self, circuit_id: CircuitId) {
        let Some(circuit) = self.circuits.get_mut(&circuit_id) else {
            return;
        };
        let ctype = circuit.ctype;
        let hook = circuit.on_ready.take();
        info!(
            "{} circuit {} ready with {} hops",
            ctype,
            circuit_id,
            circuit.hops.len()
        );

        self.push_action(TunnelAction::CircuitReady { circuit_id, ctype });
        if ctype == CircuitType::Data {
            self.flush_readd_buffer();
        }
        if let Some(hook) = hook {
            self.run_ready_hook(circuit_id, hook);
        }
    }

    fn flush_readd_buffer(&mut self) {
        for (info_hash, peers) in self.readd_buffer.drain() {
            for peer in peers {
                self.actions
                    .push_back(TunnelAction::AddPeer { info_hash, peer });
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn age_everything(&mut self, by: std::time::Duration) {
        for circuit in self.circuits.values_mut() {
            circuit.creation_time -= by;
        }
    }
}

/// Direction of the end-to-end layer a side of a hidden connection uses
///
/// The downloader plays originator (forward out, backward in), the seeder
/// plays exit.
pub(crate) fn end_to_end_direction(ctype: CircuitType, outgoing: bool) -> KeyDirection {
    match (ctype == CircuitType::Rendezvous, outgoing) {
        (true, true) | (false, false) => KeyDirection::Forward,
        (true, false) | (false, true) => KeyDirection::Backward,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::clock::ManualClock;

    fn community() -> (TunnelCommunity, ManualClock) {
        let clock = ManualClock::new();
        let community = TunnelCommunity::new(
            Identity::generate(),
            TunnelSettings::default(),
            Arc::new(clock.clone()),
        );
        (community, clock)
    }

    fn peer(port: u16) -> (SocketAddr, PublicKey) {
        (
            SocketAddr::from(([10, 0, 0, 1], port)),
            KeyPair::generate().public_key(),
        )
    }

    #[test]
    fn test_create_circuit_sends_create() {
        let (mut community, _) = community();
        let (addr, key) = peer(7000);
        community.add_candidate(addr, key);

        let circuit_id = community.create_circuit(CircuitRequest::data(1)).unwrap();
        assert_ne!(circuit_id, 0);
        assert!(community.waiting_for.contains(&circuit_id));

        let actions = community.drain_actions();
        assert_eq!(actions.len(), 1);
        let TunnelAction::Send { to, packet } = &actions[0] else {
            panic!("expected a send");
        };
        assert_eq!(*to, addr);
        let cell = Cell::from_wire(packet).unwrap();
        assert_eq!(cell.message_type, MessageType::Create);
        let Message::Create(create) = Message::decode(cell.message_type, &cell.body).unwrap() else {
            panic!("expected create");
        };
        assert_eq!(create.node_public_key, key);
        assert_eq!(create.circuit_id, circuit_id);
    }

    #[test]
    fn test_first_hops_are_not_reused() {
        let (mut community, _) = community();
        let (addr, key) = peer(7000);
        community.add_candidate(addr, key);

        assert!(community.create_circuit(CircuitRequest::data(2)).is_some());
        assert!(community.create_circuit(CircuitRequest::data(2)).is_none());
    }

    #[test]
    fn test_create_retries_when_no_candidates() {
        let (mut community, clock) = community();
        assert!(community
            .create_circuit(CircuitRequest::data(1).with_retries(1))
            .is_none());

        let (addr, key) = peer(7000);
        community.add_candidate(addr, key);

        community.tick();
        assert!(community.circuits.is_empty());

        clock.advance(protocol::CREATE_RETRY_DELAY);
        community.tick();
        assert_eq!(community.circuits.len(), 1);
    }

    #[test]
    fn test_unanswered_create_times_out() {
        let (mut community, clock) = community();
        let (addr, key) = peer(7000);
        community.add_candidate(addr, key);
        let circuit_id = community.create_circuit(CircuitRequest::data(1)).unwrap();
        community.drain_actions();

        clock.advance(protocol::CIRCUIT_REQUEST_TIMEOUT);
        community.tick();

        assert!(community.circuit(circuit_id).is_none());
        let actions = community.drain_actions();
        assert!(actions.contains(&TunnelAction::CircuitRemoved {
            circuit_id,
            reason: RemovalReason::Timeout,
        }));
        assert!(actions
            .iter()
            .any(|a| matches!(a, TunnelAction::Send { to, .. } if *to == addr)));
    }

    #[test]
    fn test_required_exit_is_first_hop_of_single_hop_circuit() {
        let (mut community, _) = community();
        let (addr, key) = peer(7000);
        let exit = Candidate::new(addr, key);

        let circuit_id = community
            .create_circuit(CircuitRequest::data(1).with_required_exit(exit))
            .unwrap();
        assert_eq!(community.circuit(circuit_id).unwrap().first_hop, addr);
    }

    #[test]
    fn test_required_exit_never_first_hop_of_longer_circuit() {
        let (mut community, _) = community();
        let (addr, key) = peer(7000);
        community.add_candidate(addr, key);

        let request = CircuitRequest::data(2).with_required_exit(Candidate::new(addr, key));
        assert!(community.create_circuit(request).is_none());
    }

    #[test]
    fn test_tunnels_ready_ratio() {
        let (community, _) = community();
        assert_eq!(community.tunnels_ready(3), 0.0);
    }

    #[test]
    fn test_end_to_end_directions_mirror() {
        assert_eq!(
            end_to_end_direction(CircuitType::Rendezvous, true),
            end_to_end_direction(CircuitType::RendezvousPoint, false)
        );
        assert_eq!(
            end_to_end_direction(CircuitType::RendezvousPoint, true),
            end_to_end_direction(CircuitType::Rendezvous, false)
        );
    }

    #[test]
    fn test_own_key_is_not_a_candidate() {
        let (mut community, _) = community();
        let own = community.public_key();
        assert!(!community.add_candidate(SocketAddr::from(([10, 0, 0, 9], 1)), own));
        assert_eq!(community.candidate_count(), 0);
    }
}
