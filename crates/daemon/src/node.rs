//! Tokio host for the tunnel community
//!
//! One task owns the `TunnelCommunity`. Everything that happens to it
//! (overlay datagrams, exit-socket replies, SOCKS5 traffic, timers) arrives
//! as a `NodeEvent`; everything it wants done comes back as `TunnelAction`s
//! that this module carries out.

use crate::collab::{DhtClient, TorrentClient};
use crate::proxy::{Delivery, SessionId, SocksEvent};
use anontunnel_common::{protocol, NodeConfig};
use anontunnel_core::{
    Address, CircuitId, CircuitType, ExportableIdentity, Identity, PublicKey, SystemClock,
    TunnelAction, TunnelCommunity,
};
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const EVENT_QUEUE: usize = 4096;
const MAX_DATAGRAM: usize = 65_535;
const TICK_INTERVAL: Duration = Duration::from_secs(1);
const MONITOR_INTERVAL: Duration = Duration::from_secs(5);

/// Input to the node task
#[derive(Debug)]
pub enum NodeEvent {
    Overlay {
        from: SocketAddr,
        packet: Vec<u8>,
    },
    Exit {
        circuit_id: CircuitId,
        from: SocketAddr,
        payload: Vec<u8>,
    },
    /// A hostname an exit sent to was resolved
    ExitResolved {
        circuit_id: CircuitId,
        destination: Address,
        resolved: SocketAddrV4,
    },
    Socks(SocksEvent),
}

/// Cheap handle for feeding the node from other tasks
#[derive(Debug, Clone)]
pub struct NodeHandle {
    pub events: mpsc::Sender<NodeEvent>,
    pub local_addr: SocketAddr,
    pub public_key: PublicKey,
}

struct ExitHandle {
    socket: Arc<UdpSocket>,
    reader: JoinHandle<()>,
}

/// SOCKS5 sessions by hop count, and which one last talked to a destination
#[derive(Default)]
struct SessionTable {
    sessions: HashMap<SessionId, (usize, mpsc::Sender<Delivery>)>,
    last_sender: HashMap<(usize, Address), SessionId>,
}

impl SessionTable {
    fn open(&mut self, session: SessionId, hops: usize, deliver: mpsc::Sender<Delivery>) {
        self.sessions.insert(session, (hops, deliver));
    }

    fn close(&mut self, session: SessionId) {
        self.sessions.remove(&session);
        self.last_sender.retain(|_, id| *id != session);
    }

    fn sent(&mut self, session: SessionId, hops: usize, destination: Address) {
        self.last_sender.insert((hops, destination), session);
    }

    /// Session a datagram from `origin` belongs to: whoever last sent there,
    /// else the newest session for `hops`
    fn route(&self, hops: usize, origin: &Address) -> Option<&mpsc::Sender<Delivery>> {
        let session = self
            .last_sender
            .get(&(hops, origin.clone()))
            .filter(|id| self.sessions.contains_key(id))
            .copied()
            .or_else(|| {
                self.sessions
                    .iter()
                    .filter(|(_, (h, _))| *h == hops)
                    .map(|(id, _)| *id)
                    .max()
            })?;
        self.sessions.get(&session).map(|(_, deliver)| deliver)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SelfTest {
    Off,
    Waiting,
    Pinged(CircuitId),
    Done,
}

/// Tunnel node bound to its overlay socket
pub struct TunnelNode {
    community: TunnelCommunity,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    events_tx: mpsc::Sender<NodeEvent>,
    events_rx: mpsc::Receiver<NodeEvent>,
    exits: HashMap<CircuitId, ExitHandle>,
    sessions: SessionTable,
    dht: Arc<dyn DhtClient>,
    torrents: Arc<dyn TorrentClient>,
    self_test: SelfTest,
}

impl TunnelNode {
    /// Bind the overlay socket and seed the candidate table
    pub async fn bind(
        config: &NodeConfig,
        identity: Identity,
        dht: Arc<dyn DhtClient>,
        torrents: Arc<dyn TorrentClient>,
    ) -> Result<Self> {
        let listen: SocketAddr = format!("{}:{}", config.listen_addr, config.listen_port).parse()?;
        let socket = UdpSocket::bind(listen).await?;
        let local_addr = socket.local_addr()?;

        info!("Node ID: {}", identity.node_id());
        info!("Public Key: {}", identity.public_key());
        info!("Overlay socket bound to {}", local_addr);

        let mut community = TunnelCommunity::new(
            identity,
            config.tunnel.clone(),
            Arc::new(SystemClock),
        );
        if let SocketAddr::V4(v4) = local_addr {
            if !v4.ip().is_unspecified() {
                community.set_local_address(v4);
            }
        }

        for peer in &config.bootstrap_peers {
            let key = match PublicKey::from_hex(&peer.public_key) {
                Ok(key) => key,
                Err(e) => {
                    warn!("Skipping bootstrap peer {}: {}", peer.address, e);
                    continue;
                }
            };
            match tokio::net::lookup_host(peer.address.as_str()).await {
                Ok(mut addrs) => match addrs.find(SocketAddr::is_ipv4) {
                    Some(addr) => {
                        community.add_candidate(addr, key);
                        debug!("Bootstrap peer {} at {}", key, addr);
                    }
                    None => warn!("Bootstrap peer {} has no IPv4 address", peer.address),
                },
                Err(e) => warn!("Failed to resolve bootstrap peer {}: {}", peer.address, e),
            }
        }

        let self_test = if config.tunnel.do_test {
            SelfTest::Waiting
        } else {
            SelfTest::Off
        };

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        Ok(Self {
            community,
            socket: Arc::new(socket),
            local_addr,
            events_tx,
            events_rx,
            exits: HashMap::new(),
            sessions: SessionTable::default(),
            dht,
            torrents,
            self_test,
        })
    }

    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            events: self.events_tx.clone(),
            local_addr: self.local_addr,
            public_key: self.community.public_key(),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn community(&self) -> &TunnelCommunity {
        &self.community
    }

    /// Run the event loop until `shutdown` resolves, then unload the community
    pub async fn run_until(mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let overlay_reader = self.spawn_overlay_reader();

        let mut circuits_timer = interval(protocol::CIRCUIT_MAINTENANCE_INTERVAL);
        let mut ping_timer = interval(protocol::PING_INTERVAL);
        let mut tick_timer = interval(TICK_INTERVAL);
        let mut monitor_timer = interval(MONITOR_INTERVAL);
        for timer in [
            &mut circuits_timer,
            &mut ping_timer,
            &mut tick_timer,
            &mut monitor_timer,
        ] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }
        ping_timer.reset();

        tokio::pin!(shutdown);
        info!("Tunnel node running");

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                _ = circuits_timer.tick() => {
                    self.community.do_circuits();
                    self.log_stats();
                }
                _ = ping_timer.tick() => self.community.do_ping(),
                _ = tick_timer.tick() => self.community.tick(),
                _ = monitor_timer.tick() => {
                    let downloads = self.torrents.downloads();
                    self.community.monitor_downloads(&downloads);
                }
            }
            self.flush_actions().await;
        }

        info!("Shutting down tunnel node");
        self.community.unload();
        self.flush_actions().await;

        overlay_reader.abort();
        for (_, exit) in self.exits.drain() {
            exit.reader.abort();
        }
        Ok(())
    }

    fn log_stats(&self) {
        let stats = self.community.stats();
        let hops = self.community.settings().circuit_length;
        debug!(
            "{} circuits ({} ready, {:.0}% of {}-hop target), {} relays, {} exits, {} candidates, up {} down {}",
            stats.circuits,
            stats.ready_circuits,
            self.community.tunnels_ready(hops) * 100.0,
            hops,
            stats.relays,
            stats.exit_sockets,
            stats.candidates,
            stats.bytes_up,
            stats.bytes_down
        );
    }

    fn spawn_overlay_reader(&self) -> JoinHandle<()> {
        let socket = self.socket.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, from)) => {
                        let event = NodeEvent::Overlay {
                            from,
                            packet: buf[..len].to_vec(),
                        };
                        if events.send(event).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => debug!("Overlay receive error: {}", e),
                }
            }
        })
    }

    fn handle_event(&mut self, event: NodeEvent) {
        match event {
            NodeEvent::Overlay { from, packet } => self.community.on_packet(from, &packet),
            NodeEvent::Exit {
                circuit_id,
                from,
                payload,
            } => self.community.on_exit_packet(circuit_id, from, payload),
            NodeEvent::ExitResolved {
                circuit_id,
                destination,
                resolved,
            } => self
                .community
                .on_exit_resolved(circuit_id, &destination, resolved),
            NodeEvent::Socks(SocksEvent::Open {
                session,
                hops,
                deliver,
            }) => {
                debug!("SOCKS5 session {} opened for {} hops", session, hops);
                self.sessions.open(session, hops, deliver);
                self.community.build_tunnels(hops);
            }
            NodeEvent::Socks(SocksEvent::Datagram {
                session,
                hops,
                destination,
                payload,
            }) => {
                self.sessions.sent(session, hops, destination.clone());
                if !self.community.send_socks_datagram(hops, destination, payload) {
                    debug!("Dropped datagram from SOCKS5 session {}", session);
                }
            }
            NodeEvent::Socks(SocksEvent::Close { session }) => self.sessions.close(session),
        }
    }

    async fn flush_actions(&mut self) {
        loop {
            let actions = self.community.drain_actions();
            if actions.is_empty() {
                return;
            }
            for action in actions {
                self.perform(action).await;
            }
        }
    }

    async fn perform(&mut self, action: TunnelAction) {
        match action {
            TunnelAction::Send { to, packet } => {
                if let Err(e) = self.socket.send_to(&packet, to).await {
                    debug!("Failed to send to {}: {}", to, e);
                }
            }
            TunnelAction::ExitSend {
                circuit_id,
                destination,
                payload,
            } => self.exit_send(circuit_id, destination, payload).await,
            TunnelAction::ExitClose { circuit_id } => {
                if let Some(exit) = self.exits.remove(&circuit_id) {
                    exit.reader.abort();
                    debug!("Closed exit socket for circuit {}", circuit_id);
                }
            }
            TunnelAction::Deliver {
                hops,
                circuit_id,
                origin,
                payload,
            } => match self.sessions.route(hops, &origin) {
                Some(deliver) => {
                    if deliver.try_send(Delivery { origin, payload }).is_err() {
                        debug!("SOCKS5 session for {} hops is not keeping up", hops);
                    }
                }
                None => debug!(
                    "No SOCKS5 session for {} hops, dropping data from circuit {}",
                    hops, circuit_id
                ),
            },
            TunnelAction::DhtLookup {
                circuit_id,
                identifier,
                info_hash,
            } => {
                let peers = self.dht.lookup(&info_hash);
                self.community
                    .on_dht_result(circuit_id, identifier, info_hash, peers);
            }
            TunnelAction::DhtAnnounce { info_hash } => {
                self.dht.announce(info_hash, self.local_addr.port());
            }
            TunnelAction::AddPeer { info_hash, peer } => self.torrents.add_peer(info_hash, peer),
            TunnelAction::CircuitReady { circuit_id, ctype } => {
                if self.self_test == SelfTest::Waiting && ctype == CircuitType::Data {
                    info!("Self-test: pinging circuit {}", circuit_id);
                    match self.community.ping_circuit(circuit_id) {
                        Ok(()) => self.self_test = SelfTest::Pinged(circuit_id),
                        Err(e) => warn!("Self-test ping failed: {}", e),
                    }
                }
            }
            TunnelAction::CircuitRemoved { circuit_id, reason } => {
                debug!("Circuit {} removed: {}", circuit_id, reason);
                if self.self_test == SelfTest::Pinged(circuit_id) {
                    warn!("Self-test circuit {} went away before answering", circuit_id);
                    self.self_test = SelfTest::Waiting;
                }
            }
            TunnelAction::Pong { circuit_id, rtt } => {
                if self.self_test == SelfTest::Pinged(circuit_id) {
                    info!("Self-test: circuit {} round trip {:?}", circuit_id, rtt);
                    self.self_test = SelfTest::Done;
                }
            }
        }
    }

    async fn exit_send(&mut self, circuit_id: CircuitId, destination: Address, payload: Vec<u8>) {
        let socket = match self.exit_socket(circuit_id).await {
            Ok(socket) => socket,
            Err(e) => {
                error!("Failed to open exit socket for circuit {}: {}", circuit_id, e);
                return;
            }
        };

        match destination {
            Address::Ipv4(addr) => {
                if let Err(e) = socket.send_to(&payload, SocketAddr::V4(addr)).await {
                    debug!("Exit send to {} failed: {}", addr, e);
                }
            }
            Address::Domain(host, port) => {
                // resolve off the event loop
                let events = self.events_tx.clone();
                tokio::spawn(async move {
                    let resolved = tokio::net::lookup_host((host.as_str(), port))
                        .await
                        .ok()
                        .and_then(|mut addrs| {
                            addrs.find_map(|addr| match addr {
                                SocketAddr::V4(v4) => Some(v4),
                                SocketAddr::V6(_) => None,
                            })
                        });
                    let Some(addr) = resolved else {
                        debug!("Could not resolve {}:{}", host, port);
                        return;
                    };

                    // the flood guard must know before the reply can arrive
                    let event = NodeEvent::ExitResolved {
                        circuit_id,
                        destination: Address::Domain(host, port),
                        resolved: addr,
                    };
                    if events.send(event).await.is_err() {
                        return;
                    }
                    if let Err(e) = socket.send_to(&payload, SocketAddr::V4(addr)).await {
                        debug!("Exit send to {} failed: {}", addr, e);
                    }
                });
            }
        }
    }

    async fn exit_socket(&mut self, circuit_id: CircuitId) -> Result<Arc<UdpSocket>> {
        if let Some(exit) = self.exits.get(&circuit_id) {
            return Ok(exit.socket.clone());
        }

        let socket = Arc::new(UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).await?);
        debug!(
            "Opened exit socket {} for circuit {}",
            socket.local_addr()?,
            circuit_id
        );

        let reader_socket = socket.clone();
        let events = self.events_tx.clone();
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match reader_socket.recv_from(&mut buf).await {
                    Ok((len, from)) => {
                        let event = NodeEvent::Exit {
                            circuit_id,
                            from,
                            payload: buf[..len].to_vec(),
                        };
                        if events.send(event).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => debug!("Exit socket {} receive error: {}", circuit_id, e),
                }
            }
        });

        self.exits.insert(
            circuit_id,
            ExitHandle {
                socket: socket.clone(),
                reader,
            },
        );
        Ok(socket)
    }
}

/// Load the node identity from `data_dir`, generating and saving one on
/// first start
pub fn load_or_generate_identity(data_dir: &Path) -> Result<Identity> {
    std::fs::create_dir_all(data_dir)?;
    let identity_path = data_dir.join("identity.json");

    if identity_path.exists() {
        info!("Loading identity from {:?}", identity_path);
        let identity_json = std::fs::read_to_string(&identity_path)?;
        let exportable = ExportableIdentity::from_json(&identity_json)?;
        return Identity::from_exportable(&exportable)
            .map_err(|e| anyhow!("Invalid identity file {:?}: {}", identity_path, e));
    }

    info!("Generating new identity...");
    let identity = Identity::generate();
    let identity_json = identity.to_exportable().to_json()?;
    std::fs::write(&identity_path, identity_json)?;
    info!("Saved identity to {:?}", identity_path);
    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{LocalDht, NoTorrents};
    use anontunnel_common::{BootstrapPeer, TunnelSettings};
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    fn settings() -> TunnelSettings {
        TunnelSettings::default()
            .with_circuit_length(1)
            .with_max_circuits(1)
            .with_exitnode(true)
    }

    fn config() -> NodeConfig {
        NodeConfig::new()
            .with_port(0)
            .with_tunnel(settings())
    }

    async fn start(config: NodeConfig) -> (NodeHandle, oneshot::Sender<()>, JoinHandle<Result<()>>) {
        let mut config = config;
        config.listen_addr = "127.0.0.1".to_string();
        let node = TunnelNode::bind(
            &config,
            Identity::generate(),
            Arc::new(LocalDht::new()),
            Arc::new(NoTorrents),
        )
        .await
        .unwrap();
        let handle = node.handle();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(node.run_until(async move {
            let _ = stop_rx.await;
        }));
        (handle, stop_tx, task)
    }

    /// 16-byte packet shaped like a UDP tracker connect request
    fn tracker_packet() -> Vec<u8> {
        let mut packet = vec![0u8; 16];
        packet[15] = 0x2a;
        packet
    }

    #[test]
    fn test_session_routing_prefers_last_sender() {
        let mut table = SessionTable::default();
        let (a, _ra) = mpsc::channel(1);
        let (b, _rb) = mpsc::channel(1);
        table.open(1, 1, a.clone());
        table.open(2, 1, b.clone());
        let destination = Address::Ipv4("203.0.113.5:7".parse().unwrap());

        // newest session for the hop count by default
        assert!(table.route(1, &destination).unwrap().same_channel(&b));
        assert!(table.route(2, &destination).is_none());

        table.sent(1, 1, destination.clone());
        assert!(table.route(1, &destination).unwrap().same_channel(&a));

        table.close(1);
        assert!(table.route(1, &destination).unwrap().same_channel(&b));
    }

    #[test]
    fn test_identity_is_persisted() {
        let dir = std::env::temp_dir().join(format!("anontunnel-identity-{}", rand::random::<u64>()));
        let first = load_or_generate_identity(&dir).unwrap();
        let second = load_or_generate_identity(&dir).unwrap();
        assert_eq!(first.public_key(), second.public_key());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_udp_echo_through_one_hop_circuit() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = match echo.local_addr().unwrap() {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(_) => unreachable!(),
        };
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while let Ok((len, from)) = echo.recv_from(&mut buf).await {
                let _ = echo.send_to(&buf[..len], from).await;
            }
        });

        let (exit, stop_exit, exit_task) = start(config()).await;
        let originator_config = config().with_bootstrap_peers(vec![BootstrapPeer {
            address: exit.local_addr.to_string(),
            public_key: exit.public_key.to_hex(),
        }]);
        let (originator, stop_originator, originator_task) = start(originator_config).await;

        let (deliver_tx, mut deliver_rx) = mpsc::channel(16);
        originator
            .events
            .send(NodeEvent::Socks(SocksEvent::Open {
                session: 1,
                hops: 1,
                deliver: deliver_tx,
            }))
            .await
            .unwrap();

        let destination = Address::Ipv4(echo_addr);
        let delivery = timeout(Duration::from_secs(20), async {
            loop {
                originator
                    .events
                    .send(NodeEvent::Socks(SocksEvent::Datagram {
                        session: 1,
                        hops: 1,
                        destination: destination.clone(),
                        payload: tracker_packet(),
                    }))
                    .await
                    .unwrap();
                if let Ok(Some(delivery)) =
                    timeout(Duration::from_millis(250), deliver_rx.recv()).await
                {
                    return delivery;
                }
            }
        })
        .await
        .expect("echo comes back through the circuit");

        assert_eq!(delivery.origin, destination);
        assert_eq!(delivery.payload, tracker_packet());

        stop_originator.send(()).unwrap();
        stop_exit.send(()).unwrap();
        originator_task.await.unwrap().unwrap();
        exit_task.await.unwrap().unwrap();
    }
}
