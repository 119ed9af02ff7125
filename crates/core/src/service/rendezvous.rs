//! Hidden-service bookkeeping for every role a node can play
//!
//! A node can at the same time be a seeder (owning introduction and
//! rendezvous-point circuits), an introduction point for someone else's
//! info hash, a rendezvous point splicing two circuits, and a downloader
//! collecting introduction points from the DHT and PEX.

use crate::circuit::{CircuitId, AUTH_LEN};
use crate::identity::PublicKey;
use crate::protocol::{Cookie, RendezvousInfo, COOKIE_LEN};
use anontunnel_common::InfoHash;
use rand::RngCore;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

/// Seeder side of a pending hidden connection, keyed by its RP circuit
#[derive(Debug, Clone)]
pub struct RendezvousPoint {
    pub circuit_id: CircuitId,
    pub cookie: Cookie,
    pub info_hash: InfoHash,

    /// Introduction circuit the create-e2e came in on; the answer goes back there
    pub intro_circuit_id: CircuitId,

    /// Identifier the introduction point used when relaying the create-e2e
    pub relay_identifier: u16,

    /// Our half of the end-to-end handshake, sent once the rendezvous point is up
    pub e2e_public: PublicKey,
    pub auth: [u8; AUTH_LEN],

    /// Filled when the rendezvous point confirms
    pub rp_info: Option<RendezvousInfo>,
}

pub fn generate_cookie() -> Cookie {
    let mut cookie = [0u8; COOKIE_LEN];
    rand::thread_rng().fill_bytes(&mut cookie);
    cookie
}

/// A seeder's circuit towards one of its introduction points
#[derive(Debug, Clone, Copy)]
pub struct IntroductionCircuit {
    pub circuit_id: CircuitId,
    pub created: Instant,
    pub established: bool,
}

/// Hidden-service tables of one node
#[derive(Debug, Default)]
pub struct HiddenServiceState {
    /// Introduction point role: info hash to the exit-side circuit of the seeder
    pub intro_point_for: HashMap<InfoHash, CircuitId>,

    /// Rendezvous role: cookie to the exit-side circuit of the seeder
    pub rendezvous_point_for: HashMap<Cookie, CircuitId>,

    /// Seeder role
    pub intro_circuits: HashMap<InfoHash, IntroductionCircuit>,
    pub rendezvous_points: HashMap<CircuitId, RendezvousPoint>,

    /// Anonymity level per anonymised info hash
    pub hops: HashMap<InfoHash, usize>,

    /// Anonymised to real info hash
    pub real_info_hashes: HashMap<InfoHash, InfoHash>,

    /// Downloader role: introduction points still to try
    infohash_pex: HashMap<InfoHash, VecDeque<SocketAddrV4>>,
    seen_pex: HashMap<InfoHash, HashSet<SocketAddrV4>>,

    pub last_dht_lookup: HashMap<InfoHash, Instant>,
}

impl HiddenServiceState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember which download an anonymised info hash belongs to
    pub fn track_download(&mut self, real: InfoHash, hops: usize) -> InfoHash {
        let anonymized = real.anonymized();
        self.hops.insert(anonymized, hops);
        self.real_info_hashes.insert(anonymized, real);
        anonymized
    }

    pub fn real_info_hash(&self, anonymized: &InfoHash) -> Option<InfoHash> {
        self.real_info_hashes.get(anonymized).copied()
    }

    /// Whether the introduction circuit for `info_hash` must be (re)built
    pub fn needs_intro_circuit(&self, info_hash: &InfoHash, now: Instant, threshold: Duration) -> bool {
        match self.intro_circuits.get(info_hash) {
            None => true,
            Some(intro) => !intro.established && now.duration_since(intro.created) > threshold,
        }
    }

    pub fn mark_intro_established(&mut self, circuit_id: CircuitId) -> Option<InfoHash> {
        self.intro_circuits
            .iter_mut()
            .find(|(_, intro)| intro.circuit_id == circuit_id)
            .map(|(info_hash, intro)| {
                intro.established = true;
                *info_hash
            })
    }

    /// Queue introduction points learned from the DHT or PEX; each address
    /// is only ever queued once per info hash
    pub fn add_pex(&mut self, info_hash: InfoHash, peers: impl IntoIterator<Item = SocketAddrV4>) -> usize {
        let seen = self.seen_pex.entry(info_hash).or_default();
        let queue = self.infohash_pex.entry(info_hash).or_default();
        let mut added = 0;
        for peer in peers {
            if seen.insert(peer) {
                queue.push_back(peer);
                added += 1;
            }
        }
        added
    }

    pub fn pop_pex(&mut self, info_hash: &InfoHash) -> Option<SocketAddrV4> {
        self.infohash_pex.get_mut(info_hash)?.pop_front()
    }

    /// Introduction points we know of for an info hash, for a key-response
    pub fn known_intro_points(&self, info_hash: &InfoHash, max: usize) -> Vec<SocketAddrV4> {
        self.seen_pex
            .get(info_hash)
            .map(|seen| seen.iter().take(max).copied().collect())
            .unwrap_or_default()
    }

    /// Drop every reference to a circuit that went away
    pub fn forget_circuit(&mut self, circuit_id: CircuitId) {
        self.intro_point_for.retain(|_, id| *id != circuit_id);
        self.rendezvous_point_for.retain(|_, id| *id != circuit_id);
        self.intro_circuits
            .retain(|_, intro| intro.circuit_id != circuit_id);
        self.rendezvous_points.remove(&circuit_id);
    }

    /// A download is no longer seeding or downloading
    pub fn forget_download(&mut self, anonymized: &InfoHash) -> Option<IntroductionCircuit> {
        self.infohash_pex.remove(anonymized);
        self.seen_pex.remove(anonymized);
        self.last_dht_lookup.remove(anonymized);
        self.intro_circuits.remove(anonymized)
    }
}
