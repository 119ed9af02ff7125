//! Hidden services: introduction points, rendezvous points and the
//! end-to-end link between a seeder and a downloader

mod hidden;
pub mod rendezvous;

pub use rendezvous::{generate_cookie, HiddenServiceState, IntroductionCircuit, RendezvousPoint};

use crate::protocol::Cookie;
use anontunnel_common::InfoHash;
use std::net::SocketAddrV4;

/// Follow-up run once a circuit becomes ready
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyHook {
    /// Register the circuit's last hop as introduction point
    EstablishIntro { info_hash: InfoHash },

    /// Register the circuit's last hop as rendezvous point, using the
    /// pending `RendezvousPoint` stored for the circuit
    EstablishRendezvous,

    /// Ask the rendezvous point to splice us onto the seeder's circuit
    LinkE2e { cookie: Cookie, info_hash: InfoHash },
}

/// What the torrent client reports about one download
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Downloading,
    Seeding,
    Stopped,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadState {
    /// Real info hash of the torrent
    pub info_hash: InfoHash,
    pub hops: usize,
    pub status: DownloadStatus,

    /// Peers the download is connected to
    pub peers: Vec<SocketAddrV4>,
}
