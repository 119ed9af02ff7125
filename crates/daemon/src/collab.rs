//! Services the tunnel node leans on but does not implement: a DHT for
//! introduction-point discovery and the torrent client whose downloads are
//! being anonymised.

use anontunnel_common::InfoHash;
use anontunnel_core::DownloadState;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::RwLock;
use tracing::debug;

/// Mainline-style DHT, as far as hidden services need one
pub trait DhtClient: Send + Sync {
    fn lookup(&self, info_hash: &InfoHash) -> Vec<SocketAddrV4>;

    /// Announce this node on `port`; the DHT fills in the address it sees
    fn announce(&self, info_hash: InfoHash, port: u16);
}

/// In-process DHT shared by the nodes of one process
#[derive(Debug, Default)]
pub struct LocalDht {
    peers: RwLock<HashMap<InfoHash, Vec<SocketAddrV4>>>,
}

impl LocalDht {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DhtClient for LocalDht {
    fn lookup(&self, info_hash: &InfoHash) -> Vec<SocketAddrV4> {
        match self.peers.read() {
            Ok(peers) => peers.get(info_hash).cloned().unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    fn announce(&self, info_hash: InfoHash, port: u16) {
        let peer = SocketAddrV4::new(Ipv4Addr::LOCALHOST, port);
        if let Ok(mut peers) = self.peers.write() {
            let entry = peers.entry(info_hash).or_default();
            if !entry.contains(&peer) {
                entry.push(peer);
            }
        }
        debug!("Announced {} on port {}", info_hash, port);
    }
}

/// The torrent client that owns the anonymous downloads
pub trait TorrentClient: Send + Sync {
    fn downloads(&self) -> Vec<DownloadState>;

    fn add_peer(&self, info_hash: InfoHash, peer: SocketAddrV4);
}

/// Stand-in when no torrent client is attached
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTorrents;

impl TorrentClient for NoTorrents {
    fn downloads(&self) -> Vec<DownloadState> {
        Vec::new()
    }

    fn add_peer(&self, info_hash: InfoHash, peer: SocketAddrV4) {
        debug!("No torrent client for {}, dropping peer {}", info_hash, peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_dht_announce_and_lookup() {
        let dht = LocalDht::new();
        let info_hash = InfoHash::from_bytes([7; 20]);
        assert!(dht.lookup(&info_hash).is_empty());

        dht.announce(info_hash, 7759);
        dht.announce(info_hash, 7759);
        dht.announce(info_hash, 7760);

        let peers = dht.lookup(&info_hash);
        assert_eq!(
            peers,
            vec![
                SocketAddrV4::new(Ipv4Addr::LOCALHOST, 7759),
                SocketAddrV4::new(Ipv4Addr::LOCALHOST, 7760),
            ]
        );
    }

    #[test]
    fn test_no_torrents_is_empty() {
        assert!(NoTorrents.downloads().is_empty());
    }
}
