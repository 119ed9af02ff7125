/// Anonymous tunnel daemon library
///
/// Hosts the sans-IO tunnel community on tokio: the overlay socket, exit
/// sockets, SOCKS5 front ends and the DHT/torrent collaborators.

pub mod collab;
pub mod node;
pub mod proxy;

pub use collab::{DhtClient, LocalDht, NoTorrents, TorrentClient};
pub use node::{load_or_generate_identity, NodeEvent, NodeHandle, TunnelNode};
pub use proxy::{ProxyManager, Socks5Error, Socks5Server};
