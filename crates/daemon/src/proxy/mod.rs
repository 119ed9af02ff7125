/// SOCKS5 proxies feeding UDP traffic into the tunnel
///
/// One listener per supported hop count: the first configured port serves
/// 1-hop circuits, the second 2-hop circuits, and so on.

mod socks5;

pub use socks5::{decode_udp, encode_udp, Socks5Error, Socks5Server};

use crate::node::NodeEvent;
use anontunnel_core::Address;
use anyhow::Result;
use std::net::{IpAddr, SocketAddr};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{info, warn};

pub type SessionId = u64;

/// A datagram that came out of a circuit for a SOCKS5 session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub origin: Address,
    pub payload: Vec<u8>,
}

/// What SOCKS5 sessions tell the tunnel node
#[derive(Debug)]
pub enum SocksEvent {
    Open {
        session: SessionId,
        hops: usize,
        deliver: mpsc::Sender<Delivery>,
    },
    Datagram {
        session: SessionId,
        hops: usize,
        destination: Address,
        payload: Vec<u8>,
    },
    Close {
        session: SessionId,
    },
}

/// Runs every SOCKS5 server of the node
pub struct ProxyManager {
    servers: Vec<Socks5Server>,
}

impl ProxyManager {
    /// Bind one server per port in `ports`
    pub async fn bind(
        listen_ip: IpAddr,
        ports: &[u16],
        events: mpsc::Sender<NodeEvent>,
    ) -> Result<Self> {
        let mut servers = Vec::with_capacity(ports.len());
        for (index, port) in ports.iter().enumerate() {
            let server =
                Socks5Server::bind(SocketAddr::new(listen_ip, *port), index + 1, events.clone())
                    .await?;
            servers.push(server);
        }
        Ok(Self { servers })
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.servers
            .iter()
            .filter_map(|server| server.local_addr().ok())
            .collect()
    }

    /// Serve until one of the listeners fails
    pub async fn start(self) -> Result<()> {
        info!("Starting {} SOCKS5 proxies...", self.servers.len());

        let mut running = JoinSet::new();
        for server in self.servers {
            let hops = server.hops();
            running.spawn(async move { (hops, server.run().await) });
        }

        while let Some(finished) = running.join_next().await {
            let (hops, result) = finished?;
            if let Err(e) = result {
                warn!("SOCKS5 proxy for {}-hop circuits stopped: {}", hops, e);
                return Err(e.into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn test_one_server_per_hop_count() {
        let (tx, _rx) = mpsc::channel(4);
        let manager = ProxyManager::bind(Ipv4Addr::LOCALHOST.into(), &[0, 0, 0], tx)
            .await
            .unwrap();

        let hops: Vec<usize> = manager.servers.iter().map(|s| s.hops()).collect();
        assert_eq!(hops, vec![1, 2, 3]);
        assert_eq!(manager.local_addrs().len(), 3);
    }
}
