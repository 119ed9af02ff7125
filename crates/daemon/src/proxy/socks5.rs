/// SOCKS5 front end for the tunnel
///
/// Only UDP ASSOCIATE is carried through circuits. Each server instance is
/// bound to one hop count; datagrams its sessions send are handed to the
/// tunnel node and replies come back on the session's delivery channel.

use super::{Delivery, SessionId, SocksEvent};
use crate::node::NodeEvent;
use anontunnel_core::Address;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// SOCKS5 protocol constants
const SOCKS_VERSION: u8 = 0x05;
const NO_AUTH_REQUIRED: u8 = 0x00;
const NO_ACCEPTABLE_METHODS: u8 = 0xFF;
const CONNECT_COMMAND: u8 = 0x01;
const BIND_COMMAND: u8 = 0x02;
const UDP_ASSOCIATE_COMMAND: u8 = 0x03;
const IPV4_ADDRESS: u8 = 0x01;
const DOMAIN_NAME: u8 = 0x03;
const IPV6_ADDRESS: u8 = 0x04;

/// Reply codes
const SUCCESS: u8 = 0x00;
const GENERAL_FAILURE: u8 = 0x01;
const HOST_UNREACHABLE: u8 = 0x04;
const COMMAND_NOT_SUPPORTED: u8 = 0x07;
const ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

const MAX_DATAGRAM: usize = 65_535;
const DELIVERY_QUEUE: usize = 256;

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Error)]
pub enum Socks5Error {
    #[error("Unsupported SOCKS version: {0}")]
    Version(u8),

    #[error("No acceptable auth methods")]
    NoAcceptableAuth,

    #[error("Unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("IPv6 destinations are not supported")]
    Ipv6Unsupported,

    #[error("Unsupported address type: {0}")]
    AddressType(u8),

    #[error("Fragmented UDP datagrams are not supported")]
    Fragmented,

    #[error("Truncated SOCKS5 message")]
    Truncated,

    #[error("Invalid domain name")]
    InvalidDomain,

    #[error("Tunnel node is gone")]
    NodeGone,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Socks5Error {
    /// Reply code reported to the client for a failed request
    fn reply_code(&self) -> u8 {
        match self {
            Self::UnsupportedCommand(_) => COMMAND_NOT_SUPPORTED,
            Self::Ipv6Unsupported | Self::AddressType(_) => ADDRESS_TYPE_NOT_SUPPORTED,
            _ => GENERAL_FAILURE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Bind,
    UdpAssociate,
}

impl Command {
    fn from_byte(byte: u8) -> Result<Self, Socks5Error> {
        match byte {
            CONNECT_COMMAND => Ok(Self::Connect),
            BIND_COMMAND => Ok(Self::Bind),
            UDP_ASSOCIATE_COMMAND => Ok(Self::UdpAssociate),
            other => Err(Socks5Error::UnsupportedCommand(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub address: Address,
}

/// SOCKS5 server for one hop count
pub struct Socks5Server {
    listener: TcpListener,
    hops: usize,
    events: mpsc::Sender<NodeEvent>,
}

impl Socks5Server {
    pub async fn bind(
        listen_addr: SocketAddr,
        hops: usize,
        events: mpsc::Sender<NodeEvent>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(listen_addr).await?;
        Ok(Self {
            listener,
            hops,
            events,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn hops(&self) -> usize {
        self.hops
    }

    /// Accept clients until the listener fails
    pub async fn run(self) -> std::io::Result<()> {
        info!(
            "SOCKS5 proxy for {}-hop circuits listening on {}",
            self.hops,
            self.listener.local_addr()?
        );

        loop {
            let (socket, addr) = self.listener.accept().await?;
            debug!("SOCKS5: New connection from {}", addr);

            let events = self.events.clone();
            let hops = self.hops;
            tokio::spawn(async move {
                if let Err(e) = handle_client(socket, hops, events).await {
                    debug!("SOCKS5 session from {} ended: {}", addr, e);
                }
            });
        }
    }
}

/// Handle a SOCKS5 client connection
async fn handle_client(
    mut stream: TcpStream,
    hops: usize,
    events: mpsc::Sender<NodeEvent>,
) -> Result<(), Socks5Error> {
    negotiate_auth(&mut stream).await?;

    let request = match read_request(&mut stream).await {
        Ok(request) => request,
        Err(e @ (Socks5Error::Io(_) | Socks5Error::Truncated)) => return Err(e),
        Err(e) => {
            send_reply(&mut stream, e.reply_code(), unspecified()).await?;
            return Err(e);
        }
    };

    match request.command {
        Command::Connect => {
            debug!("SOCKS5: TCP CONNECT to {} is not tunnelled", request.address);
            send_reply(&mut stream, HOST_UNREACHABLE, unspecified()).await?;
            Ok(())
        }
        Command::Bind => {
            // Reported as granted; nothing is ever accepted on it
            send_reply(&mut stream, SUCCESS, unspecified()).await?;
            Ok(())
        }
        Command::UdpAssociate => udp_associate(stream, hops, events).await,
    }
}

/// Greeting: pick NO_AUTH or refuse the client
async fn negotiate_auth(stream: &mut TcpStream) -> Result<(), Socks5Error> {
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;

    if buf[0] != SOCKS_VERSION {
        return Err(Socks5Error::Version(buf[0]));
    }

    let mut methods = vec![0u8; buf[1] as usize];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&NO_AUTH_REQUIRED) {
        stream.write_all(&[SOCKS_VERSION, NO_ACCEPTABLE_METHODS]).await?;
        return Err(Socks5Error::NoAcceptableAuth);
    }

    stream.write_all(&[SOCKS_VERSION, NO_AUTH_REQUIRED]).await?;
    Ok(())
}

async fn read_request(stream: &mut TcpStream) -> Result<Request, Socks5Error> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;

    if header[0] != SOCKS_VERSION {
        return Err(Socks5Error::Version(header[0]));
    }

    let address = match header[3] {
        IPV4_ADDRESS => {
            let mut buf = [0u8; 6];
            stream.read_exact(&mut buf).await?;
            Address::Ipv4(SocketAddrV4::new(
                Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]),
                u16::from_be_bytes([buf[4], buf[5]]),
            ))
        }
        DOMAIN_NAME => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut domain = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut domain).await?;
            let port = u16::from_be_bytes([domain[domain.len() - 2], domain[domain.len() - 1]]);
            domain.truncate(domain.len() - 2);
            domain_address(domain, port)?
        }
        IPV6_ADDRESS => {
            let mut buf = [0u8; 18];
            stream.read_exact(&mut buf).await?;
            return Err(Socks5Error::Ipv6Unsupported);
        }
        other => return Err(Socks5Error::AddressType(other)),
    };

    // Unknown commands are reported only after the whole request was read
    let command = Command::from_byte(header[1])?;
    Ok(Request { command, address })
}

fn domain_address(domain: Vec<u8>, port: u16) -> Result<Address, Socks5Error> {
    let host = String::from_utf8(domain).map_err(|_| Socks5Error::InvalidDomain)?;
    if host.is_empty() {
        return Err(Socks5Error::InvalidDomain);
    }
    Address::domain(host, port).map_err(|_| Socks5Error::InvalidDomain)
}

fn unspecified() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
}

/// Send a SOCKS5 reply to the client
async fn send_reply(
    stream: &mut TcpStream,
    reply_code: u8,
    bound: SocketAddr,
) -> Result<(), Socks5Error> {
    // VER | REP | RSV | ATYP | BND.ADDR | BND.PORT
    let ip = match bound.ip() {
        IpAddr::V4(ip) => ip,
        IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
    };
    let mut reply = vec![SOCKS_VERSION, reply_code, 0x00, IPV4_ADDRESS];
    reply.extend_from_slice(&ip.octets());
    reply.extend_from_slice(&bound.port().to_be_bytes());

    stream.write_all(&reply).await?;
    Ok(())
}

/// Split a client datagram into its destination and payload
pub fn decode_udp(packet: &[u8]) -> Result<(Address, &[u8]), Socks5Error> {
    if packet.len() < 4 {
        return Err(Socks5Error::Truncated);
    }
    if packet[2] != 0 {
        return Err(Socks5Error::Fragmented);
    }

    let rest = &packet[4..];
    match packet[3] {
        IPV4_ADDRESS => {
            if rest.len() < 6 {
                return Err(Socks5Error::Truncated);
            }
            let addr = SocketAddrV4::new(
                Ipv4Addr::new(rest[0], rest[1], rest[2], rest[3]),
                u16::from_be_bytes([rest[4], rest[5]]),
            );
            Ok((Address::Ipv4(addr), &rest[6..]))
        }
        DOMAIN_NAME => {
            let len = *rest.first().ok_or(Socks5Error::Truncated)? as usize;
            if rest.len() < 1 + len + 2 {
                return Err(Socks5Error::Truncated);
            }
            let port = u16::from_be_bytes([rest[1 + len], rest[2 + len]]);
            let address = domain_address(rest[1..1 + len].to_vec(), port)?;
            Ok((address, &rest[3 + len..]))
        }
        IPV6_ADDRESS => Err(Socks5Error::Ipv6Unsupported),
        other => Err(Socks5Error::AddressType(other)),
    }
}

/// Frame a datagram from `origin` for the client
pub fn encode_udp(origin: &Address, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(payload.len() + 10);
    packet.extend_from_slice(&[0, 0, 0]);
    match origin {
        Address::Ipv4(addr) => {
            packet.push(IPV4_ADDRESS);
            packet.extend_from_slice(&addr.ip().octets());
            packet.extend_from_slice(&addr.port().to_be_bytes());
        }
        Address::Domain(host, port) if host.len() <= u8::MAX as usize => {
            packet.push(DOMAIN_NAME);
            packet.push(host.len() as u8);
            packet.extend_from_slice(host.as_bytes());
            packet.extend_from_slice(&port.to_be_bytes());
        }
        Address::Domain(_, port) => {
            // too long for SOCKS5; the client only learns the port
            packet.push(IPV4_ADDRESS);
            packet.extend_from_slice(&Ipv4Addr::UNSPECIFIED.octets());
            packet.extend_from_slice(&port.to_be_bytes());
        }
    }
    packet.extend_from_slice(payload);
    packet
}

/// Relay datagrams for the lifetime of the control connection
async fn udp_associate(
    mut stream: TcpStream,
    hops: usize,
    events: mpsc::Sender<NodeEvent>,
) -> Result<(), Socks5Error> {
    let local_ip = stream.local_addr()?.ip();
    let relay = match UdpSocket::bind(SocketAddr::new(local_ip, 0)).await {
        Ok(relay) => relay,
        Err(e) => {
            send_reply(&mut stream, GENERAL_FAILURE, unspecified()).await?;
            return Err(e.into());
        }
    };
    let relay_addr = relay.local_addr()?;
    let client_ip = stream.peer_addr()?.ip();

    let session: SessionId = NEXT_SESSION.fetch_add(1, Ordering::Relaxed);
    let (deliver_tx, mut deliver_rx) = mpsc::channel::<Delivery>(DELIVERY_QUEUE);
    events
        .send(NodeEvent::Socks(SocksEvent::Open {
            session,
            hops,
            deliver: deliver_tx,
        }))
        .await
        .map_err(|_| Socks5Error::NodeGone)?;

    send_reply(&mut stream, SUCCESS, relay_addr).await?;
    info!("SOCKS5: UDP session {} relaying on {}", session, relay_addr);

    let result = relay_datagrams(
        &mut stream,
        &relay,
        client_ip,
        session,
        hops,
        &events,
        &mut deliver_rx,
    )
    .await;

    let _ = events
        .send(NodeEvent::Socks(SocksEvent::Close { session }))
        .await;
    info!("SOCKS5: UDP session {} closed", session);
    result
}

async fn relay_datagrams(
    stream: &mut TcpStream,
    relay: &UdpSocket,
    client_ip: IpAddr,
    session: SessionId,
    hops: usize,
    events: &mpsc::Sender<NodeEvent>,
    deliveries: &mut mpsc::Receiver<Delivery>,
) -> Result<(), Socks5Error> {
    let mut control = [0u8; 64];
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut client: Option<SocketAddr> = None;

    loop {
        tokio::select! {
            read = stream.read(&mut control) => {
                match read {
                    Ok(0) => return Ok(()),
                    Ok(_) => continue,
                    Err(e) => return Err(e.into()),
                }
            }
            received = relay.recv_from(&mut buf) => {
                let (len, from) = received?;
                if from.ip() != client_ip {
                    debug!("SOCKS5: Ignoring datagram from stranger {}", from);
                    continue;
                }
                client = Some(from);

                let (destination, payload) = match decode_udp(&buf[..len]) {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        debug!("SOCKS5: Dropping datagram from {}: {}", from, e);
                        continue;
                    }
                };
                let event = NodeEvent::Socks(SocksEvent::Datagram {
                    session,
                    hops,
                    destination,
                    payload: payload.to_vec(),
                });
                if events.send(event).await.is_err() {
                    return Err(Socks5Error::NodeGone);
                }
            }
            delivery = deliveries.recv() => {
                let Some(delivery) = delivery else {
                    return Err(Socks5Error::NodeGone);
                };
                let Some(client) = client else {
                    warn!("SOCKS5: Datagram for session {} before the client spoke", session);
                    continue;
                };
                let packet = encode_udp(&delivery.origin, &delivery.payload);
                if let Err(e) = relay.send_to(&packet, client).await {
                    error!("SOCKS5: Failed to deliver to {}: {}", client, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    async fn server(hops: usize) -> (SocketAddr, mpsc::Receiver<NodeEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let server = Socks5Server::bind("127.0.0.1:0".parse().unwrap(), hops, tx)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        (addr, rx)
    }

    async fn greet(addr: SocketAddr) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&[5, 1, 0]).await.unwrap();
        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [5, 0]);
        stream
    }

    async fn reply_code(stream: &mut TcpStream) -> (u8, SocketAddr) {
        let mut reply = [0u8; 10];
        stream.read_exact(&mut reply).await.unwrap();
        let bound = SocketAddr::from((
            [reply[4], reply[5], reply[6], reply[7]],
            u16::from_be_bytes([reply[8], reply[9]]),
        ));
        (reply[1], bound)
    }

    #[test]
    fn test_decode_ipv4_datagram() {
        let packet = [0, 0, 0, 1, 203, 0, 113, 5, 0, 7, b'h', b'i'];
        let (address, payload) = decode_udp(&packet).unwrap();
        assert_eq!(address, Address::Ipv4("203.0.113.5:7".parse().unwrap()));
        assert_eq!(payload, b"hi");
    }

    #[test]
    fn test_decode_domain_datagram() {
        let mut packet = vec![0, 0, 0, 3, 11];
        packet.extend_from_slice(b"example.com");
        packet.extend_from_slice(&6881u16.to_be_bytes());
        packet.push(0xAB);

        let (address, payload) = decode_udp(&packet).unwrap();
        assert_eq!(address, Address::Domain("example.com".to_string(), 6881));
        assert_eq!(payload, [0xAB]);
        assert_eq!(encode_udp(&address, payload), packet);
    }

    #[test]
    fn test_decode_rejects_bad_datagrams() {
        assert!(matches!(decode_udp(&[0, 0]), Err(Socks5Error::Truncated)));
        assert!(matches!(
            decode_udp(&[0, 0, 1, 1, 1, 2, 3, 4, 0, 80]),
            Err(Socks5Error::Fragmented)
        ));
        assert!(matches!(
            decode_udp(&[0, 0, 0, 4, 0, 0]),
            Err(Socks5Error::Ipv6Unsupported)
        ));
        assert!(matches!(decode_udp(&[0, 0, 0, 1, 1, 2]), Err(Socks5Error::Truncated)));
    }

    #[tokio::test]
    async fn test_udp_associate_session() {
        let (addr, mut events) = server(2).await;
        let mut stream = greet(addr).await;
        stream.write_all(&[5, 3, 0, 1, 0, 0, 0, 0, 0, 0]).await.unwrap();
        let (code, relay_addr) = reply_code(&mut stream).await;
        assert_eq!(code, SUCCESS);

        let Some(NodeEvent::Socks(SocksEvent::Open { session, hops, deliver })) =
            timeout(WAIT, events.recv()).await.unwrap()
        else {
            panic!("expected a session to open");
        };
        assert_eq!(hops, 2);

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let destination = Address::Ipv4("203.0.113.5:7".parse().unwrap());
        client
            .send_to(&encode_udp(&destination, b"ping"), relay_addr)
            .await
            .unwrap();

        match timeout(WAIT, events.recv()).await.unwrap() {
            Some(NodeEvent::Socks(SocksEvent::Datagram {
                session: from_session,
                hops,
                destination: sent_to,
                payload,
            })) => {
                assert_eq!(from_session, session);
                assert_eq!(hops, 2);
                assert_eq!(sent_to, destination);
                assert_eq!(payload, b"ping");
            }
            _ => panic!("expected a datagram"),
        }

        deliver
            .send(Delivery {
                origin: destination.clone(),
                payload: b"pong".to_vec(),
            })
            .await
            .unwrap();
        let mut buf = [0u8; 128];
        let (len, _) = timeout(WAIT, client.recv_from(&mut buf)).await.unwrap().unwrap();
        let (origin, payload) = decode_udp(&buf[..len]).unwrap();
        assert_eq!(origin, destination);
        assert_eq!(payload, b"pong");

        drop(stream);
        match timeout(WAIT, events.recv()).await.unwrap() {
            Some(NodeEvent::Socks(SocksEvent::Close { session: closed })) => {
                assert_eq!(closed, session)
            }
            _ => panic!("expected the session to close"),
        }
    }

    #[tokio::test]
    async fn test_connect_is_refused() {
        let (addr, _events) = server(1).await;
        let mut stream = greet(addr).await;
        stream
            .write_all(&[5, 1, 0, 1, 203, 0, 113, 5, 0, 80])
            .await
            .unwrap();
        assert_eq!(reply_code(&mut stream).await.0, HOST_UNREACHABLE);
    }

    #[tokio::test]
    async fn test_bind_reports_success() {
        let (addr, _events) = server(1).await;
        let mut stream = greet(addr).await;
        stream.write_all(&[5, 2, 0, 1, 0, 0, 0, 0, 0, 0]).await.unwrap();
        assert_eq!(reply_code(&mut stream).await.0, SUCCESS);
    }

    #[tokio::test]
    async fn test_ipv6_is_rejected() {
        let (addr, _events) = server(1).await;
        let mut stream = greet(addr).await;
        let mut request = vec![5, 3, 0, 4];
        request.extend_from_slice(&[0u8; 18]);
        stream.write_all(&request).await.unwrap();
        assert_eq!(reply_code(&mut stream).await.0, ADDRESS_TYPE_NOT_SUPPORTED);
    }

    #[tokio::test]
    async fn test_auth_required_client_is_refused() {
        let (addr, _events) = server(1).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&[5, 1, 2]).await.unwrap();
        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [5, NO_ACCEPTABLE_METHODS]);
    }
}
