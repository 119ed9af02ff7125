use super::wire::{CodecError, CodecResult, Reader, Writer};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

const ADDRESS_TYPE_IPV4: u8 = 0x01;
const ADDRESS_TYPE_DOMAIN: u8 = 0x02;

/// Source or destination carried inside a data message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Ipv4(SocketAddrV4),
    Domain(String, u16),
}

impl Address {
    /// Placeholder used where the sender has nothing meaningful to say
    pub fn unspecified() -> Self {
        Address::Ipv4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
    }

    /// Build a hostname address, rejecting names that do not fit the length field
    pub fn domain(host: impl Into<String>, port: u16) -> CodecResult<Self> {
        let host = host.into();
        if host.len() > u16::MAX as usize {
            return Err(CodecError::Oversize(host.len()));
        }
        Ok(Address::Domain(host, port))
    }

    pub fn port(&self) -> u16 {
        match self {
            Address::Ipv4(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    pub fn as_socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Address::Ipv4(addr) => Some(SocketAddr::V4(*addr)),
            Address::Domain(..) => None,
        }
    }

    pub fn write(&self, w: &mut Writer) {
        match self {
            Address::Ipv4(addr) => {
                w.u8(ADDRESS_TYPE_IPV4)
                    .bytes(&addr.ip().octets())
                    .u16(addr.port());
            }
            Address::Domain(host, port) => {
                w.u8(ADDRESS_TYPE_DOMAIN)
                    .u16(host.len() as u16)
                    .bytes(host.as_bytes())
                    .u16(*port);
            }
        }
    }

    pub fn read(r: &mut Reader<'_>) -> CodecResult<Self> {
        match r.u8()? {
            ADDRESS_TYPE_IPV4 => Ok(Address::Ipv4(read_ipv4(r)?)),
            ADDRESS_TYPE_DOMAIN => {
                let len = r.u16()? as usize;
                let host = std::str::from_utf8(r.bytes(len)?)
                    .map_err(|_| CodecError::InvalidHostname)?
                    .to_string();
                Ok(Address::Domain(host, r.u16()?))
            }
            other => Err(CodecError::UnknownAddressType(other)),
        }
    }
}

impl From<SocketAddrV4> for Address {
    fn from(addr: SocketAddrV4) -> Self {
        Address::Ipv4(addr)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ipv4(addr) => write!(f, "{}", addr),
            Address::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

/// `ipv4:4 ∥ port:u16`, the compact form used for peer lists
pub fn write_ipv4(w: &mut Writer, addr: &SocketAddrV4) {
    w.bytes(&addr.ip().octets()).u16(addr.port());
}

pub fn read_ipv4(r: &mut Reader<'_>) -> CodecResult<SocketAddrV4> {
    let ip = Ipv4Addr::from(r.array::<4>()?);
    Ok(SocketAddrV4::new(ip, r.u16()?))
}

/// IPv4 form of a socket address, if it has one
pub fn to_ipv4(addr: &SocketAddr) -> Option<SocketAddrV4> {
    match addr {
        SocketAddr::V4(v4) => Some(*v4),
        SocketAddr::V6(v6) => v6.ip().to_ipv4_mapped().map(|ip| SocketAddrV4::new(ip, v6.port())),
    }
}
