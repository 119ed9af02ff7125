use super::address::{read_ipv4, write_ipv4, Address};
use super::wire::{CodecError, CodecResult, Reader, Writer};
use crate::circuit::AUTH_LEN;
use crate::identity::{NodeId, PublicKey, NODE_ID_LEN, PUBLIC_KEY_LEN};
use anontunnel_common::{protocol::MAX_PEX_PEERS, InfoHash, INFO_HASH_LEN};
use std::net::SocketAddrV4;

/// Length of a rendezvous cookie
pub const COOKIE_LEN: usize = 20;

pub type Cookie = [u8; COOKIE_LEN];

/// Type byte of a cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Create = 1,
    Created = 2,
    Extend = 3,
    Extended = 4,
    Ping = 5,
    Pong = 6,
    Destroy = 7,
    Data = 8,
    EstablishIntro = 10,
    IntroEstablished = 11,
    KeyRequest = 12,
    KeyResponse = 13,
    EstablishRendezvous = 14,
    RendezvousEstablished = 15,
    CreateE2e = 16,
    CreatedE2e = 17,
    LinkE2e = 18,
    LinkedE2e = 19,
    DhtRequest = 20,
    DhtResponse = 21,
}

impl MessageType {
    /// Messages that travel between neighbours without onion layers
    pub fn is_cleartext(&self) -> bool {
        matches!(self, Self::Create | Self::Created | Self::Destroy)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Created => "created",
            Self::Extend => "extend",
            Self::Extended => "extended",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Destroy => "destroy",
            Self::Data => "data",
            Self::EstablishIntro => "establish-intro",
            Self::IntroEstablished => "intro-established",
            Self::KeyRequest => "key-request",
            Self::KeyResponse => "key-response",
            Self::EstablishRendezvous => "establish-rendezvous",
            Self::RendezvousEstablished => "rendezvous-established",
            Self::CreateE2e => "create-e2e",
            Self::CreatedE2e => "created-e2e",
            Self::LinkE2e => "link-e2e",
            Self::LinkedE2e => "linked-e2e",
            Self::DhtRequest => "dht-request",
            Self::DhtResponse => "dht-response",
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::Create,
            2 => Self::Created,
            3 => Self::Extend,
            4 => Self::Extended,
            5 => Self::Ping,
            6 => Self::Pong,
            7 => Self::Destroy,
            8 => Self::Data,
            10 => Self::EstablishIntro,
            11 => Self::IntroEstablished,
            12 => Self::KeyRequest,
            13 => Self::KeyResponse,
            14 => Self::EstablishRendezvous,
            15 => Self::RendezvousEstablished,
            16 => Self::CreateE2e,
            17 => Self::CreatedE2e,
            18 => Self::LinkE2e,
            19 => Self::LinkedE2e,
            20 => Self::DhtRequest,
            21 => Self::DhtResponse,
            other => return Err(CodecError::UnknownType(other)),
        })
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Field helpers
// ============================================================================

fn read_key(r: &mut Reader<'_>, len: usize) -> CodecResult<PublicKey> {
    if len != PUBLIC_KEY_LEN {
        return Err(CodecError::BadKeyLength(len));
    }
    let bytes = r.bytes(len)?;
    PublicKey::from_slice(bytes).map_err(|_| CodecError::BadKeyLength(len))
}

fn read_info_hash(r: &mut Reader<'_>) -> CodecResult<InfoHash> {
    Ok(InfoHash::from_bytes(r.array::<INFO_HASH_LEN>()?))
}

fn read_node_id(r: &mut Reader<'_>) -> CodecResult<NodeId> {
    Ok(NodeId::from_bytes(r.array::<NODE_ID_LEN>()?))
}

fn read_peers(r: &mut Reader<'_>) -> CodecResult<Vec<SocketAddrV4>> {
    if r.remaining() % 6 != 0 {
        return Err(CodecError::TrailingData(r.remaining() % 6));
    }
    let mut peers = Vec::with_capacity(r.remaining() / 6);
    while r.remaining() > 0 {
        peers.push(read_ipv4(r)?);
    }
    Ok(peers)
}

/// Public keys offered by a hop for the next extension, `len:u16 ∥ key` each
pub fn encode_candidate_list(keys: &[PublicKey]) -> Vec<u8> {
    let mut w = Writer::new();
    for key in keys {
        w.u16(PUBLIC_KEY_LEN as u16).bytes(key.as_bytes());
    }
    w.into_inner()
}

pub fn decode_candidate_list(bytes: &[u8]) -> CodecResult<Vec<PublicKey>> {
    let mut r = Reader::new(bytes);
    let mut keys = Vec::new();
    while r.remaining() > 0 {
        let len = r.u16()? as usize;
        keys.push(read_key(&mut r, len)?);
    }
    Ok(keys)
}

// ============================================================================
// Circuit messages
// ============================================================================

/// `circuit_id ∥ len_pk:u16 ∥ len_key:u16 ∥ node_id:20 ∥ node_public_key ∥ X`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateMessage {
    pub circuit_id: u32,
    pub node_id: NodeId,
    pub node_public_key: PublicKey,
    pub key: PublicKey,
}

impl CreateMessage {
    fn write(&self, w: &mut Writer) {
        w.u32(self.circuit_id)
            .u16(PUBLIC_KEY_LEN as u16)
            .u16(PUBLIC_KEY_LEN as u16)
            .bytes(self.node_id.as_bytes())
            .bytes(self.node_public_key.as_bytes())
            .bytes(self.key.as_bytes());
    }

    fn read(r: &mut Reader<'_>) -> CodecResult<Self> {
        let circuit_id = r.u32()?;
        let len_pk = r.u16()? as usize;
        let len_key = r.u16()? as usize;
        let node_id = read_node_id(r)?;
        let node_public_key = read_key(r, len_pk)?;
        let key = read_key(r, len_key)?;
        Ok(Self {
            circuit_id,
            node_id,
            node_public_key,
            key,
        })
    }
}

/// Reply to create or extend:
/// `circuit_id ∥ len_key:u16 ∥ auth:32 ∥ Y ∥ candidate_list_cipher`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedMessage {
    pub circuit_id: u32,
    pub key: PublicKey,
    pub auth: [u8; AUTH_LEN],
    pub candidate_list_enc: Vec<u8>,
}

impl CreatedMessage {
    fn write(&self, w: &mut Writer) {
        w.u32(self.circuit_id)
            .u16(PUBLIC_KEY_LEN as u16)
            .bytes(&self.auth)
            .bytes(self.key.as_bytes())
            .bytes(&self.candidate_list_enc);
    }

    fn read(r: &mut Reader<'_>) -> CodecResult<Self> {
        let circuit_id = r.u32()?;
        let len_key = r.u16()? as usize;
        let auth = r.array::<AUTH_LEN>()?;
        let key = read_key(r, len_key)?;
        Ok(Self {
            circuit_id,
            key,
            auth,
            candidate_list_enc: r.rest().to_vec(),
        })
    }
}

/// Create framing plus an optional `addr:4+2` for a hop the relay may not know
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendMessage {
    pub circuit_id: u32,
    pub node_id: NodeId,
    pub node_public_key: PublicKey,
    pub key: PublicKey,
    pub node_addr: Option<SocketAddrV4>,
}

impl ExtendMessage {
    fn write(&self, w: &mut Writer) {
        CreateMessage {
            circuit_id: self.circuit_id,
            node_id: self.node_id,
            node_public_key: self.node_public_key,
            key: self.key,
        }
        .write(w);
        if let Some(addr) = &self.node_addr {
            write_ipv4(w, addr);
        }
    }

    fn read(r: &mut Reader<'_>) -> CodecResult<Self> {
        let create = CreateMessage::read(r)?;
        let node_addr = if r.remaining() > 0 {
            Some(read_ipv4(r)?)
        } else {
            None
        };
        Ok(Self {
            circuit_id: create.circuit_id,
            node_id: create.node_id,
            node_public_key: create.node_public_key,
            key: create.key,
            node_addr,
        })
    }
}

/// Ping and pong share `circuit_id ∥ identifier:u16`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingMessage {
    pub circuit_id: u32,
    pub identifier: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestroyMessage {
    pub circuit_id: u32,
    pub reason: u16,
}

/// `circuit_id ∥ dest_addr ∥ src_addr ∥ payload`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMessage {
    pub circuit_id: u32,
    pub destination: Address,
    pub origin: Address,
    pub payload: Vec<u8>,
}

impl DataMessage {
    fn write(&self, w: &mut Writer) {
        w.u32(self.circuit_id);
        self.destination.write(w);
        self.origin.write(w);
        w.bytes(&self.payload);
    }

    fn read(r: &mut Reader<'_>) -> CodecResult<Self> {
        Ok(Self {
            circuit_id: r.u32()?,
            destination: Address::read(r)?,
            origin: Address::read(r)?,
            payload: r.rest().to_vec(),
        })
    }
}

// ============================================================================
// Hidden-service messages
// ============================================================================

/// Carried by establish-intro, key-request and dht-request:
/// `circuit_id ∥ identifier:u16 ∥ info_hash:20`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InfoHashRequest {
    pub circuit_id: u32,
    pub identifier: u16,
    pub info_hash: InfoHash,
}

impl InfoHashRequest {
    fn write(&self, w: &mut Writer) {
        w.u32(self.circuit_id)
            .u16(self.identifier)
            .bytes(self.info_hash.as_bytes());
    }

    fn read(r: &mut Reader<'_>) -> CodecResult<Self> {
        Ok(Self {
            circuit_id: r.u32()?,
            identifier: r.u16()?,
            info_hash: read_info_hash(r)?,
        })
    }
}

/// Carried by intro-established and linked-e2e: `circuit_id ∥ identifier:u16`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acknowledgement {
    pub circuit_id: u32,
    pub identifier: u16,
}

/// Carried by establish-rendezvous and link-e2e: `circuit_id ∥ identifier ∥ cookie:20`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CookieMessage {
    pub circuit_id: u32,
    pub identifier: u16,
    pub cookie: Cookie,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RendezvousEstablishedMessage {
    pub circuit_id: u32,
    pub identifier: u16,
    pub rendezvous_point_addr: SocketAddrV4,
}

/// `identifier ∥ len_pk:u16 ∥ public_key ∥ (ipv4 ∥ port)*`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyResponseMessage {
    pub identifier: u16,
    pub public_key: PublicKey,
    pub pex_peers: Vec<SocketAddrV4>,
}

impl KeyResponseMessage {
    fn write(&self, w: &mut Writer) {
        w.u16(self.identifier)
            .u16(PUBLIC_KEY_LEN as u16)
            .bytes(self.public_key.as_bytes());
        for peer in self.pex_peers.iter().take(MAX_PEX_PEERS) {
            write_ipv4(w, peer);
        }
    }

    fn read(r: &mut Reader<'_>) -> CodecResult<Self> {
        let identifier = r.u16()?;
        let len = r.u16()? as usize;
        let public_key = read_key(r, len)?;
        let pex_peers = read_peers(r)?;
        if pex_peers.len() > MAX_PEX_PEERS {
            return Err(CodecError::Oversize(pex_peers.len()));
        }
        Ok(Self {
            identifier,
            public_key,
            pex_peers,
        })
    }
}

/// `identifier ∥ info_hash ∥ node_id ∥ len_pk:u16 ∥ node_public_key ∥ len_key:u16 ∥ X`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateE2eMessage {
    pub identifier: u16,
    pub info_hash: InfoHash,
    pub node_id: NodeId,
    pub node_public_key: PublicKey,
    pub key: PublicKey,
}

impl CreateE2eMessage {
    fn write(&self, w: &mut Writer) {
        w.u16(self.identifier)
            .bytes(self.info_hash.as_bytes())
            .bytes(self.node_id.as_bytes())
            .u16(PUBLIC_KEY_LEN as u16)
            .bytes(self.node_public_key.as_bytes())
            .u16(PUBLIC_KEY_LEN as u16)
            .bytes(self.key.as_bytes());
    }

    fn read(r: &mut Reader<'_>) -> CodecResult<Self> {
        let identifier = r.u16()?;
        let info_hash = read_info_hash(r)?;
        let node_id = read_node_id(r)?;
        let len_pk = r.u16()? as usize;
        let node_public_key = read_key(r, len_pk)?;
        let len_key = r.u16()? as usize;
        let key = read_key(r, len_key)?;
        Ok(Self {
            identifier,
            info_hash,
            node_id,
            node_public_key,
            key,
        })
    }
}

/// `identifier ∥ len_key:u16 ∥ Y ∥ auth:32 ∥ rp_info_cipher`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedE2eMessage {
    pub identifier: u16,
    pub key: PublicKey,
    pub auth: [u8; AUTH_LEN],
    pub rp_info_enc: Vec<u8>,
}

impl CreatedE2eMessage {
    fn write(&self, w: &mut Writer) {
        w.u16(self.identifier)
            .u16(PUBLIC_KEY_LEN as u16)
            .bytes(self.key.as_bytes())
            .bytes(&self.auth)
            .bytes(&self.rp_info_enc);
    }

    fn read(r: &mut Reader<'_>) -> CodecResult<Self> {
        let identifier = r.u16()?;
        let len_key = r.u16()? as usize;
        let key = read_key(r, len_key)?;
        let auth = r.array::<AUTH_LEN>()?;
        Ok(Self {
            identifier,
            key,
            auth,
            rp_info_enc: r.rest().to_vec(),
        })
    }
}

/// `circuit_id ∥ identifier ∥ info_hash ∥ (ipv4 ∥ port)*`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhtResponseMessage {
    pub circuit_id: u32,
    pub identifier: u16,
    pub info_hash: InfoHash,
    pub peers: Vec<SocketAddrV4>,
}

/// What a seeder tells a downloader about its rendezvous point, sealed under
/// the end-to-end keys: `ipv4 ∥ port ∥ len_pk:u16 ∥ public_key ∥ cookie:20`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendezvousInfo {
    pub address: SocketAddrV4,
    pub public_key: PublicKey,
    pub cookie: Cookie,
}

impl RendezvousInfo {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        write_ipv4(&mut w, &self.address);
        w.u16(PUBLIC_KEY_LEN as u16)
            .bytes(self.public_key.as_bytes())
            .bytes(&self.cookie);
        w.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        let mut r = Reader::new(bytes);
        let address = read_ipv4(&mut r)?;
        let len = r.u16()? as usize;
        let public_key = read_key(&mut r, len)?;
        let cookie = r.array::<COOKIE_LEN>()?;
        r.finish()?;
        Ok(Self {
            address,
            public_key,
            cookie,
        })
    }
}

// ============================================================================
// Message envelope
// ============================================================================

/// Every message a cell can carry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Create(CreateMessage),
    Created(CreatedMessage),
    Extend(ExtendMessage),
    Extended(CreatedMessage),
    Ping(PingMessage),
    Pong(PingMessage),
    Destroy(DestroyMessage),
    Data(DataMessage),
    EstablishIntro(InfoHashRequest),
    IntroEstablished(Acknowledgement),
    KeyRequest(InfoHashRequest),
    KeyResponse(KeyResponseMessage),
    EstablishRendezvous(CookieMessage),
    RendezvousEstablished(RendezvousEstablishedMessage),
    CreateE2e(CreateE2eMessage),
    CreatedE2e(CreatedE2eMessage),
    LinkE2e(CookieMessage),
    LinkedE2e(Acknowledgement),
    DhtRequest(InfoHashRequest),
    DhtResponse(DhtResponseMessage),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Create(_) => MessageType::Create,
            Self::Created(_) => MessageType::Created,
            Self::Extend(_) => MessageType::Extend,
            Self::Extended(_) => MessageType::Extended,
            Self::Ping(_) => MessageType::Ping,
            Self::Pong(_) => MessageType::Pong,
            Self::Destroy(_) => MessageType::Destroy,
            Self::Data(_) => MessageType::Data,
            Self::EstablishIntro(_) => MessageType::EstablishIntro,
            Self::IntroEstablished(_) => MessageType::IntroEstablished,
            Self::KeyRequest(_) => MessageType::KeyRequest,
            Self::KeyResponse(_) => MessageType::KeyResponse,
            Self::EstablishRendezvous(_) => MessageType::EstablishRendezvous,
            Self::RendezvousEstablished(_) => MessageType::RendezvousEstablished,
            Self::CreateE2e(_) => MessageType::CreateE2e,
            Self::CreatedE2e(_) => MessageType::CreatedE2e,
            Self::LinkE2e(_) => MessageType::LinkE2e,
            Self::LinkedE2e(_) => MessageType::LinkedE2e,
            Self::DhtRequest(_) => MessageType::DhtRequest,
            Self::DhtResponse(_) => MessageType::DhtResponse,
        }
    }

    /// Encode the message body (without the cell header)
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        match self {
            Self::Create(m) => m.write(&mut w),
            Self::Created(m) | Self::Extended(m) => m.write(&mut w),
            Self::Extend(m) => m.write(&mut w),
            Self::Ping(m) | Self::Pong(m) => {
                w.u32(m.circuit_id).u16(m.identifier);
            }
            Self::Destroy(m) => {
                w.u32(m.circuit_id).u16(m.reason);
            }
            Self::Data(m) => m.write(&mut w),
            Self::EstablishIntro(m) | Self::KeyRequest(m) | Self::DhtRequest(m) => m.write(&mut w),
            Self::IntroEstablished(m) | Self::LinkedE2e(m) => {
                w.u32(m.circuit_id).u16(m.identifier);
            }
            Self::EstablishRendezvous(m) | Self::LinkE2e(m) => {
                w.u32(m.circuit_id).u16(m.identifier).bytes(&m.cookie);
            }
            Self::RendezvousEstablished(m) => {
                w.u32(m.circuit_id).u16(m.identifier);
                write_ipv4(&mut w, &m.rendezvous_point_addr);
            }
            Self::KeyResponse(m) => m.write(&mut w),
            Self::CreateE2e(m) => m.write(&mut w),
            Self::CreatedE2e(m) => m.write(&mut w),
            Self::DhtResponse(m) => {
                w.u32(m.circuit_id)
                    .u16(m.identifier)
                    .bytes(m.info_hash.as_bytes());
                for peer in &m.peers {
                    write_ipv4(&mut w, peer);
                }
            }
        }
        w.into_inner()
    }

    /// Decode a message body of the given type; trailing bytes are an error
    /// for fixed-size messages
    pub fn decode(message_type: MessageType, body: &[u8]) -> CodecResult<Self> {
        let mut r = Reader::new(body);
        let message = match message_type {
            MessageType::Create => Self::Create(CreateMessage::read(&mut r)?),
            MessageType::Created => Self::Created(CreatedMessage::read(&mut r)?),
            MessageType::Extend => Self::Extend(ExtendMessage::read(&mut r)?),
            MessageType::Extended => Self::Extended(CreatedMessage::read(&mut r)?),
            MessageType::Ping => Self::Ping(PingMessage {
                circuit_id: r.u32()?,
                identifier: r.u16()?,
            }),
            MessageType::Pong => Self::Pong(PingMessage {
                circuit_id: r.u32()?,
                identifier: r.u16()?,
            }),
            MessageType::Destroy => Self::Destroy(DestroyMessage {
                circuit_id: r.u32()?,
                reason: r.u16()?,
            }),
            MessageType::Data => Self::Data(DataMessage::read(&mut r)?),
            MessageType::EstablishIntro => Self::EstablishIntro(InfoHashRequest::read(&mut r)?),
            MessageType::IntroEstablished => Self::IntroEstablished(Acknowledgement {
                circuit_id: r.u32()?,
                identifier: r.u16()?,
            }),
            MessageType::KeyRequest => Self::KeyRequest(InfoHashRequest::read(&mut r)?),
            MessageType::KeyResponse => Self::KeyResponse(KeyResponseMessage::read(&mut r)?),
            MessageType::EstablishRendezvous => Self::EstablishRendezvous(CookieMessage {
                circuit_id: r.u32()?,
                identifier: r.u16()?,
                cookie: r.array()?,
            }),
            MessageType::RendezvousEstablished => {
                Self::RendezvousEstablished(RendezvousEstablishedMessage {
                    circuit_id: r.u32()?,
                    identifier: r.u16()?,
                    rendezvous_point_addr: read_ipv4(&mut r)?,
                })
            }
            MessageType::CreateE2e => Self::CreateE2e(CreateE2eMessage::read(&mut r)?),
            MessageType::CreatedE2e => Self::CreatedE2e(CreatedE2eMessage::read(&mut r)?),
            MessageType::LinkE2e => Self::LinkE2e(CookieMessage {
                circuit_id: r.u32()?,
                identifier: r.u16()?,
                cookie: r.array()?,
            }),
            MessageType::LinkedE2e => Self::LinkedE2e(Acknowledgement {
                circuit_id: r.u32()?,
                identifier: r.u16()?,
            }),
            MessageType::DhtRequest => Self::DhtRequest(InfoHashRequest::read(&mut r)?),
            MessageType::DhtResponse => {
                let circuit_id = r.u32()?;
                let identifier = r.u16()?;
                let info_hash = read_info_hash(&mut r)?;
                Self::DhtResponse(DhtResponseMessage {
                    circuit_id,
                    identifier,
                    info_hash,
                    peers: read_peers(&mut r)?,
                })
            }
        };
        r.finish()?;
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::KeyPair;

    fn key() -> PublicKey {
        KeyPair::generate().public_key()
    }

    fn roundtrip(message: Message) {
        let body = message.encode();
        let decoded = Message::decode(message.message_type(), &body).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_create_layout() {
        let node_key = key();
        let create = CreateMessage {
            circuit_id: 0x01020304,
            node_id: NodeId::from_public_key(&node_key),
            node_public_key: node_key,
            key: key(),
        };
        let body = Message::Create(create.clone()).encode();

        assert_eq!(body.len(), 4 + 2 + 2 + 20 + 32 + 32);
        assert_eq!(&body[..4], &[1, 2, 3, 4]);
        assert_eq!(&body[4..8], &[0, 32, 0, 32]);
        assert_eq!(&body[8..28], create.node_id.as_bytes());
        assert_eq!(&body[28..60], node_key.as_bytes());
        roundtrip(Message::Create(create));
    }

    #[test]
    fn test_created_layout() {
        let created = CreatedMessage {
            circuit_id: 9,
            key: key(),
            auth: [7u8; AUTH_LEN],
            candidate_list_enc: vec![1, 2, 3],
        };
        let body = Message::Created(created.clone()).encode();

        assert_eq!(&body[4..6], &[0, 32]);
        assert_eq!(&body[6..38], &[7u8; 32]);
        assert_eq!(&body[38..70], created.key.as_bytes());
        assert_eq!(&body[70..], &[1, 2, 3]);
        roundtrip(Message::Extended(created));
    }

    #[test]
    fn test_extend_with_and_without_address() {
        let node_key = key();
        let mut extend = ExtendMessage {
            circuit_id: 5,
            node_id: NodeId::from_public_key(&node_key),
            node_public_key: node_key,
            key: key(),
            node_addr: None,
        };
        assert_eq!(Message::Extend(extend.clone()).encode().len(), 92);
        roundtrip(Message::Extend(extend.clone()));

        extend.node_addr = Some("10.0.0.2:7759".parse().unwrap());
        assert_eq!(Message::Extend(extend.clone()).encode().len(), 98);
        roundtrip(Message::Extend(extend));
    }

    #[test]
    fn test_fixed_size_messages() {
        let ping = Message::Ping(PingMessage {
            circuit_id: 1,
            identifier: 0xabcd,
        });
        assert_eq!(ping.encode(), vec![0, 0, 0, 1, 0xab, 0xcd]);

        let destroy = Message::Destroy(DestroyMessage {
            circuit_id: 2,
            reason: 0,
        });
        assert_eq!(destroy.encode(), vec![0, 0, 0, 2, 0, 0]);
        roundtrip(destroy);
    }

    #[test]
    fn test_decode_rejects_truncated_and_trailing() {
        assert!(matches!(
            Message::decode(MessageType::Ping, &[0, 0, 0, 1, 0]),
            Err(CodecError::Truncated { .. })
        ));
        assert_eq!(
            Message::decode(MessageType::Destroy, &[0, 0, 0, 1, 0, 0, 9]).unwrap_err(),
            CodecError::TrailingData(1)
        );
    }

    #[test]
    fn test_decode_rejects_wrong_key_length() {
        let mut body = Vec::new();
        body.extend_from_slice(&[0, 0, 0, 1, 0, 33, 0, 32]);
        body.extend_from_slice(&[0u8; 20 + 33 + 32]);
        assert_eq!(
            Message::decode(MessageType::Create, &body).unwrap_err(),
            CodecError::BadKeyLength(33)
        );
    }

    #[test]
    fn test_data_message_roundtrip() {
        roundtrip(Message::Data(DataMessage {
            circuit_id: 77,
            destination: Address::domain("dht.example", 6881).unwrap(),
            origin: Address::unspecified(),
            payload: b"\x00ping".to_vec(),
        }));
    }

    #[test]
    fn test_key_response_caps_pex() {
        let peers: Vec<SocketAddrV4> = (0..60u16)
            .map(|i| SocketAddrV4::new([10, 0, 0, 1].into(), 1000 + i))
            .collect();
        let message = KeyResponseMessage {
            identifier: 3,
            public_key: key(),
            pex_peers: peers,
        };

        let body = Message::KeyResponse(message).encode();
        assert_eq!(body.len(), 2 + 2 + 32 + MAX_PEX_PEERS * 6);

        match Message::decode(MessageType::KeyResponse, &body).unwrap() {
            Message::KeyResponse(decoded) => assert_eq!(decoded.pex_peers.len(), MAX_PEX_PEERS),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_hidden_service_messages_roundtrip() {
        let info_hash = InfoHash::from_bytes([4u8; 20]);
        let hs_key = key();
        roundtrip(Message::KeyRequest(InfoHashRequest {
            circuit_id: 0,
            identifier: 11,
            info_hash,
        }));
        roundtrip(Message::LinkE2e(CookieMessage {
            circuit_id: 8,
            identifier: 12,
            cookie: [5u8; COOKIE_LEN],
        }));
        roundtrip(Message::RendezvousEstablished(RendezvousEstablishedMessage {
            circuit_id: 8,
            identifier: 13,
            rendezvous_point_addr: "192.0.2.1:7759".parse().unwrap(),
        }));
        roundtrip(Message::CreateE2e(CreateE2eMessage {
            identifier: 14,
            info_hash,
            node_id: NodeId::from_public_key(&hs_key),
            node_public_key: hs_key,
            key: key(),
        }));
        roundtrip(Message::CreatedE2e(CreatedE2eMessage {
            identifier: 15,
            key: key(),
            auth: [1u8; AUTH_LEN],
            rp_info_enc: vec![9; 40],
        }));
        roundtrip(Message::DhtResponse(DhtResponseMessage {
            circuit_id: 3,
            identifier: 16,
            info_hash,
            peers: vec!["10.1.1.1:1".parse().unwrap()],
        }));
    }

    #[test]
    fn test_candidate_list_and_rendezvous_info() {
        let keys = vec![key(), key()];
        let encoded = encode_candidate_list(&keys);
        assert_eq!(encoded.len(), 2 * 34);
        assert_eq!(decode_candidate_list(&encoded).unwrap(), keys);
        assert!(decode_candidate_list(&encoded[..40]).is_err());

        let info = RendezvousInfo {
            address: "198.51.100.7:7759".parse().unwrap(),
            public_key: key(),
            cookie: [2u8; COOKIE_LEN],
        };
        assert_eq!(RendezvousInfo::decode(&info.encode()).unwrap(), info);
    }

    #[test]
    fn test_unknown_type_byte() {
        assert_eq!(MessageType::try_from(9).unwrap_err(), CodecError::UnknownType(9));
        assert_eq!(MessageType::try_from(21).unwrap(), MessageType::DhtResponse);
    }
}
