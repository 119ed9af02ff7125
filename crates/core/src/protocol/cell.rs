use super::messages::{Message, MessageType};
use super::wire::{CodecError, CodecResult, Reader, Writer};

/// Prefix every overlay datagram of this community starts with
///
/// One zero byte, the overlay version, then the 20-byte community identifier.
pub const COMMUNITY_PREFIX: [u8; 22] = [
    0x00, 0x01, 0x81, 0xde, 0xd0, 0x7c, 0x62, 0x8d, 0x19, 0xfe, 0xa5, 0x4e, 0x3b, 0x3b, 0x7a, 0x11,
    0xd0, 0xe6, 0x35, 0x7a, 0x4f, 0x9b,
];

/// Socket-level marker for data cells
pub const DATA_PREFIX: [u8; 4] = [0xff, 0xff, 0xff, 0xff];

/// Circuit id used by hidden-service messages that are not bound to a circuit
pub const PLAIN_CIRCUIT_ID: u32 = 0;

const CELL_HEADER_LEN: usize = COMMUNITY_PREFIX.len() + 4 + 1;

/// A framed unit of tunnel communication: `prefix ∥ circuit_id ∥ type ∥ body`
///
/// The body is either a cleartext message or an onion-layered one,
/// depending on the type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub circuit_id: u32,
    pub message_type: MessageType,
    pub body: Vec<u8>,
}

impl Cell {
    pub fn new(circuit_id: u32, message_type: MessageType, body: Vec<u8>) -> Self {
        Self {
            circuit_id,
            message_type,
            body,
        }
    }

    /// Cell carrying a message that is not bound to any circuit
    pub fn plain(message: &Message) -> Self {
        Self::new(PLAIN_CIRCUIT_ID, message.message_type(), message.encode())
    }

    pub fn is_plain(&self) -> bool {
        self.circuit_id == PLAIN_CIRCUIT_ID
    }

    /// Encode in cell form
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.bytes(&COMMUNITY_PREFIX)
            .u32(self.circuit_id)
            .u8(self.message_type as u8)
            .bytes(&self.body);
        w.into_inner()
    }

    /// Decode a packet in cell form
    pub fn decode(packet: &[u8]) -> CodecResult<Self> {
        if !packet.starts_with(&COMMUNITY_PREFIX) {
            return Err(CodecError::BadPrefix);
        }
        let mut r = Reader::new(&packet[COMMUNITY_PREFIX.len()..]);
        let circuit_id = r.u32()?;
        let message_type = MessageType::try_from(r.u8()?)?;
        Ok(Self::new(circuit_id, message_type, r.rest().to_vec()))
    }

    /// Encode the way it goes on the socket: data cells use the data form
    pub fn to_wire(&self) -> Vec<u8> {
        let packet = self.encode();
        if self.message_type == MessageType::Data {
            // can't fail on a packet we just framed as data
            cell_to_data(&packet).unwrap_or(packet)
        } else {
            packet
        }
    }

    /// Decode a packet received on the socket, in either form
    pub fn from_wire(packet: &[u8]) -> CodecResult<Self> {
        if is_data_packet(packet) {
            Self::decode(&data_to_cell(packet)?)
        } else {
            Self::decode(packet)
        }
    }
}

pub fn is_data_packet(packet: &[u8]) -> bool {
    packet.starts_with(&DATA_PREFIX)
}

/// `prefix ∥ cid ∥ data-type ∥ body` to `DATA_PREFIX ∥ cid ∥ body`
pub fn cell_to_data(packet: &[u8]) -> CodecResult<Vec<u8>> {
    if packet.len() < CELL_HEADER_LEN {
        return Err(CodecError::Truncated {
            needed: CELL_HEADER_LEN,
            available: packet.len(),
        });
    }
    if !packet.starts_with(&COMMUNITY_PREFIX) {
        return Err(CodecError::BadPrefix);
    }
    let type_byte = packet[CELL_HEADER_LEN - 1];
    if type_byte != MessageType::Data as u8 {
        return Err(CodecError::UnknownType(type_byte));
    }

    let mut out = Vec::with_capacity(packet.len() - COMMUNITY_PREFIX.len() + DATA_PREFIX.len() - 1);
    out.extend_from_slice(&DATA_PREFIX);
    out.extend_from_slice(&packet[COMMUNITY_PREFIX.len()..CELL_HEADER_LEN - 1]);
    out.extend_from_slice(&packet[CELL_HEADER_LEN..]);
    Ok(out)
}

/// `DATA_PREFIX ∥ cid ∥ body` to `prefix ∥ cid ∥ data-type ∥ body`
pub fn data_to_cell(packet: &[u8]) -> CodecResult<Vec<u8>> {
    let header = DATA_PREFIX.len() + 4;
    if packet.len() < header {
        return Err(CodecError::Truncated {
            needed: header,
            available: packet.len(),
        });
    }
    if !is_data_packet(packet) {
        return Err(CodecError::BadPrefix);
    }

    let mut out = Vec::with_capacity(packet.len() + COMMUNITY_PREFIX.len() - DATA_PREFIX.len() + 1);
    out.extend_from_slice(&COMMUNITY_PREFIX);
    out.extend_from_slice(&packet[DATA_PREFIX.len()..header]);
    out.push(MessageType::Data as u8);
    out.extend_from_slice(&packet[header..]);
    Ok(out)
}
