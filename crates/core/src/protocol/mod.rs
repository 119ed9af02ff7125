mod address;
mod cell;
pub mod filter;
mod messages;
mod wire;

pub use address::{read_ipv4, to_ipv4, write_ipv4, Address};
pub use cell::{
    cell_to_data, data_to_cell, is_data_packet, Cell, COMMUNITY_PREFIX, DATA_PREFIX,
    PLAIN_CIRCUIT_ID,
};
pub use messages::{
    decode_candidate_list, encode_candidate_list, Acknowledgement, CookieMessage, Cookie,
    CreateE2eMessage, CreateMessage, CreatedE2eMessage, CreatedMessage, DataMessage,
    DestroyMessage, DhtResponseMessage, ExtendMessage, InfoHashRequest, KeyResponseMessage,
    Message, MessageType, PingMessage, RendezvousEstablishedMessage, RendezvousInfo, COOKIE_LEN,
};
pub use wire::{CodecError, CodecResult, Reader, Writer};
