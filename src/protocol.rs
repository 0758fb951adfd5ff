//! Wire format for the bank protocol.
//!
//! Every datagram is a single fixed-size packet - all numbers in network byte
//!  order (BE):
//!
//! ```ascii
//! 0: packet type (u8) - discriminates request vs. reply payload
//! 1: request id (u32) - 0 is reserved for discovery
//! 5: payload (8 bytes):
//!     * request (CLIENT_DISCOVERY, TRANSACTION_REQUEST):
//!       destination IP V4 (u32), transfer value (u32)
//!     * reply (all ACK types):
//!       balance (u32), unused (u32, zero)
//! ```
//!
//! Both payload shapes serialize to the same length, so a valid datagram is
//!  exactly [Packet::SERIALIZED_LEN] bytes. Callers reject datagrams of any
//!  other size before decoding; the codec itself validates structure (a known
//!  packet type) but never semantics.

use std::net::Ipv4Addr;

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, BytesMut};

/// Request id carried by every discovery request and echoed in its ACK.
pub const DISCOVERY_REQUEST_ID: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    ClientDiscovery,
    ClientDiscoveryAck,
    TransactionRequest,
    TransactionAck,
    InsufficientBalanceAck,
    InvalidClientAck,
    ErrorAck,
}

impl PacketType {
    pub fn to_wire(self) -> u8 {
        match self {
            PacketType::ClientDiscovery => 1,
            PacketType::ClientDiscoveryAck => 2,
            PacketType::TransactionRequest => 3,
            PacketType::TransactionAck => 4,
            PacketType::InsufficientBalanceAck => 5,
            PacketType::InvalidClientAck => 6,
            PacketType::ErrorAck => 7,
        }
    }

    pub fn try_from_wire(tag: u8) -> anyhow::Result<PacketType> {
        match tag {
            1 => Ok(PacketType::ClientDiscovery),
            2 => Ok(PacketType::ClientDiscoveryAck),
            3 => Ok(PacketType::TransactionRequest),
            4 => Ok(PacketType::TransactionAck),
            5 => Ok(PacketType::InsufficientBalanceAck),
            6 => Ok(PacketType::InvalidClientAck),
            7 => Ok(PacketType::ErrorAck),
            n => Err(anyhow!("invalid packet type discriminator: {}", n)),
        }
    }

    /// True for the two types that carry a request payload; all other types
    ///  carry a reply payload.
    pub fn is_request(self) -> bool {
        matches!(self, PacketType::ClientDiscovery | PacketType::TransactionRequest)
    }
}

/// The payload variant is determined by the packet type - the codec never
///  exposes a mismatched combination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketPayload {
    Request { dest_ip: Ipv4Addr, value: u32 },
    Reply { balance: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub request_id: u32,
    pub payload: PacketPayload,
}

impl Packet {
    pub const SERIALIZED_LEN: usize = size_of::<u8>() + 3 * size_of::<u32>();

    pub fn request(packet_type: PacketType, request_id: u32, dest_ip: Ipv4Addr, value: u32) -> Packet {
        debug_assert!(packet_type.is_request());
        Packet {
            packet_type,
            request_id,
            payload: PacketPayload::Request { dest_ip, value },
        }
    }

    pub fn reply(packet_type: PacketType, request_id: u32, balance: u32) -> Packet {
        debug_assert!(!packet_type.is_request());
        Packet {
            packet_type,
            request_id,
            payload: PacketPayload::Reply { balance },
        }
    }

    /// A discovery probe: request id 0, zeroed request payload.
    pub fn discovery() -> Packet {
        Packet::request(PacketType::ClientDiscovery, DISCOVERY_REQUEST_ID, Ipv4Addr::UNSPECIFIED, 0)
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.packet_type.to_wire());
        buf.put_u32(self.request_id);
        match &self.payload {
            PacketPayload::Request { dest_ip, value } => {
                buf.put_u32(dest_ip.to_bits());
                buf.put_u32(*value);
            }
            PacketPayload::Reply { balance } => {
                buf.put_u32(*balance);
                buf.put_u32(0);
            }
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Packet> {
        let packet_type = PacketType::try_from_wire(buf.try_get_u8()?)?;
        let request_id = buf.try_get_u32()?;

        let payload = if packet_type.is_request() {
            let dest_ip = Ipv4Addr::from_bits(buf.try_get_u32()?);
            let value = buf.try_get_u32()?;
            PacketPayload::Request { dest_ip, value }
        }
        else {
            let balance = buf.try_get_u32()?;
            let _unused = buf.try_get_u32()?;
            PacketPayload::Reply { balance }
        };

        if buf.has_remaining() {
            bail!("trailing garbage after packet payload");
        }

        Ok(Packet {
            packet_type,
            request_id,
            payload,
        })
    }
}
