//! Reliable datagram wire packets
//!
//! Every packet starts with a status byte (type in the low 7 bits, the high
//! bit set when the packet travelled over multicast) and a 32-bit sequence
//! number. Multi-byte fields are little-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::address::{AddressWireError, EndpointAddress};

/// Status byte flag: packet was sent to the multicast group
pub const MULTICAST_FLAG: u8 = 0x80;
pub const HEADER_SIZE: usize = 1 + 4;
/// Header plus start sequence number and total size
pub const DATA_HEADER_SIZE: usize = HEADER_SIZE + 4 + 4;
pub const TEST_PACKET_SIZE: usize = HEADER_SIZE;

/// Packet Type Definitions (7 bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Ping = 0x00,
    Test = 0x01,
    Conn = 0x02,
    ConnOk = 0x03,
    Data = 0x04,
    Check = 0x05,
    Close = 0x06,
    AddAddr = 0x07,
    Unknown = 0x7F,
}

impl From<u8> for PacketType {
    fn from(byte: u8) -> Self {
        match byte & !MULTICAST_FLAG {
            0x00 => PacketType::Ping,
            0x01 => PacketType::Test,
            0x02 => PacketType::Conn,
            0x03 => PacketType::ConnOk,
            0x04 => PacketType::Data,
            0x05 => PacketType::Check,
            0x06 => PacketType::Close,
            0x07 => PacketType::AddAddr,
            _ => PacketType::Unknown,
        }
    }
}

/// Multicast negotiation state carried by ConnOK
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MulticastMode {
    /// Unicast works, no multicast
    NoMulticast = 0,
    /// Unicast works, try multicast next
    TryMulticast = 1,
    /// Multicast Conn arrived, multicast works
    MulticastOk = 2,
}

impl TryFrom<u8> for MulticastMode {
    type Error = PacketError;

    fn try_from(byte: u8) -> Result<Self, PacketError> {
        match byte {
            0 => Ok(MulticastMode::NoMulticast),
            1 => Ok(MulticastMode::TryMulticast),
            2 => Ok(MulticastMode::MulticastOk),
            other => Err(PacketError::InvalidMode(other)),
        }
    }
}

/// Status (1) | Sequence Number (4)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub packet_type: PacketType,
    pub multicast: bool,
    pub nr: u32,
}

impl Header {
    pub const SIZE: usize = HEADER_SIZE;

    pub fn encode(&self, buf: &mut BytesMut) {
        let mut status = self.packet_type as u8;
        if self.multicast {
            status |= MULTICAST_FLAG;
        }
        buf.put_u8(status);
        buf.put_u32_le(self.nr);
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, PacketError> {
        if buf.remaining() < Self::SIZE {
            return Err(PacketError::Incomplete);
        }

        let status = buf.get_u8();
        let packet_type = PacketType::from(status);
        if packet_type == PacketType::Unknown {
            return Err(PacketError::InvalidType(status));
        }

        Ok(Header {
            packet_type,
            multicast: (status & MULTICAST_FLAG) != 0,
            nr: buf.get_u32_le(),
        })
    }
}

/// Type-specific packet contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Ping,
    /// Multicast loopback probe; the header number is a random token
    Test,
    Conn {
        version: u32,
        /// Address the sender used to reach us
        addr: EndpointAddress,
        /// Multicast group the sender is in, if any
        multicast_group: Option<EndpointAddress>,
    },
    ConnOk {
        mode: MulticastMode,
        /// Address we observed the sender at
        addr: EndpointAddress,
    },
    /// One fragment; the header number is the fragment's own sequence number
    Data {
        start_nr: u32,
        total_size: u32,
        payload: Bytes,
    },
    /// The header number is the sender's next outgoing sequence number
    Check {
        ack: u32,
        mc_ack: u32,
        asks: Vec<u32>,
        mc_asks: Vec<u32>,
    },
    Close {
        addr: EndpointAddress,
    },
    AddAddr {
        addr: EndpointAddress,
        new_addr: EndpointAddress,
    },
}

impl Body {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Body::Ping => PacketType::Ping,
            Body::Test => PacketType::Test,
            Body::Conn { .. } => PacketType::Conn,
            Body::ConnOk { .. } => PacketType::ConnOk,
            Body::Data { .. } => PacketType::Data,
            Body::Check { .. } => PacketType::Check,
            Body::Close { .. } => PacketType::Close,
            Body::AddAddr { .. } => PacketType::AddAddr,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub multicast: bool,
    pub nr: u32,
    pub body: Body,
}

impl Packet {
    pub fn new(nr: u32, multicast: bool, body: Body) -> Self {
        Packet {
            multicast,
            nr,
            body,
        }
    }

    pub fn header(&self) -> Header {
        Header {
            packet_type: self.body.packet_type(),
            multicast: self.multicast,
            nr: self.nr,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        self.header().encode(buf);
        match &self.body {
            Body::Ping | Body::Test => {}
            Body::Conn {
                version,
                addr,
                multicast_group,
            } => {
                buf.put_u32_le(*version);
                addr.encode(buf);
                multicast_group.unwrap_or_default().encode(buf);
            }
            Body::ConnOk { mode, addr } => {
                buf.put_u8(*mode as u8);
                addr.encode(buf);
            }
            Body::Data {
                start_nr,
                total_size,
                payload,
            } => {
                buf.put_u32_le(*start_nr);
                buf.put_u32_le(*total_size);
                buf.put_slice(payload);
            }
            Body::Check {
                ack,
                mc_ack,
                asks,
                mc_asks,
            } => {
                buf.put_u32_le(*ack);
                buf.put_u32_le(*mc_ack);
                buf.put_u32_le(asks.len() as u32);
                buf.put_u32_le(mc_asks.len() as u32);
                for nr in asks.iter().chain(mc_asks) {
                    buf.put_u32_le(*nr);
                }
            }
            Body::Close { addr } => addr.encode(buf),
            Body::AddAddr { addr, new_addr } => {
                addr.encode(buf);
                new_addr.encode(buf);
            }
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(DATA_HEADER_SIZE);
        self.encode(&mut buf);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, PacketError> {
        let header = Header::decode(&mut buf)?;
        let body = match header.packet_type {
            PacketType::Ping => Body::Ping,
            PacketType::Test => Body::Test,
            PacketType::Conn => {
                need(&buf, 4)?;
                let version = buf.get_u32_le();
                let addr = EndpointAddress::decode(&mut buf)?;
                let group = EndpointAddress::decode(&mut buf)?;
                Body::Conn {
                    version,
                    addr,
                    multicast_group: (!group.is_null()).then_some(group),
                }
            }
            PacketType::ConnOk => {
                need(&buf, 1)?;
                let mode = MulticastMode::try_from(buf.get_u8())?;
                let addr = EndpointAddress::decode(&mut buf)?;
                Body::ConnOk { mode, addr }
            }
            PacketType::Data => {
                need(&buf, 8)?;
                let start_nr = buf.get_u32_le();
                let total_size = buf.get_u32_le();
                // Remaining bytes are the fragment payload
                Body::Data {
                    start_nr,
                    total_size,
                    payload: buf.split_off(0),
                }
            }
            PacketType::Check => {
                need(&buf, 16)?;
                let ack = buf.get_u32_le();
                let mc_ack = buf.get_u32_le();
                let ask_cnt = buf.get_u32_le() as usize;
                let mc_ask_cnt = buf.get_u32_le() as usize;
                let total = ask_cnt
                    .checked_add(mc_ask_cnt)
                    .and_then(|n| n.checked_mul(4))
                    .ok_or(PacketError::Incomplete)?;
                need(&buf, total)?;
                let asks = (0..ask_cnt).map(|_| buf.get_u32_le()).collect();
                let mc_asks = (0..mc_ask_cnt).map(|_| buf.get_u32_le()).collect();
                Body::Check {
                    ack,
                    mc_ack,
                    asks,
                    mc_asks,
                }
            }
            PacketType::Close => Body::Close {
                addr: EndpointAddress::decode(&mut buf)?,
            },
            PacketType::AddAddr => Body::AddAddr {
                addr: EndpointAddress::decode(&mut buf)?,
                new_addr: EndpointAddress::decode(&mut buf)?,
            },
            PacketType::Unknown => return Err(PacketError::InvalidType(PacketType::Unknown as u8)),
        };
        Ok(Packet {
            multicast: header.multicast,
            nr: header.nr,
            body,
        })
    }
}

fn need(buf: &Bytes, len: usize) -> Result<(), PacketError> {
    if buf.remaining() < len {
        Err(PacketError::Incomplete)
    } else {
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum PacketError {
    #[error("Packet data incomplete")]
    Incomplete,
    #[error("Invalid packet type: {0:#x}")]
    InvalidType(u8),
    #[error("Invalid multicast mode: {0}")]
    InvalidMode(u8),
    #[error("Invalid address: {0}")]
    Address(#[from] AddressWireError),
}
