use std::fmt::{Debug, Formatter};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use anyhow::anyhow;
use bytes::{Buf, BufMut, BytesMut};
use crc::Crc;

use crate::packet::types::{PacketId, PacketType, Priority, RequestId};

/// Checksum guarding a packet's header and payload against corruption on the
///  wire. A mismatch drops the packet at the receiving transport, it is never
///  surfaced to a request.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Checksum(pub u64);
impl Debug for Checksum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x?}", self.0)
    }
}
impl Checksum {
    pub fn new(buf: &[u8]) -> Checksum {
        let hasher = Crc::<u64>::new(&crc::CRC_64_REDIS);
        let mut digest = hasher.digest();
        digest.update(buf);
        Checksum(digest.finalize())
    }
}

/// The header shared by every packet in the system, regardless of subtype.
///
/// `packet_nbr` / `nbr_packets` describe fragmentation of one logical reply:
///  a reply too big for a single physical packet arrives as `nbr_packets`
///  fragments, each carrying its index in `packet_nbr`. `resend_nbr` counts
///  retransmission attempts of the outgoing packet this one answers (or of the
///  packet itself, on the sending side) and is what lets the receiver discard
///  fragments of a superseded attempt.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct PacketHeader {
    pub packet_type: PacketType,
    pub priority: Priority,
    pub origin: SocketAddr,
    pub request_id: RequestId,
    pub timestamp: u32,
    pub originator: u16,
    pub packet_id: PacketId,
    pub packet_nbr: u8,
    pub nbr_packets: u8,
    pub resend_nbr: u8,
    pub map_set: u32,
}

impl PacketHeader {
    pub fn new(packet_type: PacketType, priority: Priority) -> PacketHeader {
        PacketHeader {
            packet_type,
            priority,
            origin: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)),
            request_id: RequestId(0),
            timestamp: 0,
            originator: 0,
            packet_id: PacketId(0),
            packet_nbr: 0,
            nbr_packets: 1,
            resend_nbr: 0,
            map_set: 0,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16(self.packet_type.into());
        buf.put_u8(self.priority.to_raw());
        buf.put_u8(self.packet_nbr);
        buf.put_u8(self.nbr_packets);
        buf.put_u8(self.resend_nbr);
        match &self.origin {
            SocketAddr::V4(data) => {
                buf.put_u8(4);
                buf.put_u32(data.ip().to_bits());
                buf.put_u16(data.port());
            }
            SocketAddr::V6(data) => {
                buf.put_u8(6);
                buf.put_u128(data.ip().to_bits());
                buf.put_u16(data.port());
            }
        }
        buf.put_u16(self.request_id.0);
        buf.put_u32(self.timestamp);
        buf.put_u16(self.originator);
        buf.put_u16(self.packet_id.0);
        buf.put_u32(self.map_set);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        let packet_type = PacketType::try_from(buf.try_get_u16()?)
            .map_err(|e| anyhow!("unknown packet type: {}", e))?;
        let priority = Priority::new(buf.try_get_u8()?)?;
        let packet_nbr = buf.try_get_u8()?;
        let nbr_packets = buf.try_get_u8()?;
        let resend_nbr = buf.try_get_u8()?;
        let origin = match buf.try_get_u8()? {
            4 => {
                let ip = buf.try_get_u32()?;
                let port = buf.try_get_u16()?;
                SocketAddr::V4(SocketAddrV4::new(ip.into(), port))
            }
            6 => {
                let ip = buf.try_get_u128()?;
                let port = buf.try_get_u16()?;
                SocketAddr::V6(SocketAddrV6::new(ip.into(), port, 0, 0))
            }
            n => {
                return Err(anyhow!("invalid origin address discriminator: {}", n));
            }
        };
        let request_id = RequestId(buf.try_get_u16()?);
        let timestamp = buf.try_get_u32()?;
        let originator = buf.try_get_u16()?;
        let packet_id = PacketId(buf.try_get_u16()?);
        let map_set = buf.try_get_u32()?;

        Ok(PacketHeader {
            packet_type,
            priority,
            origin,
            request_id,
            timestamp,
            originator,
            packet_id,
            packet_nbr,
            nbr_packets,
            resend_nbr,
            map_set,
        })
    }
}
