use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;

use anyhow::anyhow;
use bytes::{Buf, Bytes, BytesMut};

use crate::packet::header::{Checksum, PacketHeader};
use crate::packet::types::{MapId, PacketId, PacketType, Priority, RequestId, StatusCode};

/// One binary message unit exchanged between worker processes: a shared header
///  plus a subtype-specific payload.
///
/// Payload conventions: request-type packets carry the targeted partition as a
///  leading `u32` word, reply-type packets carry the collaborator's status
///  code there. Fragment reassembly concatenates raw payload bytes, so only
///  fragment 0 of a multi-fragment reply carries the leading word.
///
/// A packet is immutable once queued for sending; exactly one component owns
///  it at any time.
#[derive(Clone, Eq, PartialEq)]
pub struct Packet {
    header: PacketHeader,
    payload: Bytes,
}

impl Debug for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Packet{{{:?} {:?} {:?} frag:{}/{} resend:{} payload:{}b}}",
               self.header.packet_type, self.header.request_id, self.header.packet_id,
               self.header.packet_nbr, self.header.nbr_packets, self.header.resend_nbr,
               self.payload.len())
    }
}

impl Packet {
    /// Build a request-type packet aimed at `map_id`. Request id, packet id,
    ///  originator and timestamp are stamped later, by the owning request's
    ///  `update_ids`, before the packet is queued for sending.
    pub fn request(packet_type: PacketType, priority: Priority, map_id: MapId, body: &[u8]) -> Packet {
        assert!(!packet_type.is_reply(), "{:?} is not a request type", packet_type);
        let mut payload = BytesMut::with_capacity(4 + body.len());
        payload.extend_from_slice(&map_id.0.to_be_bytes());
        payload.extend_from_slice(body);
        Packet {
            header: PacketHeader::new(packet_type, priority),
            payload: payload.freeze(),
        }
    }

    /// Build a reply answering `request`, copying the ids the sender needs to
    ///  route it back to the right request and packet container.
    pub fn reply_to(request: &Packet, packet_type: PacketType, status: StatusCode, body: &[u8]) -> Packet {
        assert!(packet_type.is_reply(), "{:?} is not a reply type", packet_type);
        let mut header = PacketHeader::new(packet_type, request.header.priority);
        header.request_id = request.header.request_id;
        header.packet_id = request.header.packet_id;
        header.originator = request.header.originator;
        header.timestamp = request.header.timestamp;
        header.map_set = request.header.map_set;

        let mut payload = BytesMut::with_capacity(4 + body.len());
        payload.extend_from_slice(&u32::from(status).to_be_bytes());
        payload.extend_from_slice(body);
        Packet {
            header,
            payload: payload.freeze(),
        }
    }

    pub fn from_parts(header: PacketHeader, payload: Bytes) -> Packet {
        Packet { header, payload }
    }

    pub fn header(&self) -> &PacketHeader {
        &self.header
    }

    pub fn packet_type(&self) -> PacketType {
        self.header.packet_type
    }

    pub fn priority(&self) -> Priority {
        self.header.priority
    }

    pub fn request_id(&self) -> RequestId {
        self.header.request_id
    }

    pub fn packet_id(&self) -> PacketId {
        self.header.packet_id
    }

    pub fn resend_nbr(&self) -> u8 {
        self.header.resend_nbr
    }

    /// The full payload including the leading map-id / status word. This is
    ///  what fragment reassembly concatenates.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The payload past the leading word, i.e. the subtype-specific part.
    pub fn body(&self) -> &[u8] {
        if self.payload.len() >= 4 {
            &self.payload[4..]
        }
        else {
            &[]
        }
    }

    /// The status a reply-type packet reports. Asking a request-type packet is
    ///  a caller error.
    pub fn reply_status(&self) -> anyhow::Result<StatusCode> {
        assert!(self.header.packet_type.is_reply(),
                "asked {:?} for a reply status", self.header.packet_type);
        let mut buf = &self.payload[..];
        let raw = buf.try_get_u32()?;
        StatusCode::try_from(raw).map_err(|e| anyhow!("unknown status code: {}", e))
    }

    /// The partition a request-type packet is aimed at.
    pub fn request_map_id(&self) -> anyhow::Result<MapId> {
        assert!(!self.header.packet_type.is_reply(),
                "asked {:?} for a target map id", self.header.packet_type);
        let mut buf = &self.payload[..];
        Ok(MapId(buf.try_get_u32()?))
    }

    pub fn set_request_metadata(&mut self, request_id: RequestId, packet_id: PacketId,
                                originator: u16, timestamp: u32) {
        self.header.request_id = request_id;
        self.header.packet_id = packet_id;
        self.header.originator = originator;
        self.header.timestamp = timestamp;
    }

    pub fn set_resend_nbr(&mut self, resend_nbr: u8) {
        self.header.resend_nbr = resend_nbr;
    }

    pub fn set_origin(&mut self, origin: SocketAddr) {
        self.header.origin = origin;
    }

    pub fn set_map_set(&mut self, map_set: u32) {
        self.header.map_set = map_set;
    }

    pub fn set_fragment(&mut self, packet_nbr: u8, nbr_packets: u8) {
        assert!(packet_nbr < nbr_packets);
        self.header.packet_nbr = packet_nbr;
        self.header.nbr_packets = nbr_packets;
    }

    /// Serialize for the wire: checksum, header, payload. The transport adds
    ///  its own length prefix.
    pub fn ser(&self, out: &mut BytesMut) {
        let mut body = BytesMut::new();
        self.header.ser(&mut body);
        body.extend_from_slice(&self.payload);

        out.extend_from_slice(&Checksum::new(&body).0.to_be_bytes());
        out.extend_from_slice(&body);
    }

    pub fn try_deser(mut buf: &[u8]) -> anyhow::Result<Packet> {
        let expected = Checksum((&mut buf).try_get_u64()?);
        if Checksum::new(buf) != expected {
            return Err(anyhow!("packet checksum mismatch - dropping"));
        }
        let header = PacketHeader::try_deser(&mut buf)?;
        Ok(Packet {
            header,
            payload: Bytes::copy_from_slice(buf),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_round_trip() {
        let mut packet = Packet::request(PacketType::SearchRequest, Priority::DEFAULT,
                                         MapId(17), b"query bytes");
        packet.set_request_metadata(RequestId(40), PacketId(2), 9, 123456);

        let mut buf = BytesMut::new();
        packet.ser(&mut buf);
        let actual = Packet::try_deser(&buf).unwrap();
        assert_eq!(actual, packet);
        assert_eq!(actual.request_map_id().unwrap(), MapId(17));
        assert_eq!(actual.body(), b"query bytes");
    }

    #[test]
    fn test_deser_rejects_flipped_bit() {
        let packet = Packet::request(PacketType::SearchRequest, Priority::DEFAULT, MapId(1), b"abc");
        let mut buf = BytesMut::new();
        packet.ser(&mut buf);
        let last = buf.len() - 1;
        buf[last] ^= 0x01;
        assert!(Packet::try_deser(&buf).is_err());
    }

    #[test]
    fn test_reply_copies_routing_ids() {
        let mut request = Packet::request(PacketType::CoveredIdsRequest, Priority::HIGHEST,
                                          MapId::TOP, &[]);
        request.set_request_metadata(RequestId(7), PacketId(3), 2, 99);
        request.set_map_set(1);

        let reply = Packet::reply_to(&request, PacketType::CoveredIdsReply, StatusCode::Ok, &[]);
        assert_eq!(reply.request_id(), RequestId(7));
        assert_eq!(reply.packet_id(), PacketId(3));
        assert_eq!(reply.header().originator, 2);
        assert_eq!(reply.header().timestamp, 99);
        assert_eq!(reply.header().map_set, 1);
        assert_eq!(reply.reply_status().unwrap(), StatusCode::Ok);
    }

    #[test]
    #[should_panic]
    fn test_reply_status_on_request_is_a_caller_error() {
        let packet = Packet::request(PacketType::SearchRequest, Priority::DEFAULT, MapId(1), &[]);
        let _ = packet.reply_status();
    }
}
