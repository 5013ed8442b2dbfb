//! Utilities for testing code built on the dispatch core. They are used for
//!  testing the core itself, and they are exported so that embedders can use
//!  them in their own tests.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use bytes::Bytes;

use crate::packet::packet::Packet;

/// Convenience for unit tests: create a [SocketAddr] from a number, the same
///  number giving the same address and different numbers different addresses.
pub fn test_addr_from_number(number: u16) -> SocketAddr {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, number).into()
}

/// Split a complete reply packet into `nbr_fragments` physical fragments the
///  way a sending module would, for exercising reassembly paths.
pub fn test_fragments_of(reply: &Packet, nbr_fragments: u8) -> Vec<Packet> {
    assert!(nbr_fragments > 0);
    let payload = reply.payload();
    let chunk_size = payload.len().div_ceil(nbr_fragments as usize);

    (0..nbr_fragments).map(|idx| {
        let start = idx as usize * chunk_size;
        let end = (start + chunk_size).min(payload.len());
        let mut header = reply.header().clone();
        header.packet_nbr = idx;
        header.nbr_packets = nbr_fragments;
        Packet::from_parts(header, Bytes::copy_from_slice(&payload[start..end]))
    }).collect()
}

#[cfg(test)]
mod tests {
    use crate::packet::types::{MapId, PacketType, Priority, StatusCode};
    use super::*;

    #[test]
    fn test_fragments_cover_the_whole_payload() {
        let request = Packet::request(PacketType::SearchRequest, Priority::DEFAULT, MapId(1), &[]);
        let reply = Packet::reply_to(&request, PacketType::SearchReply, StatusCode::Ok,
                                     b"0123456789");
        let fragments = test_fragments_of(&reply, 3);

        assert_eq!(fragments.len(), 3);
        let rejoined: Vec<u8> = fragments.iter()
            .flat_map(|f| f.payload().to_vec())
            .collect();
        assert_eq!(rejoined, reply.payload());
    }
}
