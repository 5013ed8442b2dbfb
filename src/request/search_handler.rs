use std::collections::BTreeSet;

use bytes::{Buf, BufMut, BytesMut};
use tracing::{debug, warn};

use crate::packet::container::PacketContainer;
use crate::packet::packet::Packet;
use crate::packet::types::{MapId, ModuleType, PacketType, Priority, StatusCode};
use crate::packet::wire;
use crate::request::request::RequestData;
use crate::request::search::{put_match, try_get_match, SearchHandler, SearchMatch, SearchParams};

/// The stock matching collaborator: fans one search packet out per covered
///  partition and merges the per-partition matches as the replies come in.
///  Succeeds only if every partition answered Ok; the first failure code is
///  kept.
pub struct PartitionedSearchHandler {
    nbr_outstanding: u32,
    started: bool,
    status: StatusCode,
    matches: Vec<SearchMatch>,
    ready: Vec<PacketContainer>,
}

impl PartitionedSearchHandler {
    pub fn new() -> PartitionedSearchHandler {
        PartitionedSearchHandler {
            nbr_outstanding: 0,
            started: false,
            status: StatusCode::Ok,
            matches: Vec::new(),
            ready: Vec::new(),
        }
    }
}

impl Default for PartitionedSearchHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl SearchHandler for PartitionedSearchHandler {
    fn start_search(&mut self, data: &RequestData, maps: &BTreeSet<MapId>, params: &SearchParams) {
        assert!(!self.started, "search collaborator started twice");
        self.started = true;

        for &map_id in maps {
            let mut packet = build_search_packet(map_id, params);
            data.update_ids(&mut packet);
            self.ready.push(PacketContainer::for_module(packet, ModuleType::Search, 0));
            self.nbr_outstanding += 1;
        }
        debug!(nbr_partitions = maps.len(), query = %params.query, "search fanned out");
    }

    fn process_packet(&mut self, mut pack: PacketContainer) -> bool {
        let answer = match pack.take_answer() {
            Some(answer) => answer,
            None => return false,
        };
        if answer.packet_type() != PacketType::SearchReply {
            return false;
        }
        if self.nbr_outstanding == 0 {
            debug!("search reply after the last partition answered - ignoring");
            return true;
        }
        self.nbr_outstanding -= 1;

        let status = answer.reply_status().unwrap_or(StatusCode::NotOk);
        if status != StatusCode::Ok {
            if self.status == StatusCode::Ok {
                self.status = status;
            }
            return true;
        }

        match try_parse_matches(&answer) {
            Ok(mut matches) => self.matches.append(&mut matches),
            Err(e) => {
                warn!("malformed search reply: {}", e);
                if self.status == StatusCode::Ok {
                    self.status = StatusCode::NotOk;
                }
            }
        }
        true
    }

    fn request_done(&self) -> bool {
        self.started && self.nbr_outstanding == 0
    }

    fn status(&self) -> StatusCode {
        self.status
    }

    fn next_packet(&mut self) -> Option<PacketContainer> {
        self.ready.pop()
    }

    fn take_matches(&mut self) -> Vec<SearchMatch> {
        std::mem::take(&mut self.matches)
    }

    fn answer(&mut self) -> Option<PacketContainer> {
        None
    }
}

fn build_search_packet(map_id: MapId, params: &SearchParams) -> Packet {
    let mut body = BytesMut::new();
    wire::put_string(&mut body, &params.query);
    body.put_u32(params.max_hits);
    body.put_u8(params.item_types.len() as u8);
    for item_type in &params.item_types {
        body.put_u8((*item_type).into());
    }
    Packet::request(PacketType::SearchRequest, Priority::DEFAULT, map_id, &body)
}

fn try_parse_matches(answer: &Packet) -> anyhow::Result<Vec<SearchMatch>> {
    let mut buf = answer.body();
    let count = buf.try_get_u32()? as usize;
    let mut matches = Vec::with_capacity(count);
    for _ in 0..count {
        matches.push(try_get_match(&mut buf)?);
    }
    Ok(matches)
}

/// Reply payload builder, exported for collaborator implementations and tests.
pub fn build_search_reply(request: &Packet, status: StatusCode, matches: &[SearchMatch]) -> Packet {
    let mut body = BytesMut::new();
    body.put_u32(matches.len() as u32);
    for m in matches {
        put_match(&mut body, m);
    }
    Packet::reply_to(request, PacketType::SearchReply, status, &body)
}
