use std::collections::{BTreeMap, BTreeSet};

use anyhow::anyhow;
use bytes::{Buf, BufMut, BytesMut};
use tracing::{debug, warn};

use crate::packet::container::PacketContainer;
use crate::packet::packet::Packet;
use crate::packet::types::{BoundingBox, Coordinate, FullItemId, ItemType, MapId, ModuleType,
                           PacketType, Priority, StatusCode};
use crate::packet::wire;
use crate::request::request::{Request, RequestData, RequestState, RequestWithStatus};

/// What the lookup is centered on. The three input modes are mutually
///  exclusive by construction.
#[derive(Clone, Debug)]
pub enum CoveredQuery {
    Coordinate {
        center: Coordinate,
        outer_radius: u32,
        inner_radius: u32,
        start_angle: u32,
        stop_angle: u32,
    },
    Item {
        id: FullItemId,
        offset: u16,
        outer_radius: u32,
    },
    BoundingBox(BoundingBox),
}

impl CoveredQuery {
    /// Circle around a coordinate, the common case.
    pub fn around_coordinate(center: Coordinate, radius_meters: u32) -> CoveredQuery {
        CoveredQuery::Coordinate {
            center,
            outer_radius: radius_meters,
            inner_radius: 0,
            start_angle: 0,
            stop_angle: 360,
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum LookupState {
    SendingPackets,
    Done,
    Error,
}

/// Area lookup request: finds the items of the wanted types covered by a
///  radius/sector/bounding-box area, descending a partition hierarchy of
///  unknown depth as it goes.
///
/// The initial lookup goes to the top of the hierarchy. A partition may
///  answer either with terminal items, or with the set of sub-partitions that
///  actually cover the area - in which case one new lookup is fanned out per
///  sub-partition. The request is done exactly when no lookup is outstanding.
pub struct CoveredIdsRequest {
    state: RequestState,
    query: CoveredQuery,
    item_types: BTreeSet<ItemType>,

    lookup_state: LookupState,
    status: StatusCode,
    nbr_outstanding: u32,

    covered: BTreeMap<ItemType, Vec<FullItemId>>,
    covered_maps: BTreeSet<MapId>,
}

impl CoveredIdsRequest {
    /// An empty `item_types` set asks for items of every type.
    pub fn new(data: RequestData, query: CoveredQuery, item_types: BTreeSet<ItemType>)
               -> CoveredIdsRequest
    {
        let mut req = CoveredIdsRequest {
            state: RequestState::new(data),
            query,
            item_types,
            lookup_state: LookupState::SendingPackets,
            status: StatusCode::Ok,
            nbr_outstanding: 0,
            covered: BTreeMap::new(),
            covered_maps: BTreeSet::new(),
        };
        req.send_lookup(MapId::TOP);
        req
    }

    /// The covered items found so far, keyed by item type and attributed to
    ///  the partition that reported them. Complete once the request is done.
    pub fn covered_ids(&self) -> &BTreeMap<ItemType, Vec<FullItemId>> {
        &self.covered
    }

    /// The partitions that reported terminal results.
    pub fn covered_maps(&self) -> &BTreeSet<MapId> {
        &self.covered_maps
    }

    fn send_lookup(&mut self, target: MapId) {
        let mut packet = build_lookup_packet(target, &self.query, &self.item_types);
        self.state.update_ids(&mut packet);
        self.state.enqueue_packet_container(
            PacketContainer::for_module(packet, ModuleType::Map, 0));
        self.nbr_outstanding += 1;
    }

    fn fail(&mut self, status: StatusCode) {
        self.status = status;
        self.lookup_state = LookupState::Error;
        self.state.mark_done();
    }
}

impl Request for CoveredIdsRequest {
    fn state(&self) -> &RequestState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut RequestState {
        &mut self.state
    }

    fn process_packet(&mut self, mut pack: PacketContainer) {
        if self.lookup_state != LookupState::SendingPackets {
            debug!(request_id = %self.request_id(), state = ?self.lookup_state,
                   "reply for a finished lookup - ignoring");
            return;
        }

        let answer = match pack.take_answer() {
            Some(answer) => answer,
            None => {
                warn!(request_id = %self.request_id(), "fed a container without an answer");
                self.fail(StatusCode::TimeoutError);
                return;
            }
        };

        if answer.packet_type() != PacketType::CoveredIdsReply {
            warn!(request_id = %self.request_id(), packet_type = ?answer.packet_type(),
                  "unexpected packet type for an area lookup");
            self.fail(StatusCode::UnknownPacket);
            return;
        }

        let status = answer.reply_status().unwrap_or(StatusCode::NotOk);
        if status != StatusCode::Ok {
            self.fail(status);
            return;
        }

        match try_parse_reply(&answer) {
            Ok(LookupReply::SubPartitions(sub_maps)) => {
                debug!(request_id = %self.request_id(), nbr = sub_maps.len(),
                       "descending into sub-partitions");
                for map_id in sub_maps {
                    self.send_lookup(map_id);
                }
                self.nbr_outstanding -= 1;
            }
            Ok(LookupReply::Items { map_id, items }) => {
                self.covered_maps.insert(map_id);
                for (item_type, item_id) in items {
                    self.covered.entry(item_type)
                        .or_default()
                        .push(FullItemId { map_id, item_id });
                }
                self.nbr_outstanding -= 1;
            }
            Err(e) => {
                warn!(request_id = %self.request_id(), "malformed lookup reply: {}", e);
                self.fail(StatusCode::NotOk);
                return;
            }
        }

        if self.nbr_outstanding == 0 {
            self.lookup_state = LookupState::Done;
            self.state.mark_done();
        }
    }
}

impl RequestWithStatus for CoveredIdsRequest {
    fn status(&self) -> StatusCode {
        match self.lookup_state {
            LookupState::Done => StatusCode::Ok,
            LookupState::Error => self.status,
            LookupState::SendingPackets => StatusCode::TimeoutError,
        }
    }
}

const MODE_COORDINATE: u8 = 0;
const MODE_ITEM: u8 = 1;
const MODE_BOUNDING_BOX: u8 = 2;

fn build_lookup_packet(target: MapId, query: &CoveredQuery, item_types: &BTreeSet<ItemType>)
                       -> Packet
{
    let mut body = BytesMut::new();
    match query {
        CoveredQuery::Coordinate { center, outer_radius, inner_radius, start_angle, stop_angle } => {
            body.put_u8(MODE_COORDINATE);
            wire::put_coordinate(&mut body, center);
            body.put_u32(*outer_radius);
            body.put_u32(*inner_radius);
            body.put_u32(*start_angle);
            body.put_u32(*stop_angle);
        }
        CoveredQuery::Item { id, offset, outer_radius } => {
            body.put_u8(MODE_ITEM);
            wire::put_item_id(&mut body, id);
            body.put_u16(*offset);
            body.put_u32(*outer_radius);
        }
        CoveredQuery::BoundingBox(bbox) => {
            body.put_u8(MODE_BOUNDING_BOX);
            body.put_i32(bbox.min_lat);
            body.put_i32(bbox.max_lat);
            body.put_i32(bbox.min_lon);
            body.put_i32(bbox.max_lon);
        }
    }
    body.put_u8(item_types.len() as u8);
    for item_type in item_types {
        body.put_u8((*item_type).into());
    }

    Packet::request(PacketType::CoveredIdsRequest, Priority::DEFAULT, target, &body)
}

enum LookupReply {
    /// the partition does not hold the items itself; descend into these
    SubPartitions(Vec<MapId>),
    /// terminal result from one partition
    Items { map_id: MapId, items: Vec<(ItemType, u32)> },
}

fn try_parse_reply(answer: &Packet) -> anyhow::Result<LookupReply> {
    let mut buf = answer.body();

    let map_id = MapId(buf.try_get_u32()?);
    let count = buf.try_get_u32()? as usize;

    if map_id == MapId::SUBDIVIDED {
        let mut sub_maps = Vec::with_capacity(count);
        for _ in 0..count {
            sub_maps.push(MapId(buf.try_get_u32()?));
        }
        Ok(LookupReply::SubPartitions(sub_maps))
    }
    else {
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            let item_type = ItemType::try_from(buf.try_get_u8()?)
                .map_err(|e| anyhow!("unknown item type: {}", e))?;
            let item_id = buf.try_get_u32()?;
            items.push((item_type, item_id));
        }
        Ok(LookupReply::Items { map_id, items })
    }
}

/// Reply payload builder, exported for collaborator implementations and tests.
pub fn build_sub_partitions_reply(request: &Packet, sub_maps: &[MapId]) -> Packet {
    let mut body = BytesMut::new();
    body.put_u32(MapId::SUBDIVIDED.0);
    body.put_u32(sub_maps.len() as u32);
    for map_id in sub_maps {
        body.put_u32(map_id.0);
    }
    Packet::reply_to(request, PacketType::CoveredIdsReply, StatusCode::Ok, &body)
}

/// Reply payload builder, exported for collaborator implementations and tests.
pub fn build_items_reply(request: &Packet, status: StatusCode, map_id: MapId,
                         items: &[(ItemType, u32)]) -> Packet
{
    let mut body = BytesMut::new();
    body.put_u32(map_id.0);
    body.put_u32(items.len() as u32);
    for (item_type, item_id) in items {
        body.put_u8((*item_type).into());
        body.put_u32(*item_id);
    }
    Packet::reply_to(request, PacketType::CoveredIdsReply, status, &body)
}
