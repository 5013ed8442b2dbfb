use std::collections::BTreeSet;

use anyhow::anyhow;
use bytes::{Buf, BufMut, BytesMut};
#[cfg(test)] use mockall::automock;
use tracing::{debug, warn};

use crate::packet::container::PacketContainer;
use crate::packet::header::PacketHeader;
use crate::packet::packet::Packet;
use crate::packet::types::{BoundingBox, Coordinate, FullItemId, ItemType, MapId, ModuleType,
                           PacketType, Priority, StatusCode};
use crate::packet::wire;
use crate::request::covered_ids::{CoveredIdsRequest, CoveredQuery};
use crate::request::request::{process_sub_request_packet, Request, RequestData, RequestState,
                              RequestWithStatus};

/// Where a search is anchored. A bare item reference must first be resolved to
///  a coordinate before the covering phase can run.
#[derive(Clone, Debug)]
pub enum SearchOrigin {
    Coordinate(Coordinate),
    BoundingBox(BoundingBox),
    Item { id: FullItemId, offset: u16 },
}

#[derive(Clone, Debug)]
pub struct SearchParams {
    pub query: String,
    pub max_hits: u32,
    pub radius_meters: u32,
    /// empty means all types
    pub item_types: BTreeSet<ItemType>,
}

/// One search hit. A match carrying sub-regions represents an area (a
///  municipality, a built-up area) whose extent may legitimately reach
///  outside the query radius, which exempts it from distance pruning.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct SearchMatch {
    pub name: String,
    pub id: FullItemId,
    pub item_type: ItemType,
    pub location: Coordinate,
    pub sub_regions: Vec<FullItemId>,
}

/// The matching collaborator the third phase delegates to, driven the same
///  way a sub-request is: feed packets in, drain packets out, fold the status
///  into the owning request once done.
#[cfg_attr(test, automock)]
pub trait SearchHandler: Send {
    /// Begin matching over the given partitions. Packets to send afterwards
    ///  are available from [SearchHandler::next_packet].
    fn start_search(&mut self, data: &RequestData, maps: &BTreeSet<MapId>, params: &SearchParams);

    /// Consume one received container. Returns false if the packet does not
    ///  belong to this search, which the owning request treats as a protocol
    ///  violation.
    fn process_packet(&mut self, pack: PacketContainer) -> bool;

    fn request_done(&self) -> bool;

    fn status(&self) -> StatusCode;

    fn next_packet(&mut self) -> Option<PacketContainer>;

    /// Hand over the accumulated matches; valid once done.
    fn take_matches(&mut self) -> Vec<SearchMatch>;

    /// An answer packet of the collaborator's own making, if it has one.
    fn answer(&mut self) -> Option<PacketContainer>;
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum SearchState {
    GettingCoordForOrig,
    UsingCoveredIdReq,
    Searching,
    DoneOk,
    Error,
}

/// Multi-phase search: resolve the origin to a coordinate if necessary, find
///  the partitions covering the search area through an embedded
///  [CoveredIdsRequest], then match within those partitions through the
///  [SearchHandler]. Matches are distance-pruned and sorted before the
///  request reports done.
pub struct SearchRequest {
    state: RequestState,
    search_state: SearchState,
    status: StatusCode,
    params: SearchParams,

    position: Option<Coordinate>,
    bbox: Option<BoundingBox>,

    covered: Option<CoveredIdsRequest>,
    handler: Box<dyn SearchHandler>,
    matches: Vec<SearchMatch>,
}

impl SearchRequest {
    pub fn new(data: RequestData, origin: SearchOrigin, params: SearchParams,
               handler: Box<dyn SearchHandler>) -> SearchRequest
    {
        let mut req = SearchRequest {
            state: RequestState::new(data),
            search_state: SearchState::GettingCoordForOrig,
            status: StatusCode::TimeoutError,
            params,
            position: None,
            bbox: None,
            covered: None,
            handler,
            matches: Vec::new(),
        };

        match origin {
            SearchOrigin::Item { id, offset } => {
                let mut packet = build_coordinate_on_item_packet(id, offset);
                req.state.update_ids(&mut packet);
                req.state.enqueue_packet_container(
                    PacketContainer::for_module(packet, ModuleType::Map, 0));
                req.search_state = SearchState::GettingCoordForOrig;
            }
            SearchOrigin::Coordinate(center) => {
                req.position = Some(center);
                req.start_covering(
                    CoveredQuery::around_coordinate(center, req.params.radius_meters));
            }
            SearchOrigin::BoundingBox(bbox) => {
                req.bbox = Some(bbox);
                req.start_covering(CoveredQuery::BoundingBox(bbox));
            }
        }
        req
    }

    /// The filtered, sorted matches; complete once the request is done.
    pub fn matches(&self) -> &[SearchMatch] {
        &self.matches
    }

    pub fn position(&self) -> Option<Coordinate> {
        self.position
    }

    fn start_covering(&mut self, query: CoveredQuery) {
        let mut child = CoveredIdsRequest::new(
            self.state.data().child(), query, self.params.item_types.clone());
        self.state.adopt_packets_from(&mut child);
        self.covered = Some(child);
        self.search_state = SearchState::UsingCoveredIdReq;
    }

    fn fail(&mut self, status: StatusCode) {
        self.status = status;
        self.search_state = SearchState::Error;
        self.state.mark_done();
    }

    fn handle_coord_for_orig(&mut self, mut pack: PacketContainer) {
        let answer = match pack.take_answer() {
            Some(answer) => answer,
            None => {
                warn!(request_id = %self.request_id(), "fed a container without an answer");
                self.fail(StatusCode::TimeoutError);
                return;
            }
        };
        if answer.packet_type() != PacketType::CoordinateOnItemReply {
            warn!(request_id = %self.request_id(), packet_type = ?answer.packet_type(),
                  "unexpected packet type while resolving the origin coordinate");
            self.fail(StatusCode::UnknownPacket);
            return;
        }
        let status = answer.reply_status().unwrap_or(StatusCode::NotOk);
        if status != StatusCode::Ok {
            self.fail(status);
            return;
        }
        match try_parse_coordinate_reply(&answer) {
            Ok(center) => {
                debug!(request_id = %self.request_id(), ?center, "origin resolved");
                self.position = Some(center);
                self.start_covering(
                    CoveredQuery::around_coordinate(center, self.params.radius_meters));
            }
            Err(e) => {
                warn!(request_id = %self.request_id(), "malformed coordinate reply: {}", e);
                self.fail(StatusCode::NotOk);
            }
        }
    }

    fn handle_covered_done(&mut self) {
        let child = self.covered.take().expect("covering finished without a covering sub-request");
        let maps = child.covered_maps().clone();
        debug!(request_id = %self.request_id(), nbr_maps = maps.len(), "covering done, searching");

        self.handler.start_search(self.state.data(), &maps, &self.params);
        while let Some(container) = self.handler.next_packet() {
            self.state.enqueue_packet_container(container);
        }
        self.search_state = SearchState::Searching;

        // a search over nothing (or a collaborator that fails fast) may be
        // done before the first reply arrives
        self.poll_search_done();
    }

    fn poll_search_done(&mut self) {
        if !self.handler.request_done() {
            return;
        }
        if self.handler.status() == StatusCode::Ok {
            self.matches = self.handler.take_matches();
            self.post_filter_and_sort();
            self.search_state = SearchState::DoneOk;
            self.status = StatusCode::Ok;
        }
        else {
            self.fail(self.handler.status());
            return;
        }
        self.state.mark_done();
    }

    /// Prune matches outside the query area - except matches that carry
    ///  sub-regions, whose represented area may extend past it - then sort by
    ///  distance from the origin (name as tiebreak and fallback).
    fn post_filter_and_sort(&mut self) {
        if let Some(position) = self.position {
            let radius = self.params.radius_meters as f64;
            self.matches.retain(|m| {
                !m.sub_regions.is_empty() || position.distance_meters(&m.location) <= radius
            });
            self.matches.sort_by(|a, b| {
                position.distance_meters(&a.location)
                    .total_cmp(&position.distance_meters(&b.location))
                    .then_with(|| a.name.cmp(&b.name))
            });
        }
        else if let Some(bbox) = self.bbox {
            self.matches.retain(|m| !m.sub_regions.is_empty() || bbox.contains(&m.location));
            self.matches.sort_by(|a, b| a.name.cmp(&b.name));
        }
        if self.matches.len() > self.params.max_hits as usize {
            self.matches.truncate(self.params.max_hits as usize);
        }
    }
}

impl Request for SearchRequest {
    fn state(&self) -> &RequestState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut RequestState {
        &mut self.state
    }

    fn process_packet(&mut self, pack: PacketContainer) {
        match self.search_state {
            SearchState::GettingCoordForOrig => {
                self.handle_coord_for_orig(pack);
            }
            SearchState::UsingCoveredIdReq => {
                let child = self.covered.as_mut()
                    .expect("covering state without a covering sub-request");
                match process_sub_request_packet(&mut self.state, child, Some(pack)) {
                    Some(StatusCode::Ok) => self.handle_covered_done(),
                    Some(status) => self.fail(status),
                    None => {} // keep on truckin'
                }
            }
            SearchState::Searching => {
                if !self.handler.process_packet(pack) {
                    warn!(request_id = %self.request_id(),
                          "search collaborator rejected a packet");
                    self.fail(self.handler.status());
                    return;
                }
                if !self.handler.request_done() {
                    while let Some(container) = self.handler.next_packet() {
                        self.state.enqueue_packet_container(container);
                    }
                }
                self.poll_search_done();
            }
            SearchState::DoneOk | SearchState::Error => {
                debug!(request_id = %self.request_id(), state = ?self.search_state,
                       "reply for a finished search - ignoring");
            }
        }
    }

    fn request_done(&self) -> bool {
        matches!(self.search_state, SearchState::DoneOk | SearchState::Error)
    }

    fn get_answer(&mut self) -> Option<PacketContainer> {
        if let Some(answer) = self.handler.answer() {
            return Some(answer);
        }
        // no collaborator answer (maybe the search never got that far):
        // synthesize a reply carrying the status and the merged matches
        let mut body = BytesMut::new();
        body.put_u32(self.matches.len() as u32);
        for m in &self.matches {
            put_match(&mut body, m);
        }
        let mut payload = BytesMut::new();
        payload.put_u32(self.status().into());
        payload.extend_from_slice(&body);

        let mut header = PacketHeader::new(PacketType::SearchReply, Priority::DEFAULT);
        header.request_id = self.state.request_id();
        header.originator = self.state.data().originator();
        header.timestamp = self.state.data().timestamp();
        Some(PacketContainer::new_answer(Packet::from_parts(header, payload.freeze())))
    }
}

impl RequestWithStatus for SearchRequest {
    fn status(&self) -> StatusCode {
        match self.search_state {
            SearchState::DoneOk => StatusCode::Ok,
            SearchState::Error => self.status,
            // a caller asking before completion is treated as timed out,
            // never as success
            _ => StatusCode::TimeoutError,
        }
    }
}

fn build_coordinate_on_item_packet(id: FullItemId, offset: u16) -> Packet {
    let mut body = BytesMut::new();
    body.put_u32(id.item_id);
    body.put_u16(offset);
    Packet::request(PacketType::CoordinateOnItemRequest, Priority::DEFAULT, id.map_id, &body)
}

fn try_parse_coordinate_reply(answer: &Packet) -> anyhow::Result<Coordinate> {
    let mut buf = answer.body();
    wire::try_get_coordinate(&mut buf)
}

/// Reply payload builder, exported for collaborator implementations and tests.
pub fn build_coordinate_reply(request: &Packet, status: StatusCode, coord: &Coordinate) -> Packet {
    let mut body = BytesMut::new();
    wire::put_coordinate(&mut body, coord);
    Packet::reply_to(request, PacketType::CoordinateOnItemReply, status, &body)
}

pub(crate) fn put_match(buf: &mut BytesMut, m: &SearchMatch) {
    buf.put_u8(m.item_type.into());
    wire::put_item_id(buf, &m.id);
    wire::put_coordinate(buf, &m.location);
    buf.put_u8(m.sub_regions.len() as u8);
    for region in &m.sub_regions {
        wire::put_item_id(buf, region);
    }
    wire::put_string(buf, &m.name);
}

pub(crate) fn try_get_match(buf: &mut impl Buf) -> anyhow::Result<SearchMatch> {
    let item_type = ItemType::try_from(buf.try_get_u8()?)
        .map_err(|e| anyhow!("unknown item type: {}", e))?;
    let id = wire::try_get_item_id(buf)?;
    let location = wire::try_get_coordinate(buf)?;
    let nbr_regions = buf.try_get_u8()? as usize;
    let mut sub_regions = Vec::with_capacity(nbr_regions);
    for _ in 0..nbr_regions {
        sub_regions.push(wire::try_get_item_id(buf)?);
    }
    let name = wire::try_get_string(buf)?;
    Ok(SearchMatch { name, id, item_type, location, sub_regions })
}

#[cfg(test)]
mod tests {
    use mockall::predicate::always;

    use crate::packet::types::RequestId;
    use crate::request::covered_ids::build_items_reply;
    use super::*;

    fn params() -> SearchParams {
        SearchParams {
            query: "storgatan".to_string(),
            max_hits: 100,
            radius_meters: 2000,
            item_types: BTreeSet::from([ItemType::PointOfInterest]),
        }
    }

    fn center() -> Coordinate {
        Coordinate { lat: 55_700_000, lon: 13_200_000 }
    }

    fn poi(name: &str, item_id: u32, location: Coordinate) -> SearchMatch {
        SearchMatch {
            name: name.to_string(),
            id: FullItemId { map_id: MapId(10), item_id },
            item_type: ItemType::PointOfInterest,
            location,
            sub_regions: Vec::new(),
        }
    }

    /// drives the embedded covering phase to completion with one terminal
    ///  reply from the top partition
    fn complete_covering(req: &mut SearchRequest, map_id: MapId) {
        let mut lookup = req.get_next_packet().unwrap();
        let reply = build_items_reply(lookup.packet().unwrap(), StatusCode::Ok, map_id,
                                      &[(ItemType::PointOfInterest, 1)]);
        lookup.add_answer(reply);
        req.process_packet(lookup);
    }

    fn handler_expecting_search(maps_hit: &'static [u32]) -> MockSearchHandler {
        let mut handler = MockSearchHandler::new();
        handler.expect_start_search()
            .withf(move |_, maps, _| {
                maps.iter().map(|m| m.0).collect::<Vec<_>>() == maps_hit
            })
            .times(1)
            .return_const(());
        handler
    }

    #[test]
    fn test_coordinate_origin_skips_the_resolution_phase() {
        let mut handler = MockSearchHandler::new();
        handler.expect_start_search().never();

        let req = SearchRequest::new(
            RequestData::new(RequestId(70), 0),
            SearchOrigin::Coordinate(center()),
            params(),
            Box::new(handler),
        );
        // the first packet out is already the covering lookup
        assert_eq!(req.state().nbr_outstanding_packets(), 1);
        assert_eq!(req.status(), StatusCode::TimeoutError);
    }

    #[test]
    fn test_item_origin_resolves_a_coordinate_first() {
        let mut handler = handler_expecting_search(&[3]);
        handler.expect_next_packet().returning(|| None);
        handler.expect_request_done().returning(|| false);

        let mut req = SearchRequest::new(
            RequestData::new(RequestId(70), 0),
            SearchOrigin::Item { id: FullItemId { map_id: MapId(3), item_id: 17 }, offset: 0 },
            params(),
            Box::new(handler),
        );

        let mut sent = req.get_next_packet().unwrap();
        assert_eq!(sent.packet().unwrap().packet_type(), PacketType::CoordinateOnItemRequest);
        assert_eq!(sent.packet().unwrap().request_map_id().unwrap(), MapId(3));

        let reply = build_coordinate_reply(sent.packet().unwrap(), StatusCode::Ok, &center());
        sent.add_answer(reply);
        req.process_packet(sent);
        assert_eq!(req.position(), Some(center()));

        // now in the covering phase; finish it and expect the mock's
        // start_search to fire for partition 3
        complete_covering(&mut req, MapId(3));
        assert!(!req.request_done());
    }

    #[test]
    fn test_origin_resolution_failure_propagates() {
        let mut handler = MockSearchHandler::new();
        handler.expect_start_search().never();

        let mut req = SearchRequest::new(
            RequestData::new(RequestId(70), 0),
            SearchOrigin::Item { id: FullItemId { map_id: MapId(3), item_id: 17 }, offset: 0 },
            params(),
            Box::new(handler),
        );
        let mut sent = req.get_next_packet().unwrap();
        let reply = build_coordinate_reply(sent.packet().unwrap(), StatusCode::ItemNotFound,
                                           &Coordinate { lat: 0, lon: 0 });
        sent.add_answer(reply);
        req.process_packet(sent);

        assert!(req.request_done());
        assert_eq!(req.status(), StatusCode::ItemNotFound);
    }

    #[test]
    fn test_covering_failure_propagates_the_child_status() {
        let mut handler = MockSearchHandler::new();
        handler.expect_start_search().never();

        let mut req = SearchRequest::new(
            RequestData::new(RequestId(70), 0),
            SearchOrigin::Coordinate(center()),
            params(),
            Box::new(handler),
        );
        let mut lookup = req.get_next_packet().unwrap();
        let reply = build_items_reply(lookup.packet().unwrap(), StatusCode::MapNotFound,
                                      MapId::TOP, &[]);
        lookup.add_answer(reply);
        req.process_packet(lookup);

        assert!(req.request_done());
        assert_eq!(req.status(), StatusCode::MapNotFound);
    }

    #[test]
    fn test_matches_are_pruned_and_sorted_on_completion() {
        let near = poi("near", 1, Coordinate { lat: 55_700_100, lon: 13_200_000 });
        let nearer = poi("nearer", 2, Coordinate { lat: 55_700_050, lon: 13_200_000 });
        // several km away, outside the 2km radius
        let far = poi("far", 3, Coordinate { lat: 55_200_000, lon: 13_200_000 });
        // also far away, but represents an area - exempt from pruning
        let area = SearchMatch {
            sub_regions: vec![FullItemId { map_id: MapId(10), item_id: 99 }],
            ..poi("wide area", 4, Coordinate { lat: 55_200_000, lon: 13_200_000 })
        };

        let all = vec![far.clone(), near.clone(), area.clone(), nearer.clone()];
        let mut handler = handler_expecting_search(&[10]);
        handler.expect_next_packet().returning(|| None);
        handler.expect_request_done().returning(|| true);
        handler.expect_status().returning(|| StatusCode::Ok);
        handler.expect_take_matches().times(1).return_once(move || all);

        let mut req = SearchRequest::new(
            RequestData::new(RequestId(70), 0),
            SearchOrigin::Coordinate(center()),
            params(),
            Box::new(handler),
        );
        complete_covering(&mut req, MapId(10));

        assert!(req.request_done());
        assert_eq!(req.status(), StatusCode::Ok);
        let names: Vec<&str> = req.matches().iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["nearer", "near", "wide area"]);
    }

    #[test]
    fn test_collaborator_failure_during_matching() {
        let mut handler = handler_expecting_search(&[10]);
        handler.expect_next_packet().returning(|| None);
        handler.expect_request_done().returning(|| false);
        handler.expect_process_packet().with(always()).return_const(false);
        handler.expect_status().returning(|| StatusCode::NotOk);

        let mut req = SearchRequest::new(
            RequestData::new(RequestId(70), 0),
            SearchOrigin::Coordinate(center()),
            params(),
            Box::new(handler),
        );
        complete_covering(&mut req, MapId(10));
        assert!(!req.request_done());

        // any reply the collaborator rejects is a protocol violation
        let bogus = Packet::reply_to(
            &Packet::request(PacketType::SearchRequest, Priority::DEFAULT, MapId(10), &[]),
            PacketType::SearchReply, StatusCode::Ok, &[]);
        req.process_packet(PacketContainer::new_answer(bogus));

        assert!(req.request_done());
        assert_eq!(req.status(), StatusCode::NotOk);
    }

    #[test]
    fn test_answer_is_synthesized_when_the_collaborator_has_none() {
        let mut handler = handler_expecting_search(&[10]);
        handler.expect_next_packet().returning(|| None);
        handler.expect_request_done().returning(|| true);
        handler.expect_status().returning(|| StatusCode::Ok);
        handler.expect_take_matches().return_once(Vec::new);
        handler.expect_answer().returning(|| None);

        let mut req = SearchRequest::new(
            RequestData::new(RequestId(70), 0),
            SearchOrigin::Coordinate(center()),
            params(),
            Box::new(handler),
        );
        complete_covering(&mut req, MapId(10));
        assert!(req.request_done());

        let answer = req.get_answer().unwrap();
        let packet = answer.answer().unwrap();
        assert_eq!(packet.packet_type(), PacketType::SearchReply);
        assert_eq!(packet.reply_status().unwrap(), StatusCode::Ok);
        assert_eq!(packet.request_id(), RequestId(70));
    }
}
