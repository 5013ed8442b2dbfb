use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::{debug, warn};

use crate::packet::container::PacketContainer;
use crate::packet::packet::Packet;
use crate::packet::types::{Coordinate, FullItemId, MapId, ModuleType, PacketType, Priority, StatusCode};
use crate::packet::wire;
use crate::request::request::{Request, RequestData, RequestState, RequestWithStatus};

/// Which direction of travel a disturbance applies to.
#[derive(Copy, Clone, Eq, PartialEq, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum RoadDirection {
    Both = 0,
    Positive = 1,
    Negative = 2,
}

/// Input for a traffic-point lookup: where a disturbance was reported, how far
///  to search for the road network around it, and how many points to map it
///  onto.
#[derive(Clone, Debug)]
pub struct TrafficPointQuery {
    pub center: Coordinate,
    pub max_distance: u32,
    pub nbr_points: u32,
    pub direction: RoadDirection,
}

/// One point on the road network that a disturbance maps onto.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct TrafficPoint {
    pub id: FullItemId,
    pub coord: Coordinate,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum LookupState {
    SendingPackets,
    Done,
    Error,
}

/// Resolves a reported disturbance coordinate to the road-network points the
///  disturbance bookkeeping stores: one packet to the traffic collaborator,
///  one terminal reply.
pub struct TrafficPointRequest {
    state: RequestState,
    lookup_state: LookupState,
    status: StatusCode,
    points: Vec<TrafficPoint>,
    answer: Option<PacketContainer>,
}

impl TrafficPointRequest {
    pub fn new(data: RequestData, query: &TrafficPointQuery) -> TrafficPointRequest {
        let mut state = RequestState::new(data);

        let mut body = BytesMut::new();
        wire::put_coordinate(&mut body, &query.center);
        body.put_u32(query.max_distance);
        body.put_u32(query.nbr_points);
        body.put_u8(query.direction.into());

        let mut packet = Packet::request(PacketType::TrafficPointRequest, Priority::DEFAULT,
                                         MapId::TOP, &body);
        state.update_ids(&mut packet);
        state.enqueue_packet_container(
            PacketContainer::for_module(packet, ModuleType::Traffic, 0));

        TrafficPointRequest {
            state,
            lookup_state: LookupState::SendingPackets,
            status: StatusCode::Ok,
            points: Vec::new(),
            answer: None,
        }
    }

    /// The resolved points. Complete once the request is done.
    pub fn traffic_points(&self) -> &[TrafficPoint] {
        &self.points
    }

    fn fail(&mut self, status: StatusCode) {
        self.status = status;
        self.lookup_state = LookupState::Error;
        self.state.mark_done();
    }
}

impl Request for TrafficPointRequest {
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

        if answer.packet_type() != PacketType::TrafficPointReply {
            warn!(request_id = %self.request_id(), packet_type = ?answer.packet_type(),
                  "unexpected packet type for a traffic-point lookup");
            self.fail(StatusCode::UnknownPacket);
            return;
        }

        let status = answer.reply_status().unwrap_or(StatusCode::NotOk);
        if status != StatusCode::Ok {
            self.fail(status);
            return;
        }

        match try_parse_points(&answer) {
            Ok(points) => {
                self.points = points;
                self.answer = Some(PacketContainer::new_answer(answer));
                self.lookup_state = LookupState::Done;
                self.state.mark_done();
            }
            Err(e) => {
                warn!(request_id = %self.request_id(), "malformed traffic-point reply: {}", e);
                self.fail(StatusCode::NotOk);
            }
        }
    }

    fn get_answer(&mut self) -> Option<PacketContainer> {
        self.answer.take()
    }
}

impl RequestWithStatus for TrafficPointRequest {
    fn status(&self) -> StatusCode {
        match self.lookup_state {
            LookupState::Done => StatusCode::Ok,
            LookupState::Error => self.status,
            LookupState::SendingPackets => StatusCode::TimeoutError,
        }
    }
}

fn try_parse_points(answer: &Packet) -> anyhow::Result<Vec<TrafficPoint>> {
    let mut buf = answer.body();
    let count = buf.try_get_u32()? as usize;
    let mut points = Vec::with_capacity(count);
    for _ in 0..count {
        let id = wire::try_get_item_id(&mut buf)?;
        let coord = wire::try_get_coordinate(&mut buf)?;
        points.push(TrafficPoint { id, coord });
    }
    Ok(points)
}

/// Reply payload builder, exported for collaborator implementations and tests.
pub fn build_points_reply(request: &Packet, status: StatusCode, points: &[TrafficPoint]) -> Packet {
    let mut body = BytesMut::new();
    body.put_u32(points.len() as u32);
    for point in points {
        wire::put_item_id(&mut body, &point.id);
        wire::put_coordinate(&mut body, &point.coord);
    }
    Packet::reply_to(request, PacketType::TrafficPointReply, status, &body)
}

#[cfg(test)]
mod tests {
    use crate::packet::types::{FullItemId, RequestId};
    use super::*;

    fn new_request() -> TrafficPointRequest {
        TrafficPointRequest::new(
            RequestData::new(RequestId(61), 0),
            &TrafficPointQuery {
                center: Coordinate { lat: 55_600_000, lon: 13_000_000 },
                max_distance: 500,
                nbr_points: 2,
                direction: RoadDirection::Both,
            },
        )
    }

    #[test]
    fn test_points_resolved_in_one_round_trip() {
        let mut req = new_request();

        let mut sent = req.get_next_packet().unwrap();
        assert!(req.get_next_packet().is_none());

        let points = vec![
            TrafficPoint {
                id: FullItemId { map_id: MapId(2), item_id: 4711 },
                coord: Coordinate { lat: 55_600_100, lon: 13_000_100 },
            },
            TrafficPoint {
                id: FullItemId { map_id: MapId(2), item_id: 4712 },
                coord: Coordinate { lat: 55_600_200, lon: 13_000_200 },
            },
        ];
        let reply = build_points_reply(sent.packet().unwrap(), StatusCode::Ok, &points);
        sent.add_answer(reply);
        req.process_packet(sent);

        assert!(req.request_done());
        assert_eq!(req.status(), StatusCode::Ok);
        assert_eq!(req.traffic_points(), &points[..]);
        assert!(req.get_answer().is_some());
    }

    #[test]
    fn test_failure_status_is_kept_verbatim() {
        let mut req = new_request();
        let mut sent = req.get_next_packet().unwrap();
        let reply = build_points_reply(sent.packet().unwrap(), StatusCode::ItemNotFound, &[]);
        sent.add_answer(reply);
        req.process_packet(sent);

        assert!(req.request_done());
        assert_eq!(req.status(), StatusCode::ItemNotFound);
        assert!(req.traffic_points().is_empty());
    }
}
