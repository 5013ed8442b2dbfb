use std::fmt::{Debug, Display, Formatter};

use anyhow::anyhow;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The number of distinct packet priorities in the system. This is a deployment
///  constant shared between every packet producer and [PacketQueue](crate::queue::packet_queue::PacketQueue):
///  the queue has exactly one lane per priority.
pub const NBR_PRIORITIES: usize = 8;

/// A packet priority. Lower raw value means more urgent; `0` is the highest
///  priority and maps to lane 0 of the packet queue.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Priority(u8);

impl Priority {
    pub const HIGHEST: Priority = Priority(0);
    pub const DEFAULT: Priority = Priority(7);

    pub fn new(raw: u8) -> anyhow::Result<Priority> {
        if (raw as usize) < NBR_PRIORITIES {
            Ok(Priority(raw))
        }
        else {
            Err(anyhow!("priority {} outside the supported range 0..{}", raw, NBR_PRIORITIES))
        }
    }

    pub fn to_raw(&self) -> u8 {
        self.0
    }

    /// The queue lane this priority is stored in.
    pub fn lane(&self) -> usize {
        self.0 as usize
    }
}
impl Debug for Priority {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "prio:{}", self.0)
    }
}

/// Process-wide identifier of one request, shared by every packet the request
///  (and its sub-requests) sends and receives.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RequestId(pub u16);
impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl Debug for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "req:{}", self.0)
    }
}

/// Identifier of one outgoing packet within its request. Together with
///  [RequestId] it keys the matching of replies to sent packets.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PacketId(pub u16);
impl Display for PacketId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl Debug for PacketId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "pkt:{}", self.0)
    }
}

/// Identifier of one map partition. Partitions form a hierarchy of unknown
///  depth; [MapId::TOP] addresses the top of the hierarchy, and a collaborator
///  may answer a lookup with the set of sub-partitions to descend into.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MapId(pub u32);
impl MapId {
    pub const TOP: MapId = MapId(0);

    /// Marker value used in reply payloads to flag "the entries that follow
    ///  are sub-partition ids, not items".
    pub const SUBDIVIDED: MapId = MapId(u32::MAX);
}
impl Debug for MapId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if *self == MapId::SUBDIVIDED {
            write!(f, "map:SUBDIVIDED")
        }
        else {
            write!(f, "map:{}", self.0)
        }
    }
}

/// An item fully qualified by the partition that owns it.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct FullItemId {
    pub map_id: MapId,
    pub item_id: u32,
}

/// The packet subtype. There are many more of these in a full deployment; this
///  crate defines the ones its own requests and the dispatch core exchange.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum PacketType {
    Acknowledge = 1,
    CoveredIdsRequest = 2,
    CoveredIdsReply = 3,
    CoordinateOnItemRequest = 4,
    CoordinateOnItemReply = 5,
    SearchRequest = 6,
    SearchReply = 7,
    TrafficPointRequest = 8,
    TrafficPointReply = 9,
    DisturbancePush = 10,
}
impl PacketType {
    /// The reply type answering a request type, where there is one.
    pub fn reply_type(&self) -> Option<PacketType> {
        match self {
            PacketType::CoveredIdsRequest => Some(PacketType::CoveredIdsReply),
            PacketType::CoordinateOnItemRequest => Some(PacketType::CoordinateOnItemReply),
            PacketType::SearchRequest => Some(PacketType::SearchReply),
            PacketType::TrafficPointRequest => Some(PacketType::TrafficPointReply),
            _ => None,
        }
    }

    /// Replies carry a leading status word in their payload, requests a
    ///  leading map id word.
    pub fn is_reply(&self) -> bool {
        matches!(self,
            PacketType::Acknowledge
            | PacketType::CoveredIdsReply
            | PacketType::CoordinateOnItemReply
            | PacketType::SearchReply
            | PacketType::TrafficPointReply
        )
    }
}

/// Outcome code embedded in every reply packet and reported by every finished
///  request. Collaborator-reported codes are propagated verbatim, never
///  reinterpreted.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum StatusCode {
    Ok = 0,
    NotOk = 1,
    TimeoutError = 2,
    MapNotFound = 3,
    ItemNotFound = 4,
    UnknownPacket = 5,
}

/// The class of worker process a packet is addressed to. Workers are addressed
///  by type (plus partition-set offset) rather than by fixed address; the
///  address table in [DispatchConfig](crate::config::DispatchConfig) does the
///  resolution.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ModuleType {
    Map = 1,
    Search = 2,
    Route = 3,
    Traffic = 4,
    User = 5,
}

/// The kind of a map item, used to key lookup results and to filter searches.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ItemType {
    StreetSegment = 1,
    Street = 2,
    PointOfInterest = 3,
    BuiltUpArea = 4,
    Municipal = 5,
}

/// A WGS84 coordinate in microdegrees.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct Coordinate {
    pub lat: i32,
    pub lon: i32,
}
impl Coordinate {
    /// one microdegree of latitude in meters
    const METERS_PER_MICRODEGREE: f64 = 0.0111;

    /// Equirectangular approximation, plenty for radius pruning of search hits.
    pub fn distance_meters(&self, other: &Coordinate) -> f64 {
        let mean_lat_rad = ((self.lat as f64 + other.lat as f64) * 0.5 * 1e-6).to_radians();
        let d_lat = (self.lat - other.lat) as f64;
        let d_lon = (self.lon - other.lon) as f64 * mean_lat_rad.cos();
        (d_lat * d_lat + d_lon * d_lon).sqrt() * Self::METERS_PER_MICRODEGREE
    }
}

/// An axis-aligned bounding box in microdegrees.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct BoundingBox {
    pub min_lat: i32,
    pub max_lat: i32,
    pub min_lon: i32,
    pub max_lon: i32,
}
impl BoundingBox {
    pub fn contains(&self, coord: &Coordinate) -> bool {
        coord.lat >= self.min_lat && coord.lat <= self.max_lat
            && coord.lon >= self.min_lon && coord.lon <= self.max_lon
    }
}
