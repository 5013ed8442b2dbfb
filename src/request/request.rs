use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering as AtomicOrdering};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::trace;

use crate::packet::container::PacketContainer;
use crate::packet::packet::Packet;
use crate::packet::types::{PacketId, Priority, RequestId, StatusCode};

/// Identity of a request: its process-wide id plus the originator tag and
///  timestamp every packet of the request is stamped with.
///
/// A sub-request clones its parent's `RequestData`, so the whole request tree
///  shares one id, one originator, one timestamp - and one packet-id counter,
///  which keeps `(request id, packet id)` unique across the tree no matter
///  which member sends.
#[derive(Clone, Debug)]
pub struct RequestData {
    id: RequestId,
    originator: u16,
    timestamp: u32,
    packet_ids: Arc<AtomicU16>,
}

impl RequestData {
    /// Data for a request without a parent. The id is process-assigned (see
    ///  [ThreadRequestHandler](crate::handler::request_handler::ThreadRequestHandler)).
    pub fn new(id: RequestId, originator: u16) -> RequestData {
        let timestamp = SystemTime::now().duration_since(UNIX_EPOCH)
            .expect("system time is before UNIX epoch")
            .as_secs() as u32;
        RequestData {
            id,
            originator,
            timestamp,
            packet_ids: Arc::new(AtomicU16::new(1)),
        }
    }

    /// Data for a request that runs inside another request.
    pub fn child(&self) -> RequestData {
        self.clone()
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn originator(&self) -> u16 {
        self.originator
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    fn next_packet_id(&self) -> PacketId {
        PacketId(self.packet_ids.fetch_add(1, AtomicOrdering::Relaxed))
    }

    /// Stamp a freshly built outgoing packet with this request tree's id, the
    ///  next packet id, and the shared originator/timestamp. Every packet must
    ///  pass through here before it is queued for sending.
    pub fn update_ids(&self, packet: &mut Packet) {
        packet.set_request_metadata(self.id, self.next_packet_id(), self.originator, self.timestamp);
    }
}

/// The state every request carries: identity, the priority-ordered collection
///  of packet containers ready to send, the done flag, and bookkeeping
///  counters. Concrete requests embed one of these and layer their own state
///  machine on top.
pub struct RequestState {
    data: RequestData,
    done: bool,

    ready_to_send: BinaryHeap<QueuedContainer>,
    /// tiebreaker keeping extraction FIFO within one priority
    send_seq: u64,

    nbr_sent: u32,
    nbr_received: u32,
    nbr_resent: u32,
    nbr_received_bytes: u64,
    /// accumulated resend counts reported by answers
    total_resend_nbr: u32,
}

struct QueuedContainer {
    priority: Priority,
    seq: u64,
    container: PacketContainer,
}
// BinaryHeap is a max-heap; invert so the smallest (priority, seq) surfaces
impl Ord for QueuedContainer {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}
impl PartialOrd for QueuedContainer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Eq for QueuedContainer {}
impl PartialEq for QueuedContainer {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl RequestState {
    pub fn new(data: RequestData) -> RequestState {
        RequestState {
            data,
            done: false,
            ready_to_send: BinaryHeap::new(),
            send_seq: 0,
            nbr_sent: 0,
            nbr_received: 0,
            nbr_resent: 0,
            nbr_received_bytes: 0,
            total_resend_nbr: 0,
        }
    }

    pub fn data(&self) -> &RequestData {
        &self.data
    }

    pub fn request_id(&self) -> RequestId {
        self.data.id
    }

    /// [RequestData::update_ids] through the embedded data.
    pub fn update_ids(&self, packet: &mut Packet) {
        self.data.update_ids(packet);
    }

    /// [RequestState::update_ids] for a packet already wrapped in a container.
    pub fn update_ids_container(&self, container: &mut PacketContainer) {
        if let Some(packet) = container.packet_mut() {
            self.update_ids(packet);
        }
    }

    /// Put a container into the ready-to-send collection. The container must
    ///  wrap an outgoing packet; queueing an answer container is a broken
    ///  caller.
    pub fn enqueue_packet_container(&mut self, container: PacketContainer) {
        assert!(container.packet().is_some(), "queued a container without an outgoing packet");
        let priority = container.priority();
        let seq = self.send_seq;
        self.send_seq += 1;
        self.ready_to_send.push(QueuedContainer { priority, seq, container });
    }

    /// Pop the highest-priority container that is ready to send; `None` when
    ///  drained. Safe to call repeatedly until exhausted.
    pub fn next_ready_packet(&mut self) -> Option<PacketContainer> {
        self.ready_to_send.pop().map(|q| q.container)
    }

    /// Drain every ready packet from a fully distinct other request into this
    ///  request's own send queue, adopting the child's work as our own.
    ///  Returns the number of packets adopted.
    ///
    /// Delegating a request to itself is unrepresentable - the two mutable
    ///  borrows cannot alias:
    /// ```compile_fail
    /// use modnet::request::request::Request;
    ///
    /// fn broken(req: &mut modnet::request::single_packet::SinglePacketRequest) {
    ///     let state = req.state_mut();
    ///     state.adopt_packets_from(req);
    /// }
    /// ```
    pub fn adopt_packets_from<R: Request + ?Sized>(&mut self, other: &mut R) -> usize {
        let mut nbr_adopted = 0;
        while let Some(container) = other.get_next_packet() {
            self.enqueue_packet_container(container);
            nbr_adopted += 1;
        }
        trace!(request_id = %self.request_id(), nbr_adopted, "adopted packets from sub-request");
        nbr_adopted
    }

    /// Terminal; once done a request stays done.
    pub fn mark_done(&mut self) {
        self.done = true;
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Packets still in flight: queued + sent - received. Used by composite
    ///  requests to decide when a fan-out is finished.
    pub fn nbr_outstanding_packets(&self) -> i64 {
        self.ready_to_send.len() as i64 + self.nbr_sent as i64 - self.nbr_received as i64
    }

    pub fn inc_nbr_sent_packets(&mut self) -> u32 {
        self.nbr_sent += 1;
        self.nbr_sent
    }

    pub fn nbr_sent_packets(&self) -> u32 {
        self.nbr_sent
    }

    pub fn inc_nbr_received_packets(&mut self) -> u32 {
        self.nbr_received += 1;
        self.nbr_received
    }

    pub fn nbr_received_packets(&self) -> u32 {
        self.nbr_received
    }

    pub fn inc_nbr_resent_packets(&mut self, nbr: u32) -> u32 {
        self.nbr_resent += nbr;
        self.nbr_resent
    }

    pub fn nbr_resent_packets(&self) -> u32 {
        self.nbr_resent
    }

    pub fn add_nbr_received_bytes(&mut self, bytes: u64) -> u64 {
        self.nbr_received_bytes += bytes;
        self.nbr_received_bytes
    }

    pub fn add_total_resend_nbr(&mut self, more: u32) {
        self.total_resend_nbr += more;
    }

    pub fn total_resend_nbr(&self) -> u32 {
        self.total_resend_nbr
    }
}

/// A unit of orchestration logic driving an exchange of packets to produce
///  one answer: it emits outgoing packets, consumes incoming ones, and
///  eventually reports itself done.
///
/// `process_packet` is the only mutator driven by external input. At most one
///  thread is inside any single request at a time (the dispatch layer routes
///  by request id); distinct requests progress fully in parallel.
pub trait Request: Send {
    fn state(&self) -> &RequestState;
    fn state_mut(&mut self) -> &mut RequestState;

    /// Consume one received container, advance the state machine, and possibly
    ///  queue follow-up packets.
    fn process_packet(&mut self, pack: PacketContainer);

    /// Terminal-state predicate; once true it stays true.
    fn request_done(&self) -> bool {
        self.state().is_done()
    }

    /// The final result, valid only once [Request::request_done] holds.
    ///  Ownership passes to the caller. Requests whose result is reached
    ///  through accessors instead return `None`.
    fn get_answer(&mut self) -> Option<PacketContainer> {
        None
    }

    /// Pop the highest-priority container that is ready to send; `None` when
    ///  drained.
    fn get_next_packet(&mut self) -> Option<PacketContainer> {
        self.state_mut().next_ready_packet()
    }

    fn request_id(&self) -> RequestId {
        self.state().request_id()
    }
}

/// A request that also reports a success/failure outcome code, which is what
///  makes it composable: a parent folds a finished child's status into its own
///  state transition. New requests implement this rather than bare [Request].
pub trait RequestWithStatus: Request {
    /// [StatusCode::Ok] means the request succeeded. Defined for unfinished
    ///  requests too (a caller asking early gets a defensive answer, typically
    ///  [StatusCode::TimeoutError]).
    fn status(&self) -> StatusCode;

    /// Whether the result may be cached by the caller.
    fn is_cacheable(&self) -> bool {
        true
    }
}

/// Drive one step of a child request from inside a parent's `process_packet`:
///  feed the received container to the child (if any), re-adopt the child's
///  pending sends into the parent while the child keeps running, and once the
///  child reports done, hand its status to the parent.
///
/// Returns `Some(status)` exactly when the child is done; `None` means "still
///  running, keep forwarding".
pub fn process_sub_request_packet<R>(
    parent: &mut RequestState,
    child: &mut R,
    pack: Option<PacketContainer>,
) -> Option<StatusCode>
where R: RequestWithStatus + ?Sized
{
    if let Some(pack) = pack {
        child.process_packet(pack);
    }
    if !child.request_done() {
        parent.adopt_packets_from(child);
    }
    if child.request_done() {
        Some(child.status())
    }
    else {
        None
    }
}
