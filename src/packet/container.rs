use std::net::SocketAddr;
use std::time::Duration;

use bit_set::BitSet;
use bytes::BytesMut;
use tracing::warn;

use crate::config::DispatchConfig;
use crate::packet::packet::Packet;
use crate::packet::types::{ModuleType, Priority};

/// Where a container's outgoing packet is sent: either an explicit address, or
///  a logical module type plus partition-set offset that the config's address
///  table resolves at send time.
#[derive(Clone, Debug)]
pub enum Destination {
    Address(SocketAddr),
    Module { module_type: ModuleType, map_set: u32 },
}

/// Wraps one outgoing packet together with its delivery metadata, and matches
///  it to its eventual reply - including reassembly of replies that arrive as
///  multiple physical fragments, and filtering of fragments that belong to a
///  superseded transmission attempt.
///
/// The container is the sole owner of the fragment table and of the assembled
///  answer. It is created when a request decides to send a packet and dropped
///  once the owning request has consumed its answer (or lack thereof),
///  together with any never-delivered outgoing packet.
#[derive(Debug)]
pub struct PacketContainer {
    packet: Option<Packet>,
    destination: Destination,

    /// current transmission attempt of the outgoing packet; fragments of any
    ///  other generation are discarded
    resend_nbr: u8,
    max_resends: u8,
    resend_timeout: Duration,

    /// sent in place of another plain retransmission once the resend budget
    ///  is exhausted, letting a request substitute a degraded/failure packet
    timeout_packet: Option<Packet>,

    assembled_answer: Option<Packet>,
    fragment_table: Option<FragmentTable>,
}

#[derive(Debug)]
struct FragmentTable {
    fragments: Vec<Option<Packet>>,
    received: BitSet,
    nbr_received: usize,
}
impl FragmentTable {
    fn new(nbr_packets: usize) -> FragmentTable {
        FragmentTable {
            fragments: (0..nbr_packets).map(|_| None).collect(),
            received: BitSet::with_capacity(nbr_packets),
            nbr_received: 0,
        }
    }
}

pub const DEFAULT_MAX_RESENDS: u8 = 3;
pub const DEFAULT_RESEND_TIMEOUT: Duration = Duration::from_millis(2500);

impl PacketContainer {
    /// Container for a packet addressed by logical module type.
    pub fn for_module(packet: Packet, module_type: ModuleType, map_set: u32) -> PacketContainer {
        Self::new(packet, Destination::Module { module_type, map_set })
    }

    /// Container for a packet with an explicit destination address.
    pub fn for_address(packet: Packet, addr: SocketAddr) -> PacketContainer {
        Self::new(packet, Destination::Address(addr))
    }

    fn new(packet: Packet, destination: Destination) -> PacketContainer {
        PacketContainer {
            packet: Some(packet),
            destination,
            resend_nbr: 0,
            max_resends: DEFAULT_MAX_RESENDS,
            resend_timeout: DEFAULT_RESEND_TIMEOUT,
            timeout_packet: None,
            assembled_answer: None,
            fragment_table: None,
        }
    }

    /// Container wrapping an already complete answer, e.g. one synthesized
    ///  locally rather than received from a collaborator.
    pub fn new_answer(answer: Packet) -> PacketContainer {
        PacketContainer {
            destination: Destination::Address(answer.header().origin),
            packet: None,
            resend_nbr: answer.resend_nbr(),
            max_resends: DEFAULT_MAX_RESENDS,
            resend_timeout: DEFAULT_RESEND_TIMEOUT,
            timeout_packet: None,
            assembled_answer: Some(answer),
            fragment_table: None,
        }
    }

    pub fn with_resend_policy(mut self, max_resends: u8, resend_timeout: Duration) -> PacketContainer {
        self.max_resends = max_resends;
        self.resend_timeout = resend_timeout;
        self
    }

    pub fn with_timeout_packet(mut self, packet: Packet) -> PacketContainer {
        self.timeout_packet = Some(packet);
        self
    }

    pub fn packet(&self) -> Option<&Packet> {
        self.packet.as_ref()
    }

    pub fn packet_mut(&mut self) -> Option<&mut Packet> {
        self.packet.as_mut()
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn resend_nbr(&self) -> u8 {
        self.resend_nbr
    }

    pub fn resend_timeout(&self) -> Duration {
        self.resend_timeout
    }

    /// Send priority, taken from the wrapped outgoing packet.
    pub fn priority(&self) -> Priority {
        self.packet.as_ref()
            .or(self.assembled_answer.as_ref())
            .map(|p| p.priority())
            .unwrap_or(Priority::DEFAULT)
    }

    /// Resolve the destination address for the transport.
    pub fn ip_and_port(&self, config: &DispatchConfig) -> anyhow::Result<SocketAddr> {
        match &self.destination {
            Destination::Address(addr) => Ok(*addr),
            Destination::Module { module_type, map_set } =>
                config.module_address(*module_type, *map_set),
        }
    }

    /// Start the next transmission attempt: bump the resend generation on the
    ///  outgoing packet and on the expected answer, discard any partially
    ///  assembled answer, and hand back a copy to put on the wire. Returns
    ///  `None` once the resend budget is exhausted - the caller then falls
    ///  back to [PacketContainer::new_timeout_container] or reports a timeout.
    pub fn prepare_resend(&mut self) -> Option<Packet> {
        if self.resend_nbr >= self.max_resends {
            return None;
        }
        let packet = self.packet.as_mut()?;
        self.resend_nbr += 1;
        packet.set_resend_nbr(self.resend_nbr);
        let resend = packet.clone();
        self.reset_answer_data();
        Some(resend)
    }

    /// Consume one received packet as (part of) this container's answer.
    ///
    /// A packet that declares itself a complete reply *is* the answer. A
    ///  fragment of a multi-packet reply is merged into the fragment table,
    ///  and the answer becomes complete once every index of the current resend
    ///  generation has arrived exactly once. Fragments failing the acceptance
    ///  test (stale generation, out-of-range or duplicate index) are logged
    ///  and discarded; that is not an error the owning request ever sees.
    pub fn add_answer(&mut self, mut packet: Packet) {
        if packet.header().nbr_packets <= 1 {
            packet.set_resend_nbr(self.resend_nbr);
            self.fragment_table = None;
            self.assembled_answer = Some(packet);
            return;
        }
        self.add_partial_answer(packet);
    }

    fn add_partial_answer(&mut self, packet: Packet) {
        if packet.resend_nbr() != self.resend_nbr {
            warn!("fragment {:?} belongs to resend generation {}, current is {} - discarding",
                  packet, packet.resend_nbr(), self.resend_nbr);
            return;
        }

        let declared_total = packet.header().nbr_packets as usize;
        let table = self.fragment_table
            .get_or_insert_with(|| FragmentTable::new(declared_total));

        if declared_total != table.fragments.len() {
            warn!("fragment {:?} declares {} fragments, reply started with {} - discarding",
                  packet, declared_total, table.fragments.len());
            return;
        }
        let idx = packet.header().packet_nbr as usize;
        if idx >= table.fragments.len() {
            warn!("fragment {:?} has index {} outside 0..{} - discarding",
                  packet, idx, table.fragments.len());
            return;
        }
        if table.received.contains(idx) {
            warn!("fragment {:?} repeats already-filled index {} - discarding", packet, idx);
            return;
        }

        table.received.insert(idx);
        table.fragments[idx] = Some(packet);
        table.nbr_received += 1;

        if table.nbr_received == table.fragments.len() {
            self.assemble_answer();
        }
    }

    /// All fragments are present: concatenate fragment 0 (leading payload word
    ///  included) with the payloads of fragments 1..N into one logical reply.
    fn assemble_answer(&mut self) {
        let mut table = self.fragment_table.take()
            .expect("assembling without a fragment table");

        let first = table.fragments[0].take()
            .expect("fragment 0 missing from a complete table");
        let mut payload = BytesMut::from(first.payload());
        for slot in &mut table.fragments[1..] {
            let fragment = slot.take()
                .expect("fragment missing from a complete table");
            payload.extend_from_slice(fragment.payload());
        }

        let mut header = first.header().clone();
        header.packet_nbr = 0;
        header.nbr_packets = 1;
        header.resend_nbr = self.resend_nbr;
        self.assembled_answer = Some(Packet::from_parts(header, payload.freeze()));
    }

    /// True once a complete logical answer is available.
    pub fn answer_complete(&self) -> bool {
        self.assembled_answer.is_some()
    }

    pub fn answer(&self) -> Option<&Packet> {
        self.assembled_answer.as_ref()
    }

    pub fn take_answer(&mut self) -> Option<Packet> {
        self.assembled_answer.take()
    }

    /// Discard any partially or fully assembled answer and all fragment
    ///  bookkeeping, ahead of reissuing this container with a bumped resend
    ///  generation.
    pub fn reset_answer_data(&mut self) {
        self.assembled_answer = None;
        self.fragment_table = None;
    }

    /// If a distinct on-timeout packet was registered: clone it, stamp it with
    ///  the original outgoing packet's request and packet id, and wrap it in a
    ///  fresh container with the same destination and resend policy. This is
    ///  what gets sent instead of another plain retransmission once the resend
    ///  budget is exhausted.
    pub fn new_timeout_container(&self) -> Option<PacketContainer> {
        let template = self.timeout_packet.as_ref()?;
        let original = self.packet.as_ref()?;

        let mut packet = template.clone();
        packet.set_request_metadata(
            original.request_id(),
            original.packet_id(),
            original.header().originator,
            original.header().timestamp,
        );
        Some(
            PacketContainer::new(packet, self.destination.clone())
                .with_resend_policy(self.max_resends, self.resend_timeout)
        )
    }
}
