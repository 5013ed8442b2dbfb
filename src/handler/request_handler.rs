use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering as AtomicOrdering};

use rustc_hash::FxHashMap;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::DispatchConfig;
use crate::handler::transport::{PushListener, Transport};
use crate::packet::container::PacketContainer;
use crate::packet::packet::Packet;
use crate::packet::types::{PacketId, PacketType, RequestId, StatusCode};
use crate::queue::fifo::Fifo;
use crate::queue::packet_queue::PacketQueue;
use crate::request::request::{Request, RequestData, RequestWithStatus};

/// A finished request on its way back to the caller.
pub struct CompletedRequest {
    pub request: Box<dyn RequestWithStatus>,
    pub status: StatusCode,
    pub answer: Option<PacketContainer>,
}

struct FinishedEntry {
    request: Box<dyn RequestWithStatus>,
    completion: oneshot::Sender<CompletedRequest>,
}

struct RunningRequest {
    request: Box<dyn RequestWithStatus>,
    /// sent containers awaiting their answers, keyed by the packet id the
    ///  reply will carry
    outstanding: FxHashMap<PacketId, PacketContainer>,
    completion: oneshot::Sender<CompletedRequest>,
}

struct HandlerInner {
    config: Arc<DispatchConfig>,
    transport: Arc<dyn Transport>,
    incoming: Arc<PacketQueue>,
    push_queue: Arc<PacketQueue>,
    done_fifo: Fifo<FinishedEntry>,
    running: Mutex<FxHashMap<RequestId, RunningRequest>>,
    request_ids: AtomicU16,
}

/// Owns the tasks that drive requests to completion: dispatch workers that
///  drain the inbound packet queue and route each reply to its request, an
///  answer worker that pops finished requests and delivers their answers to
///  the waiting callers, and a push worker that delivers asynchronous push
///  packets to the registered listener.
///
/// At most one worker is inside any single request at a time (the running-
///  request table is the serialization point); distinct requests progress in
///  parallel across workers.
pub struct ThreadRequestHandler {
    inner: Arc<HandlerInner>,
    workers: Vec<JoinHandle<()>>,
}

impl Drop for ThreadRequestHandler {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

impl ThreadRequestHandler {
    pub fn new(config: Arc<DispatchConfig>, transport: Arc<dyn Transport>,
               push_listener: Arc<dyn PushListener>) -> ThreadRequestHandler
    {
        let inner = Arc::new(HandlerInner {
            config: config.clone(),
            transport,
            incoming: Arc::new(PacketQueue::new()),
            push_queue: Arc::new(PacketQueue::new()),
            done_fifo: Fifo::new(),
            running: Mutex::new(FxHashMap::default()),
            request_ids: AtomicU16::new(1),
        });

        let mut workers = Vec::new();
        for _ in 0..config.nbr_dispatch_workers.max(1) {
            workers.push(tokio::spawn(Self::dispatch_loop(inner.clone())));
        }
        workers.push(tokio::spawn(Self::answer_loop(inner.clone())));
        workers.push(tokio::spawn(Self::push_loop(inner.clone(), push_listener)));

        ThreadRequestHandler { inner, workers }
    }

    /// Where the transport hands in completed reply packets.
    pub fn incoming_queue(&self) -> Arc<PacketQueue> {
        self.inner.incoming.clone()
    }

    /// Where the transport hands in push packets.
    pub fn push_queue(&self) -> Arc<PacketQueue> {
        self.inner.push_queue.clone()
    }

    /// Identity for a new parentless request, with a process-assigned id.
    pub fn allocate_request_data(&self, originator: u16) -> RequestData {
        let id = RequestId(self.inner.request_ids.fetch_add(1, AtomicOrdering::Relaxed));
        RequestData::new(id, originator)
    }

    /// Hand a request over to be driven to completion. Its initial packets go
    ///  out before this returns; the returned channel resolves with the
    ///  finished request once it reports done.
    pub async fn submit(&self, request: Box<dyn RequestWithStatus>)
                        -> oneshot::Receiver<CompletedRequest>
    {
        let (completion, rx) = oneshot::channel();
        let request_id = request.request_id();

        let mut running = self.inner.running.lock().await;
        let prev = running.insert(request_id, RunningRequest {
            request,
            outstanding: FxHashMap::default(),
            completion,
        });
        assert!(prev.is_none(), "a request with id {} is already running", request_id);

        HandlerInner::flush_and_conclude(&self.inner, &mut running, request_id).await;
        rx
    }

    /// The transport's resend/timeout callback for one outgoing packet: either
    ///  retransmits (bumping the resend generation), or - once the resend
    ///  budget is exhausted - substitutes the container's registered timeout
    ///  packet, or synthesizes a timeout reply and feeds it to the owning
    ///  request.
    pub async fn handle_send_timeout(&self, request_id: RequestId, packet_id: PacketId) {
        let inner = &self.inner;
        let mut running = inner.running.lock().await;
        let Some(entry) = running.get_mut(&request_id) else {
            debug!(%request_id, "send timeout for an unknown request - ignoring");
            return;
        };
        let Some(container) = entry.outstanding.get_mut(&packet_id) else {
            debug!(%request_id, %packet_id, "send timeout for an unknown packet - ignoring");
            return;
        };

        if let Some(packet) = container.prepare_resend() {
            debug!(%request_id, %packet_id, resend_nbr = packet.resend_nbr(), "resending");
            match container.ip_and_port(&inner.config) {
                Ok(addr) => {
                    if let Err(e) = inner.transport.send_packet(addr, &packet).await {
                        error!("error resending packet: {}", e);
                    }
                }
                Err(e) => error!("cannot resolve resend destination: {}", e),
            }
            entry.request.state_mut().inc_nbr_resent_packets(1);
            return;
        }

        // resend budget exhausted
        let container = entry.outstanding.remove(&packet_id)
            .expect("outstanding container vanished");

        if let Some(substitute) = container.new_timeout_container() {
            debug!(%request_id, %packet_id, "resend budget exhausted - sending the timeout packet");
            let packet = substitute.packet().expect("timeout container without a packet").clone();
            match substitute.ip_and_port(&inner.config) {
                Ok(addr) => {
                    if let Err(e) = inner.transport.send_packet(addr, &packet).await {
                        error!("error sending timeout packet: {}", e);
                    }
                }
                Err(e) => error!("cannot resolve timeout packet destination: {}", e),
            }
            entry.request.state_mut().inc_nbr_resent_packets(1);
            entry.outstanding.insert(packet_id, substitute);
            return;
        }

        warn!(%request_id, %packet_id, "resend budget exhausted - reporting a timeout");
        let mut container = container;
        let timeout_reply = synthesize_timeout_reply(
            container.packet().expect("outstanding container without a packet"));
        container.reset_answer_data();
        container.add_answer(timeout_reply);

        entry.request.state_mut().inc_nbr_received_packets();
        entry.request.process_packet(container);
        HandlerInner::flush_and_conclude(inner, &mut running, request_id).await;
    }

    /// Stop all queues; the workers wind down as their dequeues return.
    pub fn terminate(&self) {
        self.inner.incoming.terminate();
        self.inner.push_queue.terminate();
        self.inner.done_fifo.terminate();
    }

    async fn dispatch_loop(inner: Arc<HandlerInner>) {
        while let Some(packet) = inner.incoming.dequeue().await {
            HandlerInner::on_packet(&inner, packet).await;
        }
        info!("shutting down dispatch worker");
    }

    async fn answer_loop(inner: Arc<HandlerInner>) {
        while let Some(mut finished) = inner.done_fifo.dequeue().await {
            let status = finished.request.status();
            let answer = finished.request.get_answer();
            debug!(request_id = %finished.request.request_id(), ?status, "delivering answer");
            let delivered = finished.completion.send(CompletedRequest {
                request: finished.request,
                status,
                answer,
            });
            if delivered.is_err() {
                debug!("caller went away before the answer could be delivered");
            }
        }
        info!("shutting down answer worker");
    }

    async fn push_loop(inner: Arc<HandlerInner>, listener: Arc<dyn PushListener>) {
        while let Some(packet) = inner.push_queue.dequeue().await {
            listener.on_push_packet(packet).await;
        }
        info!("shutting down push worker");
    }
}

impl HandlerInner {
    /// One reply packet from the wire: route it by request id, merge it into
    ///  the outstanding container it answers, and drive the owning request
    ///  once the answer is complete.
    async fn on_packet(inner: &HandlerInner, packet: Packet) {
        if !packet.packet_type().is_reply() {
            warn!("non-reply packet {:?} on the reply queue - dropping", packet);
            return;
        }
        let request_id = packet.request_id();
        let packet_id = packet.packet_id();

        let mut running = inner.running.lock().await;
        let Some(entry) = running.get_mut(&request_id) else {
            debug!(%request_id, "reply for an unknown request (finished already?) - dropping");
            return;
        };
        let Some(mut container) = entry.outstanding.remove(&packet_id) else {
            debug!(%request_id, %packet_id, "reply matches no outstanding packet - dropping");
            return;
        };

        let nbr_bytes = packet.payload().len() as u64;
        container.add_answer(packet);
        if !container.answer_complete() {
            // more fragments to come
            entry.outstanding.insert(packet_id, container);
            return;
        }

        let answer_resends = container.answer().map(|a| a.resend_nbr()).unwrap_or(0);
        let state = entry.request.state_mut();
        state.inc_nbr_received_packets();
        state.add_nbr_received_bytes(nbr_bytes);
        state.add_total_resend_nbr(answer_resends as u32);

        entry.request.process_packet(container);
        Self::flush_and_conclude(inner, &mut running, request_id).await;
    }

    /// Send everything the request has ready, then move it to the finished
    ///  fifo if it reports done.
    async fn flush_and_conclude(inner: &HandlerInner,
                                running: &mut FxHashMap<RequestId, RunningRequest>,
                                request_id: RequestId)
    {
        let Some(entry) = running.get_mut(&request_id) else {
            return;
        };

        while let Some(container) = entry.request.get_next_packet() {
            Self::send_container(inner, entry, container).await;
        }

        if entry.request.request_done() {
            let entry = running.remove(&request_id)
                .expect("running request vanished while concluding");
            inner.done_fifo.enqueue(FinishedEntry {
                request: entry.request,
                completion: entry.completion,
            });
        }
    }

    async fn send_container(inner: &HandlerInner, entry: &mut RunningRequest,
                            mut container: PacketContainer)
    {
        let packet = container.packet().expect("ready container without a packet").clone();
        match container.ip_and_port(&inner.config) {
            Ok(addr) => {
                if let Err(e) = inner.transport.send_packet(addr, &packet).await {
                    error!("error sending packet: {}", e);
                }
                entry.request.state_mut().inc_nbr_sent_packets();
                entry.outstanding.insert(packet.packet_id(), container);
            }
            Err(e) => {
                // an unresolvable destination behaves like a lost packet whose
                // resend budget is already spent
                warn!("cannot resolve destination for {:?}: {} - reporting a timeout", packet, e);
                let timeout_reply = synthesize_timeout_reply(&packet);
                container.reset_answer_data();
                container.add_answer(timeout_reply);
                entry.request.state_mut().inc_nbr_received_packets();
                entry.request.process_packet(container);
            }
        }
    }
}

/// A locally fabricated reply reporting that the packet it answers timed out.
fn synthesize_timeout_reply(request_packet: &Packet) -> Packet {
    let reply_type = request_packet.packet_type().reply_type()
        .unwrap_or(PacketType::Acknowledge);
    Packet::reply_to(request_packet, reply_type, StatusCode::TimeoutError, &[])
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use crate::packet::container::PacketContainer;
    use crate::packet::header::PacketHeader;
    use crate::packet::types::{MapId, ModuleType, PacketType, Priority};
    use crate::request::single_packet::SinglePacketRequest;
    use crate::test_util::{test_addr_from_number, test_fragments_of};
    use super::*;

    /// Test double in place of a real socket: records every send and lets the
    ///  test wait until a given number of packets have gone out.
    struct RecordingTransport {
        sent: StdMutex<Vec<(SocketAddr, Packet)>>,
        notify: Notify,
    }
    impl RecordingTransport {
        fn new() -> Arc<RecordingTransport> {
            Arc::new(RecordingTransport {
                sent: StdMutex::new(Vec::new()),
                notify: Notify::new(),
            })
        }

        fn nbr_sent(&self) -> usize {
            self.sent.lock().unwrap().len()
        }

        fn sent_packet(&self, n: usize) -> (SocketAddr, Packet) {
            self.sent.lock().unwrap()[n].clone()
        }

        async fn wait_for_sends(&self, nbr: usize) {
            loop {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.nbr_sent() >= nbr {
                    return;
                }
                notified.await;
            }
        }
    }
    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send_packet(&self, to: SocketAddr, packet: &Packet) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push((to, packet.clone()));
            self.notify.notify_waiters();
            Ok(())
        }
    }

    struct RecordingPushListener {
        received: StdMutex<Vec<Packet>>,
        notify: Notify,
    }
    impl RecordingPushListener {
        fn new() -> Arc<RecordingPushListener> {
            Arc::new(RecordingPushListener {
                received: StdMutex::new(Vec::new()),
                notify: Notify::new(),
            })
        }

        async fn wait_for_push(&self) -> Packet {
            loop {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if let Some(packet) = self.received.lock().unwrap().first().cloned() {
                    return packet;
                }
                notified.await;
            }
        }
    }
    #[async_trait]
    impl PushListener for RecordingPushListener {
        async fn on_push_packet(&self, packet: Packet) {
            self.received.lock().unwrap().push(packet);
            self.notify.notify_waiters();
        }
    }

    fn map_module_addr() -> SocketAddr {
        test_addr_from_number(7655)
    }

    fn test_config() -> Arc<DispatchConfig> {
        let mut config = DispatchConfig::new();
        config.set_module_address(ModuleType::Map, 0, map_module_addr());
        Arc::new(config)
    }

    fn new_handler() -> (ThreadRequestHandler, Arc<RecordingTransport>, Arc<RecordingPushListener>) {
        let transport = RecordingTransport::new();
        let listener = RecordingPushListener::new();
        let handler = ThreadRequestHandler::new(test_config(), transport.clone(), listener.clone());
        (handler, transport, listener)
    }

    fn lookup_request(handler: &ThreadRequestHandler) -> Box<SinglePacketRequest> {
        let packet = Packet::request(PacketType::CoordinateOnItemRequest, Priority::DEFAULT,
                                     MapId(1), &[0, 0, 0, 9, 0, 0]);
        Box::new(SinglePacketRequest::new(
            handler.allocate_request_data(0),
            PacketContainer::for_module(packet, ModuleType::Map, 0),
        ))
    }

    #[tokio::test]
    async fn test_submit_reply_answer_round_trip() {
        let (handler, transport, _) = new_handler();

        let rx = handler.submit(lookup_request(&handler)).await;
        transport.wait_for_sends(1).await;

        let (addr, sent) = transport.sent_packet(0);
        assert_eq!(addr, map_module_addr());
        assert_eq!(sent.packet_type(), PacketType::CoordinateOnItemRequest);

        let reply = Packet::reply_to(&sent, PacketType::CoordinateOnItemReply,
                                     StatusCode::Ok, b"answer");
        handler.incoming_queue().enqueue(reply);

        let completed = tokio::time::timeout(Duration::from_secs(5), rx)
            .await.unwrap().unwrap();
        assert_eq!(completed.status, StatusCode::Ok);
        assert_eq!(completed.answer.unwrap().answer().unwrap().body(), b"answer");
    }

    #[tokio::test]
    async fn test_fragmented_reply_is_reassembled_before_dispatch() {
        let (handler, transport, _) = new_handler();

        let rx = handler.submit(lookup_request(&handler)).await;
        transport.wait_for_sends(1).await;
        let (_, sent) = transport.sent_packet(0);

        let whole = Packet::reply_to(&sent, PacketType::CoordinateOnItemReply,
                                     StatusCode::Ok, b"first-half+second-half");
        let mut fragments = test_fragments_of(&whole, 2);

        // out of order on purpose
        handler.incoming_queue().enqueue(fragments.pop().unwrap());
        handler.incoming_queue().enqueue(fragments.pop().unwrap());

        let completed = tokio::time::timeout(Duration::from_secs(5), rx)
            .await.unwrap().unwrap();
        assert_eq!(completed.status, StatusCode::Ok);
        assert_eq!(completed.answer.unwrap().answer().unwrap().body(),
                   b"first-half+second-half");
    }

    #[tokio::test]
    async fn test_resend_then_timeout_answer() {
        let (handler, transport, _) = new_handler();

        let packet = Packet::request(PacketType::CoordinateOnItemRequest, Priority::DEFAULT,
                                     MapId(1), &[]);
        let container = PacketContainer::for_module(packet, ModuleType::Map, 0)
            .with_resend_policy(1, Duration::from_millis(50));
        let request = Box::new(SinglePacketRequest::new(
            handler.allocate_request_data(0), container));
        let request_id = request.request_id();

        let rx = handler.submit(request).await;
        transport.wait_for_sends(1).await;
        let (_, sent) = transport.sent_packet(0);
        assert_eq!(sent.resend_nbr(), 0);

        // first timeout: one retransmission with a bumped generation
        handler.handle_send_timeout(request_id, sent.packet_id()).await;
        transport.wait_for_sends(2).await;
        let (_, resent) = transport.sent_packet(1);
        assert_eq!(resent.packet_id(), sent.packet_id());
        assert_eq!(resent.resend_nbr(), 1);

        // second timeout: budget exhausted, the caller gets a timeout answer
        handler.handle_send_timeout(request_id, sent.packet_id()).await;
        let completed = tokio::time::timeout(Duration::from_secs(5), rx)
            .await.unwrap().unwrap();
        assert_eq!(completed.status, StatusCode::TimeoutError);
    }

    #[tokio::test]
    async fn test_exhausted_budget_sends_the_registered_timeout_packet() {
        let (handler, transport, _) = new_handler();

        let packet = Packet::request(PacketType::CoordinateOnItemRequest, Priority::DEFAULT,
                                     MapId(1), &[]);
        let degraded = Packet::request(PacketType::CoveredIdsRequest, Priority::HIGHEST,
                                       MapId::TOP, &[]);
        let container = PacketContainer::for_module(packet, ModuleType::Map, 0)
            .with_resend_policy(0, Duration::from_millis(50))
            .with_timeout_packet(degraded);
        let request = Box::new(SinglePacketRequest::new(
            handler.allocate_request_data(0), container));
        let request_id = request.request_id();

        let rx = handler.submit(request).await;
        transport.wait_for_sends(1).await;
        let (_, sent) = transport.sent_packet(0);

        handler.handle_send_timeout(request_id, sent.packet_id()).await;
        transport.wait_for_sends(2).await;
        let (_, substitute) = transport.sent_packet(1);
        assert_eq!(substitute.packet_type(), PacketType::CoveredIdsRequest);
        assert_eq!(substitute.packet_id(), sent.packet_id());

        // the reply to the substitute still completes the request
        let reply = Packet::reply_to(&substitute, PacketType::CoveredIdsReply,
                                     StatusCode::Ok, &[]);
        handler.incoming_queue().enqueue(reply);
        let completed = tokio::time::timeout(Duration::from_secs(5), rx)
            .await.unwrap().unwrap();
        assert_eq!(completed.status, StatusCode::Ok);
    }

    #[tokio::test]
    async fn test_unresolvable_destination_times_out_locally() {
        let (handler, transport, _) = new_handler();

        // the search module has no configured address
        let packet = Packet::request(PacketType::SearchRequest, Priority::DEFAULT,
                                     MapId(1), &[]);
        let request = Box::new(SinglePacketRequest::new(
            handler.allocate_request_data(0),
            PacketContainer::for_module(packet, ModuleType::Search, 0),
        ));

        let rx = handler.submit(request).await;
        let completed = tokio::time::timeout(Duration::from_secs(5), rx)
            .await.unwrap().unwrap();
        assert_eq!(completed.status, StatusCode::TimeoutError);
        assert_eq!(transport.nbr_sent(), 0);
    }

    #[tokio::test]
    async fn test_push_packets_reach_the_listener() {
        let (handler, _, listener) = new_handler();

        let mut header = PacketHeader::new(PacketType::DisturbancePush, Priority::HIGHEST);
        header.request_id = RequestId(0);
        let push = Packet::from_parts(header, bytes::Bytes::from_static(b"\0\0\0\0jam on E22"));
        handler.push_queue().enqueue(push.clone());

        let received = tokio::time::timeout(Duration::from_secs(5), listener.wait_for_push())
            .await.unwrap();
        assert_eq!(received, push);
    }

    #[tokio::test]
    async fn test_stale_reply_for_a_finished_request_is_dropped() {
        let (handler, transport, _) = new_handler();

        let rx = handler.submit(lookup_request(&handler)).await;
        transport.wait_for_sends(1).await;
        let (_, sent) = transport.sent_packet(0);

        let reply = Packet::reply_to(&sent, PacketType::CoordinateOnItemReply,
                                     StatusCode::Ok, &[]);
        handler.incoming_queue().enqueue(reply.clone());
        tokio::time::timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();

        // a retransmitted reply arriving after completion must be ignored
        handler.incoming_queue().enqueue(reply);
        tokio::time::timeout(Duration::from_secs(5), async {
            while handler.incoming_queue().statistics().nbr_queued > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }).await.unwrap();
    }

    #[tokio::test]
    async fn test_terminate_stops_the_workers() {
        let (handler, _, _) = new_handler();
        handler.terminate();
        // termination is absorbing; a submit after termination never hangs the
        // queues (the request just cannot complete any more)
        tokio::task::yield_now().await;
    }
}
