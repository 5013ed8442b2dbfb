use tracing::warn;

use crate::packet::container::PacketContainer;
use crate::packet::types::StatusCode;
use crate::request::request::{Request, RequestData, RequestState, RequestWithStatus};

/// The simplest possible request: send one packet, wait for its (reassembled)
///  answer, hand that answer to the caller.
pub struct SinglePacketRequest {
    state: RequestState,
    answer: Option<PacketContainer>,
    status: StatusCode,
}

impl SinglePacketRequest {
    pub fn new(data: RequestData, mut container: PacketContainer) -> SinglePacketRequest {
        let mut state = RequestState::new(data);
        state.update_ids_container(&mut container);
        state.enqueue_packet_container(container);

        SinglePacketRequest {
            state,
            answer: None,
            status: StatusCode::TimeoutError,
        }
    }
}

impl Request for SinglePacketRequest {
    fn state(&self) -> &RequestState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut RequestState {
        &mut self.state
    }

    fn process_packet(&mut self, pack: PacketContainer) {
        if self.state.is_done() {
            warn!(request_id = %self.request_id(), "reply for an already finished request - ignoring");
            return;
        }

        self.status = match pack.answer() {
            Some(answer) => answer.reply_status().unwrap_or(StatusCode::NotOk),
            None => StatusCode::TimeoutError,
        };
        self.answer = Some(pack);
        self.state.mark_done();
    }

    fn get_answer(&mut self) -> Option<PacketContainer> {
        self.answer.take()
    }
}

impl RequestWithStatus for SinglePacketRequest {
    fn status(&self) -> StatusCode {
        self.status
    }
}
