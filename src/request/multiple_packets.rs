use tracing::warn;

use crate::packet::container::PacketContainer;
use crate::packet::types::StatusCode;
use crate::request::request::{Request, RequestData, RequestState, RequestWithStatus};

/// Fire-and-collect request: any number of independent packets out, done when
///  every one of them has been answered. Answers are kept in arrival order.
///
/// The combined status is Ok only if every reply reported Ok; otherwise the
///  first non-Ok code wins.
pub struct MultiplePacketsRequest {
    state: RequestState,
    nbr_registered: u32,
    answers: Vec<PacketContainer>,
    status: StatusCode,
}

impl MultiplePacketsRequest {
    pub fn new(data: RequestData) -> MultiplePacketsRequest {
        MultiplePacketsRequest {
            state: RequestState::new(data),
            nbr_registered: 0,
            answers: Vec::new(),
            status: StatusCode::Ok,
        }
    }

    /// Register one more packet to send. Adding to a finished request is a
    ///  broken caller.
    pub fn add_packet(&mut self, mut container: PacketContainer) {
        assert!(!self.state.is_done(), "added a packet to a finished request");
        self.state.update_ids_container(&mut container);
        self.state.enqueue_packet_container(container);
        self.nbr_registered += 1;
    }

    pub fn nbr_answers(&self) -> usize {
        self.answers.len()
    }

    /// The n:th answer in arrival order.
    pub fn answer_nbr(&self, n: usize) -> Option<&PacketContainer> {
        self.answers.get(n)
    }

    pub fn take_answers(&mut self) -> Vec<PacketContainer> {
        std::mem::take(&mut self.answers)
    }
}

impl Request for MultiplePacketsRequest {
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

        let reply_status = match pack.answer() {
            Some(answer) => answer.reply_status().unwrap_or(StatusCode::NotOk),
            None => StatusCode::TimeoutError,
        };
        if self.status == StatusCode::Ok && reply_status != StatusCode::Ok {
            self.status = reply_status;
        }

        self.answers.push(pack);
        if self.answers.len() as u32 == self.nbr_registered {
            self.state.mark_done();
        }
    }
}

impl RequestWithStatus for MultiplePacketsRequest {
    fn status(&self) -> StatusCode {
        self.status
    }
}
