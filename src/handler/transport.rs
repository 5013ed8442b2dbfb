use std::net::SocketAddr;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::packet::packet::Packet;

/// The sending half of the transport boundary. The transport serializes the
///  packet (adding its length prefix), puts it on the wire, and owns the
///  resend/timeout policy for it - calling back into
///  [ThreadRequestHandler::handle_send_timeout](crate::handler::request_handler::ThreadRequestHandler::handle_send_timeout)
///  when an answer fails to appear.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send_packet(&self, to: SocketAddr, packet: &Packet) -> anyhow::Result<()>;
}

/// Receiver of asynchronous push packets, i.e. packets that arrive without a
///  request having asked for them (disturbance broadcasts and the like).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PushListener: Send + Sync + 'static {
    async fn on_push_packet(&self, packet: Packet);
}
