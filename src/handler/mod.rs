pub mod request_handler;
pub mod transport;
