pub mod config;
pub mod handler;
pub mod packet;
pub mod queue;
pub mod request;
pub mod test_util;
