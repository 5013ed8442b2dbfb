pub mod covered_ids;
pub mod multiple_packets;
pub mod request;
pub mod search;
pub mod search_handler;
pub mod single_packet;
pub mod traffic_point;
