pub mod fifo;
pub mod packet_queue;
