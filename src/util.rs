pub mod fifo;
pub mod resource;
