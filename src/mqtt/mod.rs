pub mod bus;
pub mod connection;
pub mod dto;
pub mod events;
