//! Network endpoint: line-delimited JSON over TCP.

pub mod dto;
pub mod server;
