#![forbid(unsafe_code)]

pub mod config;
pub mod quic;
pub mod server;
