#![forbid(unsafe_code)]

pub mod app;
pub mod audit;
pub mod auth;
pub mod connection;
pub mod db;
pub mod directory;
pub mod gateway;
pub mod health;
pub mod pipeline;
pub mod presence;
pub mod rate_limit;
pub mod room_router;
pub mod store;

#[cfg(test)]
mod pipeline_tests;
