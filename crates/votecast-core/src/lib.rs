// Library root: re-exports all modules so integration tests and the binary
// can access the crate's public API.

pub mod auth;
pub mod config;
pub mod error;
pub mod hub;
pub mod model;
pub mod orchestrator;
pub mod protocol;
pub mod service;
pub mod store;
pub mod workflow;
pub mod ws_server;
