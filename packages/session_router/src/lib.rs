//! Session router: binds each client connection to one session that relays
//! traffic between the client, a backend execution channel and an optional
//! collaborative workspace.

pub mod backend;
pub mod config;
pub mod db;
pub mod metrics;
pub mod models;
pub mod repository;
pub mod session;
pub mod store;
pub mod tokens;
pub mod workspace;
pub mod ws;
