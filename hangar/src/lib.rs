//! Hangar Library
//!
//! Control plane for per-tenant agent containers: deployment lifecycle,
//! host port allocation, health checking, reconciliation and subdomain
//! routing.

pub mod app;
pub mod cache;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod proxy;
pub mod secrets;
pub mod server;
pub mod storage;
pub mod store;
pub mod utils;
pub mod workers;
