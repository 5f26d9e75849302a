//! In-memory caches

pub mod route;
