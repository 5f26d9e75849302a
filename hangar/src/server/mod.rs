//! Main application listener

pub mod handlers;
pub mod serve;
pub mod state;
