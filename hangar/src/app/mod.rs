//! Application wiring and lifecycle

pub mod options;
pub mod run;
pub mod state;
