//! Wire models served by the Hangar control plane

pub mod models;
