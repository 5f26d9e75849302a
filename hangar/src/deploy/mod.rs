//! Deployment orchestration core

pub mod artifacts;
pub mod fsm;
pub mod health;
pub mod manager;
pub mod orchestrator;
pub mod ports;
pub mod runtime;
