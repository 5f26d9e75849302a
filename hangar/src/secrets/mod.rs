//! Credential sealing at rest

pub mod codec;
pub mod fields;
