//! Tenant subdomain routing

pub mod host;
pub mod router;
