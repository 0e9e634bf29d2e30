//! CLI command implementations.

pub mod connect;
pub mod relay;
