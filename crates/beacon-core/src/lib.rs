//! Beacon Core - Shared types, configuration and errors for service discovery

pub mod config;
pub mod error;
pub mod types;

pub use config::*;
pub use error::*;
pub use types::*;
