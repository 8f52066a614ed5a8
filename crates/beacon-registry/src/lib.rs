//! Beacon Registry - Facade over the external service registry
//!
//! - `registry`: the `Registry` trait every backend implements
//! - `consul`: Consul HTTP API client
//! - `memory`: in-process registry for development and tests

pub mod consul;
pub mod memory;
pub mod registry;

pub use consul::ConsulRegistry;
pub use memory::MemoryRegistry;
pub use registry::{Registry, RegistryConnector};
