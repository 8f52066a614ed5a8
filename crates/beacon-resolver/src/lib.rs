//! Beacon Resolver - Keeps a channel's address set in sync with the registry
//!
//! - `sink`: the address-push interface the channel layer implements
//! - `resolver`: per-target watch and update loops
//! - `builder`: resolver factories and the scheme → builder table

pub mod builder;
pub mod resolver;
pub mod sink;

pub use builder::{DiscoveryResolverBuilder, ResolverBuilder, ResolverRegistry};
pub use resolver::Resolver;
pub use sink::AddressSink;
