//! Beacon Server - Advertises a running server to the registry
//!
//! - `registrar`: registration records, register/deregister, TTL heartbeat
//! - `health`: serving status and the HTTP health endpoint active checks call
//! - `net`: host address detection

pub mod health;
pub mod net;
pub mod registrar;

pub use health::{HealthReporter, ServingStatus};
pub use net::{advertise_host, local_ipv4};
pub use registrar::Registrar;
