//! Beacon Client - Cached outbound connections located through the registry

pub mod cache;
pub mod dial;

pub use cache::{ConnectionCache, ConsulConnectionCache};
pub use dial::{Connection, Dialer, TcpConnection, TcpDialer};
