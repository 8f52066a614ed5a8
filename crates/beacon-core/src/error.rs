//! Error types for Beacon

use thiserror::Error;

/// Main error type for Beacon
#[derive(Error, Debug)]
pub enum BeaconError {
    // Registry errors
    #[error("registry unreachable: {0}")]
    RegistryUnreachable(String),

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    // Transport errors
    #[error("dial to {service} at {addr} failed: {reason}")]
    DialFailed {
        service: String,
        addr: String,
        reason: String,
    },

    // Registration errors
    #[error("registration failed: {0}")]
    RegistrationFailed(String),

    #[error("invalid registration: {0}")]
    InvalidRegistration(String),

    // Resolution errors
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("no resolver registered for scheme: {0}")]
    UnknownScheme(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BeaconError {
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::RegistryUnreachable(_) | Self::DialFailed { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ServiceNotFound(_))
    }
}

/// Result type alias for Beacon
pub type Result<T> = std::result::Result<T, BeaconError>;
