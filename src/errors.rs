//! Crate-level error type aggregating subsystem errors.

use thiserror::Error;

/// Error types spanning the whole relay.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Event(#[from] crate::event::EventError),

    #[error(transparent)]
    Store(#[from] crate::store::StoreError),

    #[error(transparent)]
    Acl(#[from] crate::acl::AclError),

    #[error(transparent)]
    Relay(#[from] crate::relay::RelayError),
}

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, Error>;
