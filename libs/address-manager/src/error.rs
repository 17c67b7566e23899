use std::net::IpAddr;

use ipnet::IpNet;
use thiserror::Error;

use crate::source::SourceError;

/// Failures of operations on the address tree itself
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("address space not found: {0}")]
    SpaceNotFound(String),
    #[error("address pool not found: {0}")]
    PoolNotFound(String),
    #[error("address not found: {0}")]
    AddressNotFound(String),
    #[error("no available address pool")]
    NoAvailablePool,
    #[error("no available addresses in pool {0}")]
    PoolExhausted(IpNet),
    #[error("address pool {0} is not held")]
    PoolNotHeld(IpNet),
    #[error("address {0} is already in use")]
    AddressInUse(IpAddr),
    #[error("address {0} is not in use")]
    AddressNotInUse(IpAddr),
    #[error("address pool {0} already exists")]
    PoolExists(IpNet),
    #[error("address {0} already exists")]
    AddressExists(IpAddr),
    #[error("address {addr} is outside of subnet {subnet}")]
    AddressOutOfRange { addr: IpAddr, subnet: IpNet },
}

/// Errors returned by [`AddressManager`], generic over the storage backend's error
///
/// [`AddressManager`]: crate::AddressManager
#[derive(Error, Debug)]
pub enum IpamError<E> {
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("failed to start address source")]
    Source(#[from] SourceError),
    #[error("store error")]
    Store(#[source] E),
    #[error("failed to encode or decode persisted state")]
    Codec(#[from] serde_json::Error),
}

impl<E> IpamError<E> {
    /// true if the backing store could not be read or written. The in-memory
    /// tree is not rolled back when this happens.
    pub fn is_persistence_failure(&self) -> bool {
        matches!(self, IpamError::Store(_) | IpamError::Codec(_))
    }

    /// the tree-level error, if this is one
    pub fn address_error(&self) -> Option<&AddressError> {
        match self {
            IpamError::Address(err) => Some(err),
            _ => None,
        }
    }
}
