//! # address-manager
//!
//! `address-manager` owns the inventory of subnets and addresses available
//! to this host and hands them out to containers.
//!
//! The tree is `AddressManager -> AddressSpace -> AddressPool -> AddressRecord`.
//! A topology [`source`] reports which subnets and addresses the host's NICs
//! currently carry; every refresh is reconciled into the existing tree
//! without losing leases that are still valid. After every mutation the whole
//! tree is written to a [`Storage`] backend, and when the host has rebooted
//! since that write all leases are dropped on load.
//!
//! [`Storage`]: crate::store::Storage
//! [`source`]: crate::source
use std::collections::HashMap;

mod error;
mod manager;
mod pool;
mod space;

pub mod source;
pub mod store;

pub use crate::{
    error::{AddressError, IpamError},
    manager::{AddressManager, AddressSpaces},
    pool::{AddressPool, AddressRecord, PoolInfo},
    space::{AddressSpace, MergeSummary, Scope},
};

/// id of the default local address space
pub const LOCAL_DEFAULT_ADDRESS_SPACE_ID: &str = "local";
/// id of the default global address space
pub const GLOBAL_DEFAULT_ADDRESS_SPACE_ID: &str = "global";

/// request option naming the owner of an address. A record claimed with an id
/// can be found again by that id, see [`AddressPool::request_address`]
pub const OPT_ADDRESS_ID: &str = "ipam.address.id";

/// request option naming the interface a wildcard pool request prefers, see
/// [`AddressSpace::request_pool`]
pub const OPT_INTERFACE_NAME: &str = "ipam.interface.name";

/// free-form options passed along with pool & address requests
pub type Options = HashMap<String, String>;
