use std::{
    collections::{BTreeMap, HashMap},
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{AddressError, OPT_ADDRESS_ID, Options};

/// One address's allocation state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRecord {
    addr: IpAddr,
    /// correlation id of the owner, set when claimed with [`OPT_ADDRESS_ID`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    in_use: bool,
}

impl AddressRecord {
    fn new(addr: IpAddr) -> Self {
        Self {
            addr,
            id: None,
            in_use: false,
        }
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn in_use(&self) -> bool {
        self.in_use
    }
}

/// The inventory of a single subnet: its addresses plus a count of
/// outstanding pool requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressPool {
    subnet: IpNet,
    #[serde(default)]
    if_name: String,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    usage_count: u32,
    #[serde(default)]
    addresses: BTreeMap<IpAddr, AddressRecord>,
    /// id of the owning space, restored by `link` after load
    #[serde(skip)]
    space_id: String,
    /// correlation id -> address, restored by `link` after load
    #[serde(skip)]
    addrs_by_id: HashMap<String, IpAddr>,
}

/// Read-only snapshot of a pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolInfo {
    pub address_space: String,
    pub id: String,
    pub subnet: IpNet,
    pub gateway: Option<IpAddr>,
    pub if_name: String,
    pub priority: i32,
    pub is_ipv6: bool,
    pub usage_count: u32,
    /// number of addresses not in use
    pub available: usize,
    /// total number of addresses
    pub capacity: usize,
}

impl AddressPool {
    /// creates an empty pool. Host bits in `subnet` are dropped.
    pub fn new<S: Into<String>>(subnet: IpNet, if_name: S, priority: i32) -> Self {
        Self {
            subnet: subnet.trunc(),
            if_name: if_name.into(),
            priority,
            usage_count: 0,
            addresses: BTreeMap::new(),
            space_id: String::new(),
            addrs_by_id: HashMap::new(),
        }
    }

    /// the pool id, which is its canonical subnet string
    pub fn id(&self) -> String {
        self.subnet.to_string()
    }

    pub fn subnet(&self) -> IpNet {
        self.subnet
    }

    pub fn if_name(&self) -> &str {
        &self.if_name
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn usage_count(&self) -> u32 {
        self.usage_count
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self.subnet, IpNet::V6(_))
    }

    /// id of the address space this pool belongs to
    pub fn space_id(&self) -> &str {
        &self.space_id
    }

    pub fn address(&self, addr: IpAddr) -> Option<&AddressRecord> {
        self.addresses.get(&addr)
    }

    pub fn addresses(&self) -> impl Iterator<Item = &AddressRecord> {
        self.addresses.values()
    }

    /// adds an unused address to the pool
    pub fn new_address_record(&mut self, addr: IpAddr) -> Result<&mut AddressRecord, AddressError> {
        if !self.subnet.contains(&addr) {
            return Err(AddressError::AddressOutOfRange {
                addr,
                subnet: self.subnet,
            });
        }
        if self.addresses.contains_key(&addr) {
            return Err(AddressError::AddressExists(addr));
        }
        Ok(self
            .addresses
            .entry(addr)
            .or_insert_with(|| AddressRecord::new(addr)))
    }

    pub(crate) fn acquire(&mut self) {
        self.usage_count += 1;
    }

    pub(crate) fn release(&mut self) -> Result<(), AddressError> {
        if self.usage_count == 0 {
            return Err(AddressError::PoolNotHeld(self.subnet));
        }
        self.usage_count -= 1;
        Ok(())
    }

    /// Leases an address from the pool and returns it in CIDR notation
    /// (address plus the pool's prefix length).
    ///
    /// With an empty `address` the first free record is used, unless
    /// [`OPT_ADDRESS_ID`] names an owner that already has a record here, in
    /// which case that record is returned again. A specific `address` fails
    /// with `AddressInUse` if it is leased, except to the same owner.
    pub fn request_address(&mut self, address: &str, options: &Options) -> Result<String, AddressError> {
        let id = owner_id(options);
        let addr = if !address.is_empty() {
            let addr = parse_addr(address)?;
            let record = self
                .addresses
                .get(&addr)
                .ok_or_else(|| AddressError::AddressNotFound(address.to_owned()))?;
            if record.in_use && (id.is_none() || record.id.as_deref() != id) {
                return Err(AddressError::AddressInUse(addr));
            }
            addr
        } else {
            match id.and_then(|id| self.addrs_by_id.get(id)).copied() {
                Some(addr) => {
                    debug!(?addr, ?id, "found existing address for id");
                    addr
                }
                None => self
                    .addresses
                    .values()
                    .find(|r| !r.in_use)
                    .map(|r| r.addr)
                    .ok_or(AddressError::PoolExhausted(self.subnet))?,
            }
        };
        self.claim(addr, id.map(str::to_owned));
        let leased = format!("{}/{}", addr, self.subnet.prefix_len());
        trace!(%leased, "address leased");
        Ok(leased)
    }

    /// Returns an address to the pool. With an empty `address` the record
    /// owned by [`OPT_ADDRESS_ID`] is released. The record stays in the pool.
    pub fn release_address(&mut self, address: &str, options: &Options) -> Result<(), AddressError> {
        let addr = if !address.is_empty() {
            parse_addr(address)?
        } else {
            let id = owner_id(options).unwrap_or_default();
            *self
                .addrs_by_id
                .get(id)
                .ok_or_else(|| AddressError::AddressNotFound(id.to_owned()))?
        };
        let record = self
            .addresses
            .get_mut(&addr)
            .ok_or_else(|| AddressError::AddressNotFound(address.to_owned()))?;
        if !record.in_use {
            return Err(AddressError::AddressNotInUse(addr));
        }
        record.in_use = false;
        if let Some(id) = record.id.take() {
            self.addrs_by_id.remove(&id);
        }
        trace!(?addr, "address released");
        Ok(())
    }

    // marks `addr` leased and moves ownership of `id` (if any) onto it
    fn claim(&mut self, addr: IpAddr, id: Option<String>) {
        let stale = match self.addresses.get_mut(&addr) {
            Some(record) => {
                record.in_use = true;
                if record.id == id {
                    return;
                }
                std::mem::replace(&mut record.id, id.clone())
            }
            None => return,
        };
        if let Some(stale) = stale {
            self.addrs_by_id.remove(&stale);
        }
        // an owner holds at most one address, the one it had is given back
        if let Some(id) = id
            && let Some(prev) = self.addrs_by_id.insert(id, addr)
            && prev != addr
            && let Some(record) = self.addresses.get_mut(&prev)
        {
            record.in_use = false;
            record.id = None;
            debug!(addr = ?prev, "previous address of owner released");
        }
    }

    pub fn info(&self) -> PoolInfo {
        let available = self.addresses.values().filter(|r| !r.in_use).count();
        PoolInfo {
            address_space: self.space_id.clone(),
            id: self.id(),
            subnet: self.subnet,
            gateway: gateway(&self.subnet),
            if_name: self.if_name.clone(),
            priority: self.priority,
            is_ipv6: self.is_ipv6(),
            usage_count: self.usage_count,
            available,
            capacity: self.addresses.len(),
        }
    }

    /// re-establish the back-reference & id index, which are not persisted
    pub(crate) fn link(&mut self, space_id: &str) {
        self.space_id = space_id.to_owned();
        self.addrs_by_id = self
            .addresses
            .values()
            .filter_map(|r| r.id.clone().map(|id| (id, r.addr)))
            .collect();
    }

    /// drop every lease & hold, keeping the addresses themselves
    pub(crate) fn clear_leases(&mut self) {
        self.usage_count = 0;
        for record in self.addresses.values_mut() {
            record.in_use = false;
        }
    }

    /// drop every lease, hold and owner id, as for a pool that was never used
    pub(crate) fn reset(&mut self) {
        self.clear_leases();
        self.addrs_by_id.clear();
        for record in self.addresses.values_mut() {
            record.id = None;
        }
    }

    /// Reconcile this pool's records with a fresh snapshot of the same subnet.
    /// Records in both keep their state, new ones are added unused, missing
    /// ones are removed. Returns (added, removed).
    pub(crate) fn merge(&mut self, incoming: AddressPool) -> (usize, usize) {
        self.if_name = incoming.if_name;
        self.priority = incoming.priority;

        let before = self.addresses.len();
        self.addresses
            .retain(|addr, _| incoming.addresses.contains_key(addr));
        let removed = before - self.addresses.len();

        let mut added = 0;
        for addr in incoming.addresses.into_keys() {
            if !self.addresses.contains_key(&addr) {
                self.addresses.insert(addr, AddressRecord::new(addr));
                added += 1;
            }
        }
        if removed > 0 {
            let addresses = &self.addresses;
            self.addrs_by_id
                .retain(|_, addr| addresses.contains_key(addr));
        }
        (added, removed)
    }
}

fn owner_id(options: &Options) -> Option<&str> {
    options
        .get(OPT_ADDRESS_ID)
        .map(String::as_str)
        .filter(|id| !id.is_empty())
}

fn parse_addr(address: &str) -> Result<IpAddr, AddressError> {
    address
        .parse()
        .map_err(|_| AddressError::AddressNotFound(address.to_owned()))
}

/// the first address after the network address, None for host routes
fn gateway(subnet: &IpNet) -> Option<IpAddr> {
    match subnet {
        IpNet::V4(net) if net.prefix_len() < 32 => {
            Some(Ipv4Addr::from(u32::from(net.network()) + 1).into())
        }
        IpNet::V6(net) if net.prefix_len() < 128 => {
            Some(Ipv6Addr::from(u128::from(net.network()) + 1).into())
        }
        _ => None,
    }
}
