use std::collections::BTreeMap;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{AddressError, AddressPool, OPT_INTERFACE_NAME, Options};

/// Whether an address space is only meaningful on this host or shared
/// across hosts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Local,
    Global,
}

/// A named set of pools
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressSpace {
    id: String,
    scope: Scope,
    #[serde(default)]
    pools: BTreeMap<IpNet, AddressPool>,
}

/// What changed when a topology snapshot was merged into a space
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub pools_added: usize,
    pub pools_removed: usize,
    pub pools_updated: usize,
    pub addresses_added: usize,
    pub addresses_removed: usize,
}

impl MergeSummary {
    pub fn changed(&self) -> bool {
        *self != Self::default()
    }
}

impl AddressSpace {
    pub fn new<S: Into<String>>(id: S, scope: Scope) -> Self {
        Self {
            id: id.into(),
            scope,
            pools: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn pools(&self) -> impl Iterator<Item = &AddressPool> {
        self.pools.values()
    }

    /// adds an empty pool, failing if the subnet is already present
    pub fn new_address_pool<S: Into<String>>(
        &mut self,
        subnet: IpNet,
        if_name: S,
        priority: i32,
    ) -> Result<&mut AddressPool, AddressError> {
        let subnet = subnet.trunc();
        if self.pools.contains_key(&subnet) {
            return Err(AddressError::PoolExists(subnet));
        }
        let mut pool = AddressPool::new(subnet, if_name, priority);
        pool.link(&self.id);
        Ok(self.pools.entry(subnet).or_insert(pool))
    }

    /// the pool for `subnet`, created if missing. Used when several NICs
    /// report the same prefix.
    pub(crate) fn pool_entry(&mut self, subnet: IpNet, if_name: &str, priority: i32) -> &mut AddressPool {
        let subnet = subnet.trunc();
        let id = &self.id;
        self.pools.entry(subnet).or_insert_with(|| {
            let mut pool = AddressPool::new(subnet, if_name, priority);
            pool.link(id);
            pool
        })
    }

    pub fn get_address_pool(&self, pool_id: &str) -> Result<&AddressPool, AddressError> {
        pool_key(pool_id)
            .and_then(|key| self.pools.get(&key))
            .ok_or_else(|| AddressError::PoolNotFound(pool_id.to_owned()))
    }

    pub fn get_address_pool_mut(&mut self, pool_id: &str) -> Result<&mut AddressPool, AddressError> {
        pool_key(pool_id)
            .and_then(|key| self.pools.get_mut(&key))
            .ok_or_else(|| AddressError::PoolNotFound(pool_id.to_owned()))
    }

    /// Takes a hold on a pool and returns it.
    ///
    /// An empty `pool_id` picks an unheld pool of the requested family. Pools
    /// on the interface named by [`OPT_INTERFACE_NAME`] come first, then the
    /// highest priority, then subnet order. Otherwise the named pool is held,
    /// whatever its current usage.
    pub fn request_pool(
        &mut self,
        pool_id: &str,
        options: &Options,
        v6: bool,
    ) -> Result<&mut AddressPool, AddressError> {
        let pool = if pool_id.is_empty() {
            let if_name = options
                .get(OPT_INTERFACE_NAME)
                .map(String::as_str)
                .filter(|name| !name.is_empty());
            let key = self
                .pools
                .values()
                .filter(|p| p.usage_count() == 0 && p.is_ipv6() == v6)
                // max_by_key keeps the last maximum, so walk in reverse
                .rev()
                .max_by_key(|p| (if_name == Some(p.if_name()), p.priority()))
                .map(|p| p.subnet())
                .ok_or(AddressError::NoAvailablePool)?;
            self.pools
                .get_mut(&key)
                .ok_or(AddressError::NoAvailablePool)?
        } else {
            self.get_address_pool_mut(pool_id)?
        };
        pool.acquire();
        debug!(pool = %pool.subnet(), usage = pool.usage_count(), "pool held");
        Ok(pool)
    }

    pub fn release_pool(&mut self, pool_id: &str) -> Result<(), AddressError> {
        let pool = self.get_address_pool_mut(pool_id)?;
        pool.release()?;
        debug!(pool = %pool.subnet(), usage = pool.usage_count(), "pool released");
        Ok(())
    }

    /// Reconcile this space with a freshly reported one. Pools and addresses
    /// present in both keep their usage and leases, new ones arrive unused,
    /// and ones no longer reported are removed even if they are in use.
    pub fn merge(&mut self, incoming: AddressSpace) -> MergeSummary {
        let mut summary = MergeSummary::default();
        let mut incoming = incoming.pools;

        let before = self.pools.len();
        self.pools.retain(|subnet, _| incoming.contains_key(subnet));
        summary.pools_removed = before - self.pools.len();

        for (subnet, pool) in self.pools.iter_mut() {
            if let Some(new) = incoming.remove(subnet) {
                let hints_changed = new.if_name() != pool.if_name() || new.priority() != pool.priority();
                let (added, removed) = pool.merge(new);
                if hints_changed || added > 0 || removed > 0 {
                    summary.pools_updated += 1;
                }
                summary.addresses_added += added;
                summary.addresses_removed += removed;
            }
        }
        for (subnet, mut pool) in incoming {
            pool.reset();
            summary.addresses_added += pool.addresses().count();
            summary.pools_added += 1;
            self.pools.insert(subnet, pool);
        }
        self.link();

        if summary.changed() {
            info!(space = %self.id, ?summary, "address space updated");
        }
        summary
    }

    pub(crate) fn link(&mut self) {
        for pool in self.pools.values_mut() {
            pool.link(&self.id);
        }
    }

    pub(crate) fn clear_leases(&mut self) {
        for pool in self.pools.values_mut() {
            pool.clear_leases();
        }
    }

    pub(crate) fn reset(&mut self) {
        for pool in self.pools.values_mut() {
            pool.reset();
        }
    }
}

// pool ids are canonical CIDR strings, anything else can't match
fn pool_key(pool_id: &str) -> Option<IpNet> {
    pool_id.parse::<IpNet>().ok().filter(|net| net.to_string() == pool_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OPT_ADDRESS_ID;

    fn space(pools: &[(&str, i32, &[&str])]) -> AddressSpace {
        let mut space = AddressSpace::new("local", Scope::Local);
        for (subnet, priority, addrs) in pools {
            let pool = space
                .new_address_pool(subnet.parse().unwrap(), "eth0", *priority)
                .unwrap();
            for addr in *addrs {
                pool.new_address_record(addr.parse().unwrap()).unwrap();
            }
        }
        space
    }

    #[test]
    fn test_new_address_pool_exists() {
        let mut space = space(&[("10.0.1.0/24", 0, &[])]);
        assert_eq!(
            space
                .new_address_pool("10.0.1.0/24".parse().unwrap(), "eth1", 0)
                .unwrap_err(),
            AddressError::PoolExists("10.0.1.0/24".parse().unwrap())
        );
        assert_eq!(space.get_address_pool("10.0.1.0/24").unwrap().space_id(), "local");
    }

    #[test]
    fn test_get_pool_exact_match() {
        let space = space(&[("10.0.1.0/24", 0, &[])]);
        assert!(space.get_address_pool("10.0.1.0/24").is_ok());
        for bad in ["10.0.1.1/24", "10.0.1.0", "10.0.2.0/24", "junk", ""] {
            assert_eq!(
                space.get_address_pool(bad).unwrap_err(),
                AddressError::PoolNotFound(bad.into())
            );
        }
    }

    #[test]
    fn test_request_pool_wildcard() {
        let mut space = space(&[
            ("10.0.1.0/24", 0, &[]),
            ("10.0.2.0/24", 1, &[]),
            ("10.0.3.0/24", 1, &[]),
            ("fd00::/64", 5, &[]),
        ]);
        // highest priority first, then subnet order
        assert_eq!(space.request_pool("", &Options::new(), false).unwrap().id(), "10.0.2.0/24");
        assert_eq!(space.request_pool("", &Options::new(), false).unwrap().id(), "10.0.3.0/24");
        assert_eq!(space.request_pool("", &Options::new(), false).unwrap().id(), "10.0.1.0/24");
        assert_eq!(space.request_pool("", &Options::new(), false).unwrap_err(), AddressError::NoAvailablePool);
        assert_eq!(space.request_pool("", &Options::new(), true).unwrap().id(), "fd00::/64");
        assert_eq!(space.request_pool("", &Options::new(), true).unwrap_err(), AddressError::NoAvailablePool);
    }

    #[test]
    fn test_request_pool_prefers_interface() {
        let mut space = space(&[("10.0.1.0/24", 0, &[]), ("10.0.3.0/24", 5, &[])]);
        space
            .new_address_pool("10.0.2.0/24".parse().unwrap(), "eth1", 0)
            .unwrap();
        let eth1 = Options::from([(OPT_INTERFACE_NAME.to_owned(), "eth1".to_owned())]);
        // the interface wins over priority
        assert_eq!(space.request_pool("", &eth1, false).unwrap().id(), "10.0.2.0/24");
        // nothing left on eth1, fall back to priority
        assert_eq!(space.request_pool("", &eth1, false).unwrap().id(), "10.0.3.0/24");
        let eth9 = Options::from([(OPT_INTERFACE_NAME.to_owned(), "eth9".to_owned())]);
        assert_eq!(space.request_pool("", &eth9, false).unwrap().id(), "10.0.1.0/24");
        assert_eq!(space.request_pool("", &eth1, false).unwrap_err(), AddressError::NoAvailablePool);
    }

    #[test]
    fn test_merge_new_pool_drops_owners() {
        let mut current = space(&[]);
        let mut incoming = space(&[("10.0.1.0/24", 0, &["10.0.1.1", "10.0.1.2"])]);
        let owner = Options::from([(OPT_ADDRESS_ID.to_owned(), "c1".to_owned())]);
        incoming
            .get_address_pool_mut("10.0.1.0/24")
            .unwrap()
            .request_address("10.0.1.2", &owner)
            .unwrap();

        current.merge(incoming);
        let pool = current.get_address_pool_mut("10.0.1.0/24").unwrap();
        assert!(pool.addresses().all(|r| !r.in_use() && r.id().is_none()));
        // "c1" owns nothing here, so it gets the first free address
        assert_eq!(pool.request_address("", &owner).unwrap(), "10.0.1.1/24");
    }

    #[test]
    fn test_request_pool_explicit_refcount() {
        let mut space = space(&[("10.0.1.0/24", 0, &[])]);
        for _ in 0..3 {
            space.request_pool("10.0.1.0/24", &Options::new(), false).unwrap();
        }
        assert_eq!(space.get_address_pool("10.0.1.0/24").unwrap().usage_count(), 3);
        for _ in 0..3 {
            space.release_pool("10.0.1.0/24").unwrap();
        }
        assert_eq!(
            space.release_pool("10.0.1.0/24").unwrap_err(),
            AddressError::PoolNotHeld("10.0.1.0/24".parse().unwrap())
        );
    }

    #[test]
    fn test_merge() {
        let mut current = space(&[
            ("10.0.1.0/24", 0, &["10.0.1.1", "10.0.1.2"]),
            ("10.0.2.0/24", 0, &["10.0.2.1"]),
            ("10.0.9.0/24", 0, &["10.0.9.1"]),
        ]);
        current.request_pool("10.0.1.0/24", &Options::new(), false).unwrap();
        current
            .get_address_pool_mut("10.0.1.0/24")
            .unwrap()
            .request_address("10.0.1.1", &Options::new())
            .unwrap();
        current
            .get_address_pool_mut("10.0.9.0/24")
            .unwrap()
            .request_address("10.0.9.1", &Options::new())
            .unwrap();

        let mut incoming = space(&[
            ("10.0.1.0/24", 0, &["10.0.1.1", "10.0.1.3"]),
            ("10.0.2.0/24", 0, &["10.0.2.1"]),
            ("10.0.3.0/24", 2, &["10.0.3.1"]),
        ]);
        // a snapshot never carries leases, but make sure they're ignored anyway
        incoming.request_pool("10.0.3.0/24", &Options::new(), false).unwrap();

        let summary = current.merge(incoming);
        assert_eq!(
            summary,
            MergeSummary {
                pools_added: 1,
                pools_removed: 1,
                pools_updated: 1,
                addresses_added: 2,
                addresses_removed: 1,
            }
        );
        assert!(summary.changed());

        let pool = current.get_address_pool("10.0.1.0/24").unwrap();
        assert_eq!(pool.usage_count(), 1);
        assert!(pool.address("10.0.1.1".parse().unwrap()).unwrap().in_use());
        assert!(pool.address("10.0.1.2".parse().unwrap()).is_none());
        assert!(!pool.address("10.0.1.3".parse().unwrap()).unwrap().in_use());

        let added = current.get_address_pool("10.0.3.0/24").unwrap();
        assert_eq!(added.usage_count(), 0);
        assert_eq!(added.priority(), 2);
        assert_eq!(added.space_id(), "local");
        // removed while leased
        assert!(current.get_address_pool("10.0.9.0/24").is_err());

        let same = current.clone();
        assert!(!current.merge(same).changed());
    }
}
