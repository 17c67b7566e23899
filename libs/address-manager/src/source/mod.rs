//! Topology sources report which subnets and addresses are present on the
//! host's interfaces.
//!
//! The manager polls its source before every operation through
//! [`AddressSource::refresh`]; a source decides on its own whether to
//! actually query anything (see [`Throttle`]). New topology is handed over
//! through an [`AddressSink`], which merges it into the existing tree.
use std::{
    fmt,
    path::PathBuf,
    str::FromStr,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use config::{
    ENVIRONMENT_CLOUD, ENVIRONMENT_FILE, ENVIRONMENT_NONE, ENVIRONMENT_NULL, SourceOptions,
    wire::NetworkInterfaces,
};
use ipnet::IpNet;
use platform::{LocalInterface, Platform};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{AddressError, AddressSpace, LOCAL_DEFAULT_ADDRESS_SPACE_ID, Scope};

mod cloud;
mod file;
mod null;

pub use cloud::{CloudSource, DEFAULT_QUERY_INTERVAL, DEFAULT_QUERY_URL};
pub use file::{DEFAULT_FILE_PATH, FileSource};
pub use null::NullSource;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("topology query failed")]
    Http(#[from] reqwest::Error),
    #[error("invalid topology document")]
    Xml(#[from] quick_xml::DeError),
    #[error("invalid topology document")]
    Json(#[from] serde_json::Error),
    #[error("failed to read topology from {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Address(#[from] AddressError),
}

/// Receives address spaces discovered by a source
pub trait AddressSink: Send {
    /// an empty space, ready to be filled and handed back to
    /// [`set_address_space`](AddressSink::set_address_space)
    fn new_address_space(&self, id: &str, scope: Scope) -> AddressSpace {
        AddressSpace::new(id, scope)
    }

    /// replace (reconcile) the space with the same id, or add it
    fn set_address_space(&mut self, space: AddressSpace);
}

#[async_trait]
pub trait AddressSource: Send + Sync {
    /// called once when the source is attached to a manager
    async fn start(&mut self, sink: &mut dyn AddressSink) -> Result<(), SourceError>;
    /// called when the manager shuts down
    async fn stop(&mut self);
    /// give the source a chance to publish new topology
    async fn refresh(&mut self, sink: &mut dyn AddressSink) -> Result<(), SourceError>;
}

/// Which source to attach, named by the `environment` option
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    /// no source, the tree is only changed by explicit calls
    None,
    Null,
    Cloud,
    File,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown environment: {0:?}")]
pub struct UnknownEnvironment(pub String);

impl FromStr for Environment {
    type Err = UnknownEnvironment;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            ENVIRONMENT_NONE => Environment::None,
            ENVIRONMENT_NULL => Environment::Null,
            ENVIRONMENT_CLOUD => Environment::Cloud,
            ENVIRONMENT_FILE => Environment::File,
            other => return Err(UnknownEnvironment(other.to_owned())),
        })
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Environment::None => ENVIRONMENT_NONE,
            Environment::Null => ENVIRONMENT_NULL,
            Environment::Cloud => ENVIRONMENT_CLOUD,
            Environment::File => ENVIRONMENT_FILE,
        })
    }
}

/// The source attached to a manager
#[derive(Debug)]
pub enum Source {
    Cloud(CloudSource),
    File(FileSource),
    Null(NullSource),
}

impl Source {
    /// builds the source for `env`, `Ok(None)` when no source is wanted
    pub fn new(
        env: Environment,
        opts: &SourceOptions,
        platform: Arc<dyn Platform>,
    ) -> Result<Option<Self>, SourceError> {
        let source = match env {
            Environment::None => return Ok(None),
            Environment::Null => Source::Null(NullSource::new()),
            Environment::Cloud => Source::Cloud(CloudSource::new(opts, platform)?),
            Environment::File => Source::File(FileSource::new(opts, platform)),
        };
        Ok(Some(source))
    }

    fn inner(&mut self) -> &mut dyn AddressSource {
        match self {
            Source::Cloud(s) => s,
            Source::File(s) => s,
            Source::Null(s) => s,
        }
    }

    pub async fn start(&mut self, sink: &mut dyn AddressSink) -> Result<(), SourceError> {
        self.inner().start(sink).await
    }

    pub async fn stop(&mut self) {
        self.inner().stop().await
    }

    pub async fn refresh(&mut self, sink: &mut dyn AddressSink) -> Result<(), SourceError> {
        self.inner().refresh(sink).await
    }
}

/// Rate limits topology queries to one per interval
#[derive(Debug, Clone)]
pub struct Throttle {
    interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: None }
    }

    /// true if a query is due now, in which case the next one is pushed
    /// out by the interval
    pub fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

/// Turns a topology document into the local address space.
///
/// Reported interfaces are matched to local NICs by hardware address; a `*`
/// address matches the first NIC that has one. Unmatched interfaces are
/// skipped. Pools on non-primary interfaces get priority 1, and the primary
/// address of each subnet is left out since it belongs to the host.
pub fn populate_address_space(
    sink: &dyn AddressSink,
    doc: &NetworkInterfaces,
    interfaces: &[LocalInterface],
) -> AddressSpace {
    let mut local = sink.new_address_space(LOCAL_DEFAULT_ADDRESS_SPACE_ID, Scope::Local);

    for reported in &doc.interfaces {
        let mac = reported.mac_address.to_uppercase().replace([':', '-'], "");
        let Some(if_name) = find_interface(&mac, interfaces) else {
            debug!(mac = %reported.mac_address, "no local interface found, skipping");
            continue;
        };
        let priority = if reported.is_primary { 0 } else { 1 };

        for subnet in &reported.ip_subnets {
            let prefix = match subnet.prefix.parse::<IpNet>() {
                Ok(prefix) => prefix,
                Err(err) => {
                    warn!(prefix = %subnet.prefix, ?err, "invalid subnet prefix, skipping");
                    continue;
                }
            };
            let pool = local.pool_entry(prefix, if_name, priority);

            for addr in subnet.ip_addresses.iter().filter(|a| !a.is_primary) {
                let ip = match addr.address.parse() {
                    Ok(ip) => ip,
                    Err(err) => {
                        warn!(address = %addr.address, ?err, "invalid address, skipping");
                        continue;
                    }
                };
                if let Err(err) = pool.new_address_record(ip) {
                    debug!(?err, "skipping address");
                }
            }
        }
    }
    local
}

fn find_interface<'a>(mac: &str, interfaces: &'a [LocalInterface]) -> Option<&'a str> {
    interfaces
        .iter()
        .find(|i| {
            if mac == "*" {
                i.has_hardware_addr()
            } else {
                i.mac.as_deref() == Some(mac)
            }
        })
        .map(|i| i.name.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Collect(Vec<AddressSpace>);

    impl AddressSink for Collect {
        fn set_address_space(&mut self, space: AddressSpace) {
            self.0.push(space);
        }
    }

    fn interfaces() -> Vec<LocalInterface> {
        vec![
            LocalInterface::new("lo", Some([0; 6])),
            LocalInterface::new("eth1", Some([0x11, 0x11, 0x11, 0x11, 0x11, 0x11])),
            LocalInterface::new("eth2", Some([0x00, 0x0d, 0x3a, 0x6e, 0x18, 0x25])),
            LocalInterface::new("eth3", Some([0x22, 0x22, 0x22, 0x22, 0x22, 0x22])),
        ]
    }

    static SINGLE: &str = r#"{"Interfaces": [{
        "MacAddress": "000D3A6E1825",
        "IsPrimary": true,
        "IPSubnets": [{
            "Prefix": "1.0.0.0/12",
            "IPAddresses": [
                {"Address": "1.0.0.4", "IsPrimary": true},
                {"Address": "1.0.0.5", "IsPrimary": false},
                {"Address": "1.0.0.6", "IsPrimary": false}
            ]
        }]
    }]}"#;

    static MULTIPLE: &str = r#"{"Interfaces": [
        {
            "MacAddress": "111111111111",
            "IsPrimary": true,
            "IPSubnets": [
                {"Prefix": "1.0.0.0/16", "IPAddresses": [
                    {"Address": "1.0.0.4", "IsPrimary": true},
                    {"Address": "1.0.0.5", "IsPrimary": false}
                ]},
                {"Prefix": "1.1.0.0/16", "IPAddresses": [
                    {"Address": "1.1.0.4", "IsPrimary": false}
                ]}
            ]
        },
        {
            "MacAddress": "222222222222",
            "IsPrimary": false,
            "IPSubnets": [
                {"Prefix": "2.0.0.0/16", "IPAddresses": [
                    {"Address": "2.0.0.4", "IsPrimary": false},
                    {"Address": "2.0.0.4", "IsPrimary": false}
                ]},
                {"Prefix": "2.1.0.0/16", "IPAddresses": []}
            ]
        },
        {"MacAddress": "333333333333", "IsPrimary": false, "IPSubnets": [
            {"Prefix": "3.0.0.0/16", "IPAddresses": []}
        ]}
    ]}"#;

    #[test]
    fn test_environment() {
        assert_eq!("".parse::<Environment>().unwrap(), Environment::None);
        assert_eq!("null".parse::<Environment>().unwrap(), Environment::Null);
        assert_eq!("cloud".parse::<Environment>().unwrap(), Environment::Cloud);
        assert_eq!("file".parse::<Environment>().unwrap(), Environment::File);
        assert_eq!(
            "mars".parse::<Environment>().unwrap_err(),
            UnknownEnvironment("mars".into())
        );
        assert_eq!(Environment::Cloud.to_string(), "cloud");
    }

    #[test]
    fn test_throttle() {
        let mut throttle = Throttle::new(Duration::from_secs(3600));
        assert!(throttle.ready());
        assert!(!throttle.ready());

        let mut throttle = Throttle::new(Duration::ZERO);
        assert!(throttle.ready());
        assert!(throttle.ready());
    }

    #[test]
    fn test_populate_single_interface() {
        let doc = NetworkInterfaces::from_json(SINGLE).unwrap();
        let sink = Collect::default();
        let local = populate_address_space(&sink, &doc, &interfaces());

        assert_eq!(local.id(), LOCAL_DEFAULT_ADDRESS_SPACE_ID);
        assert_eq!(local.scope(), Scope::Local);
        assert_eq!(local.pools().count(), 1);
        let pool = local.get_address_pool("1.0.0.0/12").unwrap();
        assert_eq!(pool.if_name(), "eth2");
        assert_eq!(pool.priority(), 0);
        assert_eq!(pool.space_id(), "local");
        // primary address is excluded
        assert!(pool.address("1.0.0.4".parse().unwrap()).is_none());
        let addrs: Vec<_> = pool.addresses().map(|r| r.addr().to_string()).collect();
        assert_eq!(addrs, ["1.0.0.5", "1.0.0.6"]);
    }

    #[test]
    fn test_populate_multiple_interfaces() {
        let doc = NetworkInterfaces::from_json(MULTIPLE).unwrap();
        let sink = Collect::default();
        let local = populate_address_space(&sink, &doc, &interfaces());

        // 333333333333 has no local interface
        assert_eq!(local.pools().count(), 4);
        let ids: Vec<_> = local.pools().map(|p| p.id()).collect();
        assert_eq!(ids, ["1.0.0.0/16", "1.1.0.0/16", "2.0.0.0/16", "2.1.0.0/16"]);

        let pool = local.get_address_pool("2.0.0.0/16").unwrap();
        assert_eq!(pool.if_name(), "eth3");
        assert_eq!(pool.priority(), 1);
        // duplicate address is recorded once
        assert_eq!(pool.addresses().count(), 1);
        assert_eq!(local.get_address_pool("2.1.0.0/16").unwrap().addresses().count(), 0);
        assert_eq!(local.get_address_pool("1.1.0.0/16").unwrap().if_name(), "eth1");
    }

    #[test]
    fn test_populate_wildcard_and_merged_prefix() {
        let doc = NetworkInterfaces::from_json(
            r#"{"Interfaces": [
                {"MacAddress": "*", "IsPrimary": true, "IPSubnets": [
                    {"Prefix": "10.0.0.7/24", "IPAddresses": [{"Address": "10.0.0.5"}]},
                    {"Prefix": "bogus", "IPAddresses": [{"Address": "10.0.9.5"}]}
                ]},
                {"MacAddress": "22:22:22:22:22:22", "IsPrimary": false, "IPSubnets": [
                    {"Prefix": "10.0.0.0/24", "IPAddresses": [
                        {"Address": "10.0.0.6"}, {"Address": "10.9.9.9"}, {"Address": "nope"}
                    ]}
                ]}
            ]}"#,
        )
        .unwrap();
        let sink = Collect::default();
        let local = populate_address_space(&sink, &doc, &interfaces());

        assert_eq!(local.pools().count(), 1);
        let pool = local.get_address_pool("10.0.0.0/24").unwrap();
        // first NIC with a hardware address, loopback has none
        assert_eq!(pool.if_name(), "eth1");
        assert_eq!(pool.priority(), 0);
        let addrs: Vec<_> = pool.addresses().map(|r| r.addr().to_string()).collect();
        assert_eq!(addrs, ["10.0.0.5", "10.0.0.6"]);
    }
}
