//! # platform
//!
//! Host queries the address manager depends on: when the host last booted
//! (used to invalidate leases that predate the boot) and which NICs are
//! attached right now (used by topology sources to map reported interfaces
//! onto local interface names).
//!
//! Everything goes through the [`Platform`] trait so callers can substitute
//! [`StaticPlatform`] when the real host should not be consulted.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::{
    fmt, io,
    time::{Duration, SystemTime},
};

use pnet::datalink::{self, MacAddr};
use tracing::{debug, trace};

/// A NIC present on this host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalInterface {
    /// interface name, e.g. `eth0`
    pub name: String,
    /// hardware address as uppercase hex without separators, e.g. `000D3A6E1825`
    pub mac: Option<String>,
}

impl LocalInterface {
    pub fn new<S: Into<String>>(name: S, mac: Option<[u8; 6]>) -> Self {
        Self {
            name: name.into(),
            mac: mac.map(|m| format_mac(&m)),
        }
    }

    /// true if this interface has a non-zero hardware address
    pub fn has_hardware_addr(&self) -> bool {
        self.mac
            .as_deref()
            .map(|m| m.chars().any(|c| c != '0'))
            .unwrap_or(false)
    }
}

fn format_mac(octets: &[u8]) -> String {
    octets.iter().map(|b| format!("{b:02X}")).collect()
}

fn mac_octets(mac: MacAddr) -> [u8; 6] {
    [mac.0, mac.1, mac.2, mac.3, mac.4, mac.5]
}

/// Host queries used by the address manager and its topology sources
pub trait Platform: Send + Sync + fmt::Debug + 'static {
    /// the time this host last booted
    fn last_reboot_time(&self) -> io::Result<SystemTime>;
    /// NICs currently attached to the host
    fn interfaces(&self) -> Vec<LocalInterface>;
}

/// Queries the running host
#[derive(Debug, Default, Clone, Copy)]
pub struct HostPlatform;

impl Platform for HostPlatform {
    fn last_reboot_time(&self) -> io::Result<SystemTime> {
        boot_time()
    }

    fn interfaces(&self) -> Vec<LocalInterface> {
        let interfaces = datalink::interfaces()
            .into_iter()
            .map(|i| LocalInterface {
                mac: i.mac.map(|m| format_mac(&mac_octets(m))),
                name: i.name,
            })
            .collect::<Vec<_>>();
        trace!(?interfaces, "found local interfaces");
        interfaces
    }
}

/// Fixed answers, for hosts where the real queries are unavailable or
/// undesirable
#[derive(Debug, Default, Clone)]
pub struct StaticPlatform {
    reboot_time: Option<SystemTime>,
    interfaces: Vec<LocalInterface>,
}

impl StaticPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reboot_time(mut self, time: SystemTime) -> Self {
        self.reboot_time = Some(time);
        self
    }

    pub fn with_interface(mut self, interface: LocalInterface) -> Self {
        self.interfaces.push(interface);
        self
    }
}

impl Platform for StaticPlatform {
    fn last_reboot_time(&self) -> io::Result<SystemTime> {
        self.reboot_time
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no reboot time configured"))
    }

    fn interfaces(&self) -> Vec<LocalInterface> {
        self.interfaces.clone()
    }
}

#[cfg(target_os = "linux")]
fn boot_time() -> io::Result<SystemTime> {
    let stat = std::fs::read_to_string("/proc/stat")?;
    let time = parse_btime(&stat)?;
    debug!(?time, "read boot time from /proc/stat");
    Ok(time)
}

#[cfg(not(target_os = "linux"))]
fn boot_time() -> io::Result<SystemTime> {
    debug!("boot time query not supported on this platform");
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "boot time query not supported on this platform",
    ))
}

/// parse the `btime` line (seconds since the epoch) out of `/proc/stat`
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_btime(stat: &str) -> io::Result<SystemTime> {
    stat.lines()
        .find_map(|line| line.strip_prefix("btime "))
        .and_then(|secs| secs.trim().parse::<u64>().ok())
        .map(|secs| SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no btime entry in /proc/stat"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_btime() {
        let stat = "cpu  2255 34 2290 22625563 6290 127 456\nintr 114930548\nctxt 1990473\nbtime 1700000000\nprocesses 2915\n";
        assert_eq!(
            parse_btime(stat).unwrap(),
            SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)
        );
        assert!(parse_btime("cpu 1 2 3\n").is_err());
        assert!(parse_btime("btime soon\n").is_err());
    }

    #[test]
    fn test_mac_format() {
        let int = LocalInterface::new("eth2", Some([0x00, 0x0d, 0x3a, 0x6e, 0x18, 0x25]));
        assert_eq!(int.mac.as_deref(), Some("000D3A6E1825"));
        assert!(int.has_hardware_addr());

        let lo = LocalInterface::new("lo", Some([0; 6]));
        assert_eq!(lo.mac.as_deref(), Some("000000000000"));
        assert!(!lo.has_hardware_addr());
        assert!(!LocalInterface::new("tun0", None).has_hardware_addr());
    }

    #[test]
    fn test_static_platform() {
        let boot = SystemTime::UNIX_EPOCH + Duration::from_secs(42);
        let platform = StaticPlatform::new()
            .with_reboot_time(boot)
            .with_interface(LocalInterface::new("eth0", Some([1, 2, 3, 4, 5, 6])));
        assert_eq!(platform.last_reboot_time().unwrap(), boot);
        assert_eq!(platform.interfaces().len(), 1);
        assert!(StaticPlatform::new().last_reboot_time().is_err());
    }
}
