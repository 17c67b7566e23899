//! Topology documents as reported by the host's network fabric.
//!
//! The cloud metadata endpoint answers with XML where the interface details
//! are attributes:
//!
//! ```xml
//! <Interfaces>
//!   <Interface MacAddress="000D3A6E1825" IsPrimary="true">
//!     <IPSubnet Prefix="10.0.0.0/16">
//!       <IPAddress Address="10.0.0.4" IsPrimary="true"/>
//!     </IPSubnet>
//!   </Interface>
//! </Interfaces>
//! ```
//!
//! The static file source reads the same shape as JSON, with plural list
//! names (`Interfaces`, `IPSubnets`, `IPAddresses`). Both decode into the
//! types here.
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct NetworkInterfaces {
    #[serde(rename = "Interface", alias = "Interfaces", default)]
    pub interfaces: Vec<Interface>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct Interface {
    /// uppercase hex without separators, or `*` for "any local NIC"
    #[serde(rename = "@MacAddress", alias = "MacAddress", default)]
    pub mac_address: String,
    #[serde(rename = "@IsPrimary", alias = "IsPrimary", default)]
    pub is_primary: bool,
    #[serde(rename = "IPSubnet", alias = "IPSubnets", default)]
    pub ip_subnets: Vec<IpSubnet>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct IpSubnet {
    #[serde(rename = "@Prefix", alias = "Prefix", default)]
    pub prefix: String,
    #[serde(rename = "IPAddress", alias = "IPAddresses", default)]
    pub ip_addresses: Vec<IpAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct IpAddress {
    #[serde(rename = "@Address", alias = "Address", default)]
    pub address: String,
    #[serde(rename = "@IsPrimary", alias = "IsPrimary", default)]
    pub is_primary: bool,
}

impl NetworkInterfaces {
    pub fn from_xml(s: &str) -> Result<Self, quick_xml::DeError> {
        quick_xml::de::from_str(s)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
