//! Shared control-plane domain types.
//!
//! Networks, their segments and ports are read by both the IPAM engine and the
//! binding protocol, so they live here rather than in either subsystem.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::uuid::{NetworkId, PortId, SegmentId};

/// Device owner of distributed router interfaces. Ports with this owner are
/// bound once per host.
pub const DEVICE_OWNER_DISTRIBUTED_ROUTER: &str = "network:router_interface_distributed";
/// Device owner of centralized router interfaces.
pub const DEVICE_OWNER_ROUTER_INTERFACE: &str = "network:router_interface";
/// Device owner of DHCP ports.
pub const DEVICE_OWNER_DHCP: &str = "network:dhcp";

/// IP protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpVersion {
    /// IPv4
    Ipv4,
    /// IPv6
    Ipv6,
}

impl IpVersion {
    /// Returns the version of an address.
    #[must_use]
    pub const fn of(address: &IpAddr) -> Self {
        match address {
            IpAddr::V4(_) => Self::Ipv4,
            IpAddr::V6(_) => Self::Ipv6,
        }
    }

    /// Returns the numeric version (4 or 6).
    #[must_use]
    pub const fn number(self) -> u8 {
        match self {
            Self::Ipv4 => 4,
            Self::Ipv6 => 6,
        }
    }
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IPv{}", self.number())
    }
}

impl TryFrom<u8> for IpVersion {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            4 => Ok(Self::Ipv4),
            6 => Ok(Self::Ipv6),
            other => Err(Error::InvalidInput(format!("Unknown IP version: {other}"))),
        }
    }
}

/// Provider segment of a network; what mechanism drivers bind ports to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkSegment {
    /// Segment ID.
    pub id: SegmentId,
    /// Segmentation technology (flat, vlan, vxlan, ...).
    pub network_type: String,
    /// Physical network name, for provider segments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_network: Option<String>,
    /// VLAN ID or tunnel key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segmentation_id: Option<u32>,
}

impl NetworkSegment {
    /// Create a segment with a fresh ID.
    #[must_use]
    pub fn new(network_type: impl Into<String>) -> Self {
        Self {
            id: SegmentId::new_v4(),
            network_type: network_type.into(),
            physical_network: None,
            segmentation_id: None,
        }
    }

    /// Set the physical network.
    #[must_use]
    pub fn with_physical_network(mut self, physical_network: impl Into<String>) -> Self {
        self.physical_network = Some(physical_network.into());
        self
    }

    /// Set the segmentation ID.
    #[must_use]
    pub const fn with_segmentation_id(mut self, segmentation_id: u32) -> Self {
        self.segmentation_id = Some(segmentation_id);
        self
    }
}

/// Logical network.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Network {
    /// Network ID.
    pub id: NetworkId,
    /// Human-friendly name.
    pub name: String,
    /// Administrative state.
    pub admin_state_up: bool,
    /// Whether the network is shared between tenants.
    pub shared: bool,
    /// Provider segments, in binding preference order.
    #[serde(default)]
    pub segments: Vec<NetworkSegment>,
}

/// Port status as reported by agents or requested by drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PortStatus {
    /// Port is operational.
    Active,
    /// Port is not operational.
    Down,
    /// Port is being wired.
    Build,
    /// Port is in an error state.
    Error,
}

impl PortStatus {
    /// Returns the wire name of the status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Down => "DOWN",
            Self::Build => "BUILD",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for PortStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PortStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "ACTIVE" => Ok(Self::Active),
            "DOWN" => Ok(Self::Down),
            "BUILD" => Ok(Self::Build),
            "ERROR" => Ok(Self::Error),
            _ => Err(Error::InvalidInput(format!("Unknown port status: {s}"))),
        }
    }
}

/// Port on a logical network.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Port {
    /// Port ID.
    pub id: PortId,
    /// Owning network.
    pub network_id: NetworkId,
    /// MAC address, lowercase colon-separated.
    pub mac_address: String,
    /// Entity owning the port (`compute:nova`, `network:dhcp`, ...).
    pub device_owner: String,
    /// Device using the port.
    pub device_id: String,
    /// Administrative state.
    pub admin_state_up: bool,
    /// Operational status.
    pub status: PortStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modified timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Port {
    /// Returns true if the port is bound separately on every host it lives on.
    #[must_use]
    pub fn is_distributed(&self) -> bool {
        self.device_owner == DEVICE_OWNER_DISTRIBUTED_ROUTER
    }

    /// Stamp the modification time.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_version_of() {
        assert_eq!(IpVersion::of(&"10.0.0.1".parse().unwrap()), IpVersion::Ipv4);
        assert_eq!(IpVersion::of(&"fd00::1".parse().unwrap()), IpVersion::Ipv6);
    }

    #[test]
    fn test_ip_version_try_from() {
        assert_eq!(IpVersion::try_from(4).unwrap(), IpVersion::Ipv4);
        assert_eq!(IpVersion::try_from(6).unwrap(), IpVersion::Ipv6);
        assert!(matches!(
            IpVersion::try_from(5).unwrap_err(),
            Error::InvalidInput(_)
        ));
    }

    #[test]
    fn test_ip_version_serde() {
        assert_eq!(serde_json::to_string(&IpVersion::Ipv6).unwrap(), "\"ipv6\"");
        assert_eq!(IpVersion::Ipv4.to_string(), "IPv4");
    }

    #[test]
    fn test_port_status_round_trip() {
        for status in [
            PortStatus::Active,
            PortStatus::Down,
            PortStatus::Build,
            PortStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<PortStatus>().unwrap(), status);
        }
        assert_eq!(
            serde_json::to_string(&PortStatus::Active).unwrap(),
            "\"ACTIVE\""
        );
        assert!("UP".parse::<PortStatus>().is_err());
    }

    #[test]
    fn test_segment_builder() {
        let segment = NetworkSegment::new("vlan")
            .with_physical_network("physnet1")
            .with_segmentation_id(100);
        assert_eq!(segment.network_type, "vlan");
        assert_eq!(segment.physical_network.as_deref(), Some("physnet1"));
        assert_eq!(segment.segmentation_id, Some(100));

        let json = serde_json::to_value(NetworkSegment::new("vxlan")).unwrap();
        assert!(json.get("physical_network").is_none());
    }

    #[test]
    fn test_port_is_distributed() {
        let now = Utc::now();
        let mut port = Port {
            id: PortId::new_v4(),
            network_id: NetworkId::new_v4(),
            mac_address: "fa:16:3e:00:00:01".into(),
            device_owner: "compute:nova".into(),
            device_id: "vm-1".into(),
            admin_state_up: true,
            status: PortStatus::Down,
            created_at: now,
            updated_at: now,
        };
        assert!(!port.is_distributed());

        port.device_owner = DEVICE_OWNER_DISTRIBUTED_ROUTER.into();
        assert!(port.is_distributed());
    }
}
