//! IPAM data models for subnets, pools, ranges and allocations.

use ipnetwork::IpNetwork;
use netplane_core::types::IpVersion;
use netplane_core::uuid::{NetworkId, PoolId, PortId, RangeId, SubnetId};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use validator::Validate;

use crate::address::{next_address, previous_address, span_len, to_u128};
use crate::pools;

/// Subnet of a logical network.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subnet {
    /// Subnet ID.
    pub id: SubnetId,
    /// Owning network.
    pub network_id: NetworkId,
    /// Canonical CIDR.
    pub cidr: IpNetwork,
    /// Address family.
    pub ip_version: IpVersion,
    /// Gateway address, if the subnet has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_ip: Option<IpAddr>,
    /// Whether DHCP is served on the subnet.
    pub enable_dhcp: bool,
}

impl Subnet {
    /// Returns true if `address` is inside the CIDR.
    #[must_use]
    pub fn contains(&self, address: IpAddr) -> bool {
        self.cidr.contains(address)
    }

    /// Returns true if `address` may be assigned to a port: inside the CIDR and
    /// neither the network address nor the IPv4 broadcast address.
    #[must_use]
    pub fn is_valid_host_address(&self, address: IpAddr) -> bool {
        pools::is_host_address(&self.cidr, address)
    }
}

/// Operator-declared address range of a subnet. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddressPool {
    /// Pool ID.
    pub id: PoolId,
    /// Owning subnet.
    pub subnet_id: SubnetId,
    /// First address of the pool.
    pub first_ip: IpAddr,
    /// Last address of the pool.
    pub last_ip: IpAddr,
}

impl AddressPool {
    /// Create a pool with a fresh ID.
    #[must_use]
    pub fn new(subnet_id: SubnetId, first_ip: IpAddr, last_ip: IpAddr) -> Self {
        Self {
            id: PoolId::new_v4(),
            subnet_id,
            first_ip,
            last_ip,
        }
    }

    /// Returns true if `address` is inside the pool.
    #[must_use]
    pub fn contains(&self, address: IpAddr) -> bool {
        in_bounds(self.first_ip, self.last_ip, address)
    }

    /// Number of addresses in the pool.
    #[must_use]
    pub fn size(&self) -> u128 {
        span_len(self.first_ip, self.last_ip)
    }
}

/// Free addresses of a pool, tracked as a contiguous run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AvailabilityRange {
    /// Row ID.
    pub id: RangeId,
    /// Owning pool.
    pub pool_id: PoolId,
    /// First free address.
    pub first_ip: IpAddr,
    /// Last free address.
    pub last_ip: IpAddr,
}

/// How a range changes when one of its addresses is taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeCarve {
    /// The range held only that address and must be deleted.
    Remove,
    /// The range shrinks at one end and is saved in place.
    Shrink(AvailabilityRange),
    /// The range is cut in two: the first element is the original row ending
    /// before the address, the second a new row starting after it.
    Split(AvailabilityRange, AvailabilityRange),
}

impl AvailabilityRange {
    /// Create a range with a fresh row ID.
    #[must_use]
    pub fn new(pool_id: PoolId, first_ip: IpAddr, last_ip: IpAddr) -> Self {
        Self {
            id: RangeId::new_v4(),
            pool_id,
            first_ip,
            last_ip,
        }
    }

    /// Returns true if `address` is inside the range.
    #[must_use]
    pub fn contains(&self, address: IpAddr) -> bool {
        in_bounds(self.first_ip, self.last_ip, address)
    }

    /// Returns true if the range holds a single address.
    #[must_use]
    pub fn is_singleton(&self) -> bool {
        self.first_ip == self.last_ip
    }

    /// Number of free addresses in the range.
    #[must_use]
    pub fn size(&self) -> u128 {
        span_len(self.first_ip, self.last_ip)
    }

    /// Work out how taking `address` changes this range. Returns `None` if the
    /// address is not in the range.
    #[must_use]
    pub fn carve(&self, address: IpAddr) -> Option<RangeCarve> {
        if !self.contains(address) {
            return None;
        }
        if self.is_singleton() {
            return Some(RangeCarve::Remove);
        }
        if address == self.first_ip {
            let mut shrunk = self.clone();
            shrunk.first_ip = next_address(address)?;
            return Some(RangeCarve::Shrink(shrunk));
        }
        if address == self.last_ip {
            let mut shrunk = self.clone();
            shrunk.last_ip = previous_address(address)?;
            return Some(RangeCarve::Shrink(shrunk));
        }

        let mut head = self.clone();
        head.last_ip = previous_address(address)?;
        let tail = Self::new(self.pool_id, next_address(address)?, self.last_ip);
        Some(RangeCarve::Split(head, tail))
    }
}

fn in_bounds(first: IpAddr, last: IpAddr, address: IpAddr) -> bool {
    if first.is_ipv4() != address.is_ipv4() {
        return false;
    }
    let value = to_u128(address);
    to_u128(first) <= value && value <= to_u128(last)
}

/// One address consumed by a port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IpAllocation {
    /// Network of the subnet.
    pub network_id: NetworkId,
    /// Subnet the address belongs to.
    pub subnet_id: SubnetId,
    /// Allocated address.
    pub ip_address: IpAddr,
    /// Port holding the address.
    pub port_id: PortId,
}

/// Result of an allocation request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AllocatedIp {
    /// Allocated address.
    pub ip_address: IpAddr,
    /// Subnet it came from.
    pub subnet_id: SubnetId,
}

impl From<&IpAllocation> for AllocatedIp {
    fn from(allocation: &IpAllocation) -> Self {
        Self {
            ip_address: allocation.ip_address,
            subnet_id: allocation.subnet_id,
        }
    }
}

/// A port's request for a fixed IP: a subnet, an address, or both.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FixedIpRequest {
    /// Subnet to allocate from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_id: Option<SubnetId>,
    /// Specific address to allocate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<IpAddr>,
}

impl FixedIpRequest {
    /// Any free address of a subnet.
    #[must_use]
    pub const fn subnet(subnet_id: SubnetId) -> Self {
        Self {
            subnet_id: Some(subnet_id),
            ip_address: None,
        }
    }

    /// A specific address; the subnet is resolved from the network.
    #[must_use]
    pub const fn address(ip_address: IpAddr) -> Self {
        Self {
            subnet_id: None,
            ip_address: Some(ip_address),
        }
    }

    /// A specific address of a specific subnet.
    #[must_use]
    pub const fn exact(subnet_id: SubnetId, ip_address: IpAddr) -> Self {
        Self {
            subnet_id: Some(subnet_id),
            ip_address: Some(ip_address),
        }
    }
}

/// Gateway selection for a new subnet.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GatewayIp {
    /// First host address of the CIDR.
    #[default]
    Auto,
    /// No gateway.
    Disabled,
    /// Explicit gateway address.
    Address(IpAddr),
}

/// Explicit allocation pool bounds, as given by the operator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolSpec {
    /// First address.
    pub start: String,
    /// Last address.
    pub end: String,
}

impl PoolSpec {
    /// Create pool bounds.
    #[must_use]
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }
}

/// Request payload to create a subnet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct CreateSubnetRequest {
    /// Owning network.
    pub network_id: NetworkId,
    /// CIDR in canonical notation.
    #[validate(length(min = 1, max = 64))]
    pub cidr: String,
    /// Address family.
    pub ip_version: IpVersion,
    /// Gateway selection.
    #[serde(default)]
    pub gateway_ip: GatewayIp,
    /// Explicit pools; derived around the gateway when absent.
    #[validate(length(min = 1))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation_pools: Option<Vec<PoolSpec>>,
    /// Whether DHCP is served on the subnet.
    #[serde(default = "default_enable_dhcp")]
    pub enable_dhcp: bool,
}

const fn default_enable_dhcp() -> bool {
    true
}

impl CreateSubnetRequest {
    /// Request a subnet with an automatic gateway and derived pools.
    #[must_use]
    pub fn new(network_id: NetworkId, cidr: impl Into<String>, ip_version: IpVersion) -> Self {
        Self {
            network_id,
            cidr: cidr.into(),
            ip_version,
            gateway_ip: GatewayIp::Auto,
            allocation_pools: None,
            enable_dhcp: default_enable_dhcp(),
        }
    }

    /// Set the gateway selection.
    #[must_use]
    pub const fn with_gateway(mut self, gateway_ip: GatewayIp) -> Self {
        self.gateway_ip = gateway_ip;
        self
    }

    /// Add an explicit pool.
    #[must_use]
    pub fn with_pool(mut self, start: impl Into<String>, end: impl Into<String>) -> Self {
        self.allocation_pools
            .get_or_insert_with(Vec::new)
            .push(PoolSpec::new(start, end));
        self
    }

    /// Enable or disable DHCP.
    #[must_use]
    pub const fn with_dhcp(mut self, enable_dhcp: bool) -> Self {
        self.enable_dhcp = enable_dhcp;
        self
    }
}

/// A subnet together with its pools.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubnetDetails {
    /// The subnet.
    pub subnet: Subnet,
    /// Its pools, in ascending order.
    pub pools: Vec<AddressPool>,
}
