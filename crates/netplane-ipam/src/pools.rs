//! Pool validation and derivation for new subnets.

use std::net::IpAddr;

use ipnetwork::IpNetwork;
use netplane_core::types::IpVersion;
use netplane_core::Error;

use crate::address::{from_u128, to_u128};
use crate::models::{GatewayIp, PoolSpec};
use crate::Result;

/// First and last assignable host address of a CIDR.
///
/// The network address is never assignable; for IPv4 neither is the broadcast
/// address. Returns `None` if the CIDR has no assignable addresses.
#[must_use]
pub fn host_bounds(cidr: &IpNetwork) -> Option<(IpAddr, IpAddr)> {
    let version = IpVersion::of(&cidr.ip());
    let bits: u32 = match version {
        IpVersion::Ipv4 => 32,
        IpVersion::Ipv6 => 128,
    };
    let host_bits = bits - u32::from(cidr.prefix());
    let network = to_u128(cidr.network());
    let last_address = if host_bits >= 128 {
        u128::MAX
    } else {
        network | ((1u128 << host_bits) - 1)
    };

    let first = network.checked_add(1)?;
    let last = match version {
        IpVersion::Ipv4 => last_address.checked_sub(1)?,
        IpVersion::Ipv6 => last_address,
    };
    if first > last {
        return None;
    }
    Some((from_u128(first, version)?, from_u128(last, version)?))
}

/// Returns true if `address` is an assignable host address of `cidr`.
#[must_use]
pub fn is_host_address(cidr: &IpNetwork, address: IpAddr) -> bool {
    if !cidr.contains(address) {
        return false;
    }
    host_bounds(cidr).is_some_and(|(first, last)| {
        let value = to_u128(address);
        to_u128(first) <= value && value <= to_u128(last)
    })
}

/// Parse a CIDR and check that it is canonical and of the expected family.
///
/// # Errors
///
/// Returns `InvalidInput` for unparsable, non-canonical or mismatched CIDRs.
pub fn parse_cidr(input: &str, ip_version: IpVersion) -> Result<IpNetwork> {
    let cidr: IpNetwork = input
        .parse()
        .map_err(|err| Error::InvalidInput(format!("Invalid CIDR `{input}`: {err}")))?;
    if IpVersion::of(&cidr.ip()) != ip_version {
        return Err(Error::InvalidInput(format!(
            "CIDR {input} is not an {ip_version} network"
        )));
    }
    if cidr.ip() != cidr.network() {
        return Err(Error::InvalidInput(format!(
            "CIDR {input} has host bits set; {}/{} is recommended",
            cidr.network(),
            cidr.prefix()
        )));
    }
    Ok(cidr)
}

/// Resolve the gateway of a new subnet.
///
/// # Errors
///
/// Returns `InvalidInput` if an explicit gateway is not a host address of the
/// CIDR.
pub fn resolve_gateway(cidr: &IpNetwork, gateway: &GatewayIp) -> Result<Option<IpAddr>> {
    match gateway {
        GatewayIp::Disabled => Ok(None),
        GatewayIp::Auto => Ok(host_bounds(cidr).map(|(first, _)| first)),
        GatewayIp::Address(address) => {
            if is_host_address(cidr, *address) {
                Ok(Some(*address))
            } else {
                Err(Error::InvalidInput(format!(
                    "Gateway {address} is not a valid host address of {cidr}"
                )))
            }
        }
    }
}

/// Pools covering the host range of `cidr` with the gateway cut out.
#[must_use]
pub fn derive_pools(cidr: &IpNetwork, gateway: Option<IpAddr>) -> Vec<(IpAddr, IpAddr)> {
    let Some((first, last)) = host_bounds(cidr) else {
        return Vec::new();
    };
    let version = IpVersion::of(&first);
    let (lo, hi) = (to_u128(first), to_u128(last));

    let split = gateway
        .filter(|gw| IpVersion::of(gw) == version)
        .map(to_u128)
        .filter(|gw| (lo..=hi).contains(gw));
    let Some(gw) = split else {
        return vec![(first, last)];
    };

    let mut pools = Vec::with_capacity(2);
    if gw > lo {
        pools.push((lo, gw - 1));
    }
    if gw < hi {
        pools.push((gw + 1, hi));
    }
    pools
        .into_iter()
        .filter_map(|(start, end)| Some((from_u128(start, version)?, from_u128(end, version)?)))
        .collect()
}

/// Validate operator-supplied pools and return them in ascending order.
///
/// # Errors
///
/// Returns `InvalidInput` for unparsable bounds, bounds of the wrong family,
/// inverted bounds, pools outside the host range, overlapping pools, or a pool
/// containing the gateway.
pub fn validate_pools(
    cidr: &IpNetwork,
    gateway: Option<IpAddr>,
    specs: &[PoolSpec],
) -> Result<Vec<(IpAddr, IpAddr)>> {
    let Some((host_first, host_last)) = host_bounds(cidr) else {
        return Err(Error::InvalidInput(format!(
            "Subnet {cidr} has no assignable addresses for allocation pools"
        )));
    };
    let version = IpVersion::of(&host_first);

    let mut pools = Vec::with_capacity(specs.len());
    for spec in specs {
        let start = parse_bound(&spec.start)?;
        let end = parse_bound(&spec.end)?;

        if IpVersion::of(&start) != version || IpVersion::of(&end) != version {
            return Err(Error::InvalidInput(format!(
                "Allocation pool {}-{} does not match the subnet IP version",
                spec.start, spec.end
            )));
        }
        if to_u128(start) > to_u128(end) {
            return Err(Error::InvalidInput(format!(
                "Allocation pool start {start} is greater than end {end}"
            )));
        }
        if to_u128(start) < to_u128(host_first) || to_u128(end) > to_u128(host_last) {
            return Err(Error::InvalidInput(format!(
                "Allocation pool {start}-{end} is outside the host range of {cidr}"
            )));
        }
        if let Some(gw) = gateway {
            if (to_u128(start)..=to_u128(end)).contains(&to_u128(gw)) {
                return Err(Error::InvalidInput(format!(
                    "Gateway {gw} conflicts with allocation pool {start}-{end}"
                )));
            }
        }
        pools.push((start, end));
    }

    pools.sort_by_key(|(start, _)| to_u128(*start));
    for pair in pools.windows(2) {
        let ((a_start, a_end), (b_start, b_end)) = (pair[0], pair[1]);
        if to_u128(b_start) <= to_u128(a_end) {
            return Err(Error::InvalidInput(format!(
                "Allocation pools {a_start}-{a_end} and {b_start}-{b_end} overlap"
            )));
        }
    }

    Ok(pools)
}

fn parse_bound(input: &str) -> Result<IpAddr> {
    input
        .trim()
        .parse()
        .map_err(|err| Error::InvalidInput(format!("Invalid allocation pool bound `{input}`: {err}")))
}
