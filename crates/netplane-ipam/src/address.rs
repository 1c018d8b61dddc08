//! Address arithmetic.
//!
//! Both address families are handled as `u128` so that range math is shared.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use netplane_core::types::IpVersion;

/// Numeric value of an address.
#[must_use]
pub fn to_u128(address: IpAddr) -> u128 {
    match address {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

/// Address with the given numeric value, or `None` if it does not fit the
/// family.
#[must_use]
pub fn from_u128(value: u128, version: IpVersion) -> Option<IpAddr> {
    match version {
        IpVersion::Ipv4 => u32::try_from(value)
            .ok()
            .map(|v| IpAddr::V4(Ipv4Addr::from(v))),
        IpVersion::Ipv6 => Some(IpAddr::V6(Ipv6Addr::from(value))),
    }
}

/// The address following `address`, if any.
#[must_use]
pub fn next_address(address: IpAddr) -> Option<IpAddr> {
    to_u128(address)
        .checked_add(1)
        .and_then(|value| from_u128(value, IpVersion::of(&address)))
}

/// The address preceding `address`, if any.
#[must_use]
pub fn previous_address(address: IpAddr) -> Option<IpAddr> {
    to_u128(address)
        .checked_sub(1)
        .and_then(|value| from_u128(value, IpVersion::of(&address)))
}

/// Number of addresses in `[first, last]`.
#[must_use]
pub fn span_len(first: IpAddr, last: IpAddr) -> u128 {
    to_u128(last)
        .saturating_sub(to_u128(first))
        .saturating_add(1)
}

/// Compute `[first, last] − allocated` as maximal contiguous runs in ascending
/// order. Allocated addresses outside the bounds are ignored.
#[must_use]
pub fn free_runs<I>(first: IpAddr, last: IpAddr, allocated: I) -> Vec<(IpAddr, IpAddr)>
where
    I: IntoIterator<Item = IpAddr>,
{
    let version = IpVersion::of(&first);
    let (lo, hi) = (to_u128(first), to_u128(last));
    if lo > hi {
        return Vec::new();
    }

    let taken: BTreeSet<u128> = allocated
        .into_iter()
        .filter(|address| IpVersion::of(address) == version)
        .map(to_u128)
        .filter(|value| (lo..=hi).contains(value))
        .collect();

    let mut runs = Vec::new();
    let mut cursor = Some(lo);
    for value in taken {
        let Some(start) = cursor else { break };
        if value > start {
            runs.push((start, value - 1));
        }
        cursor = if value == hi { None } else { Some(value + 1) };
    }
    if let Some(start) = cursor {
        runs.push((start, hi));
    }

    runs.into_iter()
        .filter_map(|(start, end)| Some((from_u128(start, version)?, from_u128(end, version)?)))
        .collect()
}
