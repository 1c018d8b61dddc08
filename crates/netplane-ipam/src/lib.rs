//! IP address management for netplane networks.
//!
//! Subnets own immutable address pools; each pool is tracked by a set of
//! mutable availability ranges that the allocator carves addresses from under
//! store row locks, and that [`IpamAllocator::rebuild_ranges`] recomputes from
//! the live allocations.

#![deny(missing_docs)]

pub mod address;
pub mod allocator;
pub mod memory;
pub mod models;
pub mod pools;
pub mod store;
mod subnets;

pub use allocator::IpamAllocator;
pub use memory::MemoryIpamStore;
pub use models::{
    AddressPool, AllocatedIp, AvailabilityRange, CreateSubnetRequest, FixedIpRequest, GatewayIp,
    IpAllocation, PoolSpec, Subnet, SubnetDetails,
};
pub use store::{IpamStore, IpamTransaction};

/// Convenient result alias sharing the `netplane-core` error type.
pub type Result<T> = netplane_core::Result<T>;
