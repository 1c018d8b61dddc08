//! Transactional storage seam for IPAM state.
//!
//! Every read that feeds a write goes through a `*_for_update` method; a
//! backing database implements those as `SELECT ... FOR UPDATE`, so that two
//! transactions touching the same subnet serialize on its rows.

use std::net::IpAddr;

use async_trait::async_trait;
use netplane_core::types::Network;
use netplane_core::uuid::{NetworkId, PoolId, PortId, RangeId, SubnetId};

use crate::models::{AddressPool, AvailabilityRange, IpAllocation, Subnet};
use crate::Result;

/// Source of IPAM transactions.
#[async_trait]
pub trait IpamStore: Send + Sync {
    /// Open a transaction. Dropping it without [`IpamTransaction::commit`]
    /// rolls it back.
    async fn begin(&self) -> Result<Box<dyn IpamTransaction>>;
}

/// One IPAM transaction.
#[async_trait]
pub trait IpamTransaction: Send {
    /// Fetch a network.
    async fn get_network(&mut self, network_id: NetworkId) -> Result<Option<Network>>;

    /// Insert or replace a network.
    async fn insert_network(&mut self, network: Network) -> Result<()>;

    /// Delete a network row. Returns false if it did not exist.
    async fn delete_network(&mut self, network_id: NetworkId) -> Result<bool>;

    /// Fetch a subnet.
    async fn get_subnet(&mut self, subnet_id: SubnetId) -> Result<Option<Subnet>>;

    /// All subnets of a network, IPv4 before IPv6 and then by CIDR.
    async fn subnets_for_network(&mut self, network_id: NetworkId) -> Result<Vec<Subnet>>;

    /// Insert a subnet.
    async fn insert_subnet(&mut self, subnet: Subnet) -> Result<()>;

    /// Delete a subnet together with its pools and ranges.
    async fn delete_subnet(&mut self, subnet_id: SubnetId) -> Result<bool>;

    /// Pools of a subnet in ascending address order.
    async fn pools_for_subnet(&mut self, subnet_id: SubnetId) -> Result<Vec<AddressPool>>;

    /// Insert a pool.
    async fn insert_pool(&mut self, pool: AddressPool) -> Result<()>;

    /// Lock and return the ranges of every pool of a subnet, ordered by first
    /// address.
    async fn ranges_for_update(&mut self, subnet_id: SubnetId) -> Result<Vec<AvailabilityRange>>;

    /// Lock and return the ranges of one pool, ordered by first address.
    async fn pool_ranges_for_update(&mut self, pool_id: PoolId) -> Result<Vec<AvailabilityRange>>;

    /// Insert a new range row.
    async fn insert_range(&mut self, range: AvailabilityRange) -> Result<()>;

    /// Update an existing range row in place.
    async fn save_range(&mut self, range: AvailabilityRange) -> Result<()>;

    /// Delete a range row.
    async fn delete_range(&mut self, range_id: RangeId) -> Result<()>;

    /// Lock and return all allocations of a subnet.
    async fn allocations_for_update(&mut self, subnet_id: SubnetId) -> Result<Vec<IpAllocation>>;

    /// Fetch the allocation of one address.
    async fn get_allocation(
        &mut self,
        subnet_id: SubnetId,
        ip_address: IpAddr,
    ) -> Result<Option<IpAllocation>>;

    /// All allocations held by a port.
    async fn allocations_for_port(&mut self, port_id: PortId) -> Result<Vec<IpAllocation>>;

    /// Record an allocation. Fails with `IpAddressInUse` if the address of
    /// the subnet is already allocated.
    async fn insert_allocation(&mut self, allocation: IpAllocation) -> Result<()>;

    /// Remove an allocation. Returns false if there was none.
    async fn delete_allocation(&mut self, subnet_id: SubnetId, ip_address: IpAddr)
        -> Result<bool>;

    /// Make all changes durable and release the row locks.
    async fn commit(&mut self) -> Result<()>;

    /// Discard all changes and release the row locks.
    async fn rollback(&mut self) -> Result<()>;
}
