//! In-memory [`IpamStore`].
//!
//! A transaction holds the table lock from `begin` until it commits or rolls
//! back, which gives every transaction the isolation a row-locking database
//! would give it on the rows it touches. Changes are applied in place and
//! undone from a snapshot on rollback or drop.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use netplane_core::types::Network;
use netplane_core::uuid::{NetworkId, PoolId, PortId, RangeId, SubnetId};
use netplane_core::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

use crate::address::to_u128;
use crate::models::{AddressPool, AvailabilityRange, IpAllocation, Subnet};
use crate::store::{IpamStore, IpamTransaction};
use crate::Result;

#[derive(Debug, Clone, Default)]
struct IpamTables {
    networks: BTreeMap<NetworkId, Network>,
    subnets: BTreeMap<SubnetId, Subnet>,
    pools: BTreeMap<PoolId, AddressPool>,
    ranges: BTreeMap<RangeId, AvailabilityRange>,
    allocations: BTreeMap<(SubnetId, IpAddr), IpAllocation>,
}

impl IpamTables {
    fn pool_ids(&self, subnet_id: SubnetId) -> Vec<PoolId> {
        self.pools
            .values()
            .filter(|pool| pool.subnet_id == subnet_id)
            .map(|pool| pool.id)
            .collect()
    }

    fn sorted_ranges<F>(&self, filter: F) -> Vec<AvailabilityRange>
    where
        F: Fn(&AvailabilityRange) -> bool,
    {
        let mut ranges: Vec<_> = self.ranges.values().filter(|r| filter(r)).cloned().collect();
        ranges.sort_by_key(|range| to_u128(range.first_ip));
        ranges
    }
}

/// IPAM store kept in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryIpamStore {
    tables: Arc<Mutex<IpamTables>>,
}

impl MemoryIpamStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IpamStore for MemoryIpamStore {
    async fn begin(&self) -> Result<Box<dyn IpamTransaction>> {
        let guard = Arc::clone(&self.tables).lock_owned().await;
        let snapshot = guard.clone();
        trace!("began ipam transaction");
        Ok(Box::new(MemoryIpamTransaction {
            guard: Some(guard),
            snapshot,
        }))
    }
}

struct MemoryIpamTransaction {
    guard: Option<OwnedMutexGuard<IpamTables>>,
    snapshot: IpamTables,
}

impl MemoryIpamTransaction {
    fn tables(&mut self) -> Result<&mut IpamTables> {
        self.guard
            .as_deref_mut()
            .ok_or_else(|| Error::StoreError("transaction is already closed".to_string()))
    }
}

impl Drop for MemoryIpamTransaction {
    fn drop(&mut self) {
        if let Some(mut guard) = self.guard.take() {
            *guard = std::mem::take(&mut self.snapshot);
            trace!("rolled back abandoned ipam transaction");
        }
    }
}

#[async_trait]
impl IpamTransaction for MemoryIpamTransaction {
    async fn get_network(&mut self, network_id: NetworkId) -> Result<Option<Network>> {
        Ok(self.tables()?.networks.get(&network_id).cloned())
    }

    async fn insert_network(&mut self, network: Network) -> Result<()> {
        self.tables()?.networks.insert(network.id, network);
        Ok(())
    }

    async fn delete_network(&mut self, network_id: NetworkId) -> Result<bool> {
        Ok(self.tables()?.networks.remove(&network_id).is_some())
    }

    async fn get_subnet(&mut self, subnet_id: SubnetId) -> Result<Option<Subnet>> {
        Ok(self.tables()?.subnets.get(&subnet_id).cloned())
    }

    async fn subnets_for_network(&mut self, network_id: NetworkId) -> Result<Vec<Subnet>> {
        let mut subnets: Vec<Subnet> = self
            .tables()?
            .subnets
            .values()
            .filter(|subnet| subnet.network_id == network_id)
            .cloned()
            .collect();
        subnets.sort_by_key(|subnet| {
            (
                subnet.ip_version.number(),
                to_u128(subnet.cidr.network()),
                subnet.cidr.prefix(),
            )
        });
        Ok(subnets)
    }

    async fn insert_subnet(&mut self, subnet: Subnet) -> Result<()> {
        let tables = self.tables()?;
        if tables.subnets.contains_key(&subnet.id) {
            return Err(Error::StoreError(format!("subnet {} already exists", subnet.id)));
        }
        tables.subnets.insert(subnet.id, subnet);
        Ok(())
    }

    async fn delete_subnet(&mut self, subnet_id: SubnetId) -> Result<bool> {
        let tables = self.tables()?;
        let pool_ids = tables.pool_ids(subnet_id);
        tables.ranges.retain(|_, range| !pool_ids.contains(&range.pool_id));
        tables.pools.retain(|_, pool| pool.subnet_id != subnet_id);
        tables.allocations.retain(|(subnet, _), _| *subnet != subnet_id);
        Ok(tables.subnets.remove(&subnet_id).is_some())
    }

    async fn pools_for_subnet(&mut self, subnet_id: SubnetId) -> Result<Vec<AddressPool>> {
        let mut pools: Vec<AddressPool> = self
            .tables()?
            .pools
            .values()
            .filter(|pool| pool.subnet_id == subnet_id)
            .cloned()
            .collect();
        pools.sort_by_key(|pool| to_u128(pool.first_ip));
        Ok(pools)
    }

    async fn insert_pool(&mut self, pool: AddressPool) -> Result<()> {
        self.tables()?.pools.insert(pool.id, pool);
        Ok(())
    }

    async fn ranges_for_update(&mut self, subnet_id: SubnetId) -> Result<Vec<AvailabilityRange>> {
        let tables = self.tables()?;
        let pool_ids = tables.pool_ids(subnet_id);
        Ok(tables.sorted_ranges(|range| pool_ids.contains(&range.pool_id)))
    }

    async fn pool_ranges_for_update(&mut self, pool_id: PoolId) -> Result<Vec<AvailabilityRange>> {
        Ok(self.tables()?.sorted_ranges(|range| range.pool_id == pool_id))
    }

    async fn insert_range(&mut self, range: AvailabilityRange) -> Result<()> {
        let tables = self.tables()?;
        if !tables.pools.contains_key(&range.pool_id) {
            return Err(Error::StoreError(format!(
                "range {} references missing pool {}",
                range.id, range.pool_id
            )));
        }
        tables.ranges.insert(range.id, range);
        Ok(())
    }

    async fn save_range(&mut self, range: AvailabilityRange) -> Result<()> {
        let tables = self.tables()?;
        match tables.ranges.get_mut(&range.id) {
            Some(row) => {
                *row = range;
                Ok(())
            }
            None => Err(Error::StoreError(format!("range {} does not exist", range.id))),
        }
    }

    async fn delete_range(&mut self, range_id: RangeId) -> Result<()> {
        self.tables()?.ranges.remove(&range_id);
        Ok(())
    }

    async fn allocations_for_update(&mut self, subnet_id: SubnetId) -> Result<Vec<IpAllocation>> {
        Ok(self
            .tables()?
            .allocations
            .values()
            .filter(|allocation| allocation.subnet_id == subnet_id)
            .cloned()
            .collect())
    }

    async fn get_allocation(
        &mut self,
        subnet_id: SubnetId,
        ip_address: IpAddr,
    ) -> Result<Option<IpAllocation>> {
        Ok(self
            .tables()?
            .allocations
            .get(&(subnet_id, ip_address))
            .cloned())
    }

    async fn allocations_for_port(&mut self, port_id: PortId) -> Result<Vec<IpAllocation>> {
        Ok(self
            .tables()?
            .allocations
            .values()
            .filter(|allocation| allocation.port_id == port_id)
            .cloned()
            .collect())
    }

    async fn insert_allocation(&mut self, allocation: IpAllocation) -> Result<()> {
        let tables = self.tables()?;
        let key = (allocation.subnet_id, allocation.ip_address);
        if tables.allocations.contains_key(&key) {
            return Err(Error::IpAddressInUse {
                network_id: allocation.network_id,
                ip_address: allocation.ip_address,
            });
        }
        tables.allocations.insert(key, allocation);
        Ok(())
    }

    async fn delete_allocation(
        &mut self,
        subnet_id: SubnetId,
        ip_address: IpAddr,
    ) -> Result<bool> {
        Ok(self
            .tables()?
            .allocations
            .remove(&(subnet_id, ip_address))
            .is_some())
    }

    async fn commit(&mut self) -> Result<()> {
        let guard = self
            .guard
            .take()
            .ok_or_else(|| Error::StoreError("transaction is already closed".to_string()))?;
        drop(guard);
        self.snapshot = IpamTables::default();
        trace!("committed ipam transaction");
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        let mut guard = self
            .guard
            .take()
            .ok_or_else(|| Error::StoreError("transaction is already closed".to_string()))?;
        *guard = std::mem::take(&mut self.snapshot);
        trace!("rolled back ipam transaction");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn network() -> Network {
        Network {
            id: NetworkId::new_v4(),
            name: "net".to_string(),
            admin_state_up: true,
            shared: false,
            segments: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_commit_persists_changes() {
        let store = MemoryIpamStore::new();
        let net = network();

        let mut tx = store.begin().await.unwrap();
        tx.insert_network(net.clone()).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.get_network(net.id).await.unwrap(), Some(net));
    }

    #[tokio::test]
    async fn test_rollback_and_drop_discard_changes() {
        let store = MemoryIpamStore::new();
        let net = network();

        let mut tx = store.begin().await.unwrap();
        tx.insert_network(net.clone()).await.unwrap();
        tx.rollback().await.unwrap();

        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_network(net.clone()).await.unwrap();
        }

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.get_network(net.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_closed_transaction_rejects_operations() {
        let store = MemoryIpamStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.commit().await.unwrap();
        assert!(matches!(
            tx.get_network(NetworkId::new_v4()).await,
            Err(Error::StoreError(_))
        ));
        assert!(matches!(tx.commit().await, Err(Error::StoreError(_))));
    }

    #[tokio::test]
    async fn test_duplicate_allocation_is_rejected() {
        let store = MemoryIpamStore::new();
        let allocation = IpAllocation {
            network_id: NetworkId::new_v4(),
            subnet_id: SubnetId::new_v4(),
            ip_address: ip("10.0.0.2"),
            port_id: PortId::new_v4(),
        };

        let mut tx = store.begin().await.unwrap();
        tx.insert_allocation(allocation.clone()).await.unwrap();
        let err = tx.insert_allocation(allocation.clone()).await.unwrap_err();
        assert!(matches!(err, Error::IpAddressInUse { .. }));
        assert!(tx
            .delete_allocation(allocation.subnet_id, allocation.ip_address)
            .await
            .unwrap());
        assert!(!tx
            .delete_allocation(allocation.subnet_id, allocation.ip_address)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_ranges_are_ordered_and_cascade_with_subnet() {
        let store = MemoryIpamStore::new();
        let subnet_id = SubnetId::new_v4();
        let pool = AddressPool::new(subnet_id, ip("10.0.0.2"), ip("10.0.0.20"));

        let mut tx = store.begin().await.unwrap();
        tx.insert_pool(pool.clone()).await.unwrap();
        tx.insert_range(AvailabilityRange::new(pool.id, ip("10.0.0.10"), ip("10.0.0.20")))
            .await
            .unwrap();
        tx.insert_range(AvailabilityRange::new(pool.id, ip("10.0.0.2"), ip("10.0.0.5")))
            .await
            .unwrap();

        let ranges = tx.ranges_for_update(subnet_id).await.unwrap();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].first_ip, ip("10.0.0.2"));
        assert_eq!(ranges[1].first_ip, ip("10.0.0.10"));

        tx.delete_subnet(subnet_id).await.unwrap();
        assert!(tx.ranges_for_update(subnet_id).await.unwrap().is_empty());
        assert!(tx.pools_for_subnet(subnet_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_range_requires_pool() {
        let store = MemoryIpamStore::new();
        let mut tx = store.begin().await.unwrap();
        let orphan = AvailabilityRange::new(PoolId::new_v4(), ip("10.0.0.2"), ip("10.0.0.3"));
        assert!(matches!(
            tx.insert_range(orphan).await,
            Err(Error::StoreError(_))
        ));
    }
}
