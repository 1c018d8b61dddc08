//! Address allocator.
//!
//! Addresses are drawn first-fit from the availability ranges of the candidate
//! subnets. Every read-modify-write runs under the network's named lock and
//! inside one store transaction; the named lock only queues local tasks, the
//! transaction's row locks are what keep concurrent writers apart.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use netplane_core::config::ControlPlaneConfig;
use netplane_core::lock::{ipam_lock, LockManager};
use netplane_core::types::IpVersion;
use netplane_core::uuid::{NetworkId, PortId, SubnetId};
use netplane_core::Error;
use tracing::{debug, info, warn};

use crate::address::{free_runs, next_address, previous_address};
use crate::models::{
    AllocatedIp, AvailabilityRange, FixedIpRequest, IpAllocation, RangeCarve, Subnet,
};
use crate::store::{IpamStore, IpamTransaction};
use crate::Result;

/// Allocates, releases and repairs IP addresses.
#[derive(Clone)]
pub struct IpamAllocator {
    pub(crate) store: Arc<dyn IpamStore>,
    pub(crate) locks: Arc<LockManager>,
    reclaim_on_release: bool,
    max_fixed_ips_per_port: usize,
}

impl std::fmt::Debug for IpamAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpamAllocator")
            .field("reclaim_on_release", &self.reclaim_on_release)
            .field("max_fixed_ips_per_port", &self.max_fixed_ips_per_port)
            .finish_non_exhaustive()
    }
}

impl IpamAllocator {
    /// Create an allocator with lazy release and the default fixed-IP limit.
    #[must_use]
    pub fn new(store: Arc<dyn IpamStore>, locks: Arc<LockManager>) -> Self {
        Self::from_config(store, locks, &ControlPlaneConfig::default())
    }

    /// Create an allocator configured from `config`.
    #[must_use]
    pub fn from_config(
        store: Arc<dyn IpamStore>,
        locks: Arc<LockManager>,
        config: &ControlPlaneConfig,
    ) -> Self {
        Self {
            store,
            locks,
            reclaim_on_release: config.ipam.reclaim_on_release,
            max_fixed_ips_per_port: config.max_fixed_ips_per_port,
        }
    }

    /// Return released addresses to the availability ranges immediately.
    #[must_use]
    pub const fn with_reclaim_on_release(mut self, enabled: bool) -> Self {
        self.reclaim_on_release = enabled;
        self
    }

    /// Allocate one address for `port_id` from `candidates`.
    ///
    /// With an explicit `address` the candidate whose CIDR contains it is
    /// used; otherwise the next free address is generated.
    ///
    /// # Errors
    ///
    /// See [`IpamAllocator::generate_ip`] and
    /// [`IpamAllocator::allocate_specific_ip`].
    pub async fn allocate_ip(
        &self,
        port_id: PortId,
        candidates: &[Subnet],
        address: Option<IpAddr>,
    ) -> Result<AllocatedIp> {
        match address {
            Some(address) => {
                let subnet = candidates
                    .iter()
                    .find(|subnet| subnet.contains(address))
                    .ok_or_else(|| {
                        Error::InvalidInput(format!(
                            "IP address {address} does not belong to any candidate subnet"
                        ))
                    })?;
                self.allocate_specific_ip(port_id, subnet, address).await
            }
            None => self.generate_ip(port_id, candidates).await,
        }
    }

    /// Generate the next free address from the first candidate subnet that
    /// has one.
    ///
    /// If no candidate has a free range, their ranges are rebuilt once and
    /// generation is retried once.
    ///
    /// # Errors
    ///
    /// Returns `IpAddressGenerationFailure` if the retry fails as well, and
    /// `InvalidInput` if `candidates` is empty.
    pub async fn generate_ip(&self, port_id: PortId, candidates: &[Subnet]) -> Result<AllocatedIp> {
        match self.try_generate_ip(port_id, candidates).await {
            Err(Error::IpAddressGenerationFailure { network_id }) => {
                info!(
                    network_id = %network_id,
                    port_id = %port_id,
                    "No free address in candidate subnets, rebuilding availability ranges"
                );
                let subnet_ids: Vec<SubnetId> = candidates.iter().map(|s| s.id).collect();
                self.rebuild_ranges(&subnet_ids).await?;
                self.try_generate_ip(port_id, candidates).await
            }
            other => other,
        }
    }

    async fn try_generate_ip(&self, port_id: PortId, candidates: &[Subnet]) -> Result<AllocatedIp> {
        let network_id = candidates
            .first()
            .map(|subnet| subnet.network_id)
            .ok_or_else(|| Error::InvalidInput("No candidate subnets to allocate from".into()))?;

        let _lock = self.locks.acquire(ipam_lock(&network_id)).await;
        let mut tx = self.store.begin().await?;

        for subnet in candidates {
            if tx.get_subnet(subnet.id).await?.is_none() {
                debug!(subnet_id = %subnet.id, "Skipping deleted candidate subnet");
                continue;
            }
            let ranges = tx.ranges_for_update(subnet.id).await?;
            let Some(range) = ranges.into_iter().next() else {
                continue;
            };

            let ip_address = range.first_ip;
            apply_carve(tx.as_mut(), &range, ip_address).await?;
            tx.insert_allocation(IpAllocation {
                network_id: subnet.network_id,
                subnet_id: subnet.id,
                ip_address,
                port_id,
            })
            .await?;
            tx.commit().await?;

            debug!(
                port_id = %port_id,
                subnet_id = %subnet.id,
                ip_address = %ip_address,
                "Generated IP address"
            );
            return Ok(AllocatedIp {
                ip_address,
                subnet_id: subnet.id,
            });
        }

        tx.rollback().await?;
        Err(Error::IpAddressGenerationFailure { network_id })
    }

    /// Allocate exactly `address` from `subnet`.
    ///
    /// The range holding the address is shrunk, split or deleted. An address
    /// that is a valid host of the subnet but lies outside every range is
    /// recorded without touching the ranges.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the address is not a host address of the
    /// subnet, `IpAddressInUse` if it is already allocated and `NotFound` if
    /// the subnet no longer exists.
    pub async fn allocate_specific_ip(
        &self,
        port_id: PortId,
        subnet: &Subnet,
        address: IpAddr,
    ) -> Result<AllocatedIp> {
        if !subnet.is_valid_host_address(address) {
            return Err(Error::InvalidInput(format!(
                "IP address {address} is not a valid host address of subnet {}",
                subnet.cidr
            )));
        }

        let _lock = self.locks.acquire(ipam_lock(&subnet.network_id)).await;
        let mut tx = self.store.begin().await?;

        if tx.get_subnet(subnet.id).await?.is_none() {
            return Err(Error::NotFound(format!("Subnet {}", subnet.id)));
        }
        if tx.get_allocation(subnet.id, address).await?.is_some() {
            return Err(Error::IpAddressInUse {
                network_id: subnet.network_id,
                ip_address: address,
            });
        }

        let ranges = tx.ranges_for_update(subnet.id).await?;
        if let Some(range) = ranges.iter().find(|range| range.contains(address)) {
            apply_carve(tx.as_mut(), range, address).await?;
        }
        tx.insert_allocation(IpAllocation {
            network_id: subnet.network_id,
            subnet_id: subnet.id,
            ip_address: address,
            port_id,
        })
        .await?;
        tx.commit().await?;

        debug!(
            port_id = %port_id,
            subnet_id = %subnet.id,
            ip_address = %address,
            "Allocated requested IP address"
        );
        Ok(AllocatedIp {
            ip_address: address,
            subnet_id: subnet.id,
        })
    }

    /// Allocate every fixed IP of a port on `network_id`.
    ///
    /// An empty request list allocates one IPv4 and one IPv6 address from the
    /// network's subnets of each family, skipping a family without subnets.
    /// If any allocation fails, the addresses already allocated by this call
    /// are released before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for too many, duplicate or unresolvable
    /// requests, plus any error of the individual allocations.
    pub async fn allocate_ips_for_port(
        &self,
        port_id: PortId,
        network_id: NetworkId,
        requests: &[FixedIpRequest],
    ) -> Result<Vec<AllocatedIp>> {
        if requests.len() > self.max_fixed_ips_per_port {
            return Err(Error::InvalidInput(format!(
                "Exceeded maximum of {} fixed IPs per port",
                self.max_fixed_ips_per_port
            )));
        }

        let subnets = self.subnets_for_network(network_id).await?;
        let plan = if requests.is_empty() {
            None
        } else {
            Some(resolve_requests(network_id, &subnets, requests)?)
        };

        let mut allocated = Vec::new();
        let result = match plan {
            None => self.allocate_dual_stack(port_id, &subnets, &mut allocated).await,
            Some(plan) => self.allocate_planned(port_id, &plan, &mut allocated).await,
        };

        if let Err(err) = result {
            warn!(
                port_id = %port_id,
                network_id = %network_id,
                allocated = allocated.len(),
                error = %err,
                "Fixed IP allocation failed, releasing addresses allocated so far"
            );
            self.rollback_ips(network_id, &allocated).await?;
            return Err(err);
        }

        Ok(allocated)
    }

    async fn allocate_dual_stack(
        &self,
        port_id: PortId,
        subnets: &[Subnet],
        allocated: &mut Vec<AllocatedIp>,
    ) -> Result<()> {
        for version in [IpVersion::Ipv4, IpVersion::Ipv6] {
            let candidates: Vec<Subnet> = subnets
                .iter()
                .filter(|subnet| subnet.ip_version == version)
                .cloned()
                .collect();
            if candidates.is_empty() {
                continue;
            }
            allocated.push(self.generate_ip(port_id, &candidates).await?);
        }
        Ok(())
    }

    async fn allocate_planned(
        &self,
        port_id: PortId,
        plan: &[(Subnet, Option<IpAddr>)],
        allocated: &mut Vec<AllocatedIp>,
    ) -> Result<()> {
        for (subnet, address) in plan {
            let ip = match address {
                Some(address) => self.allocate_specific_ip(port_id, subnet, *address).await?,
                None => self.generate_ip(port_id, std::slice::from_ref(subnet)).await?,
            };
            allocated.push(ip);
        }
        Ok(())
    }

    /// Release an allocated address. Releasing an address that is not
    /// allocated is a no-op.
    ///
    /// The address returns to the availability ranges on the next rebuild,
    /// or immediately when reclaim on release is enabled.
    ///
    /// # Errors
    ///
    /// Returns store errors only.
    pub async fn release_ip(
        &self,
        network_id: NetworkId,
        subnet_id: SubnetId,
        address: IpAddr,
    ) -> Result<()> {
        self.release(network_id, subnet_id, address, self.reclaim_on_release)
            .await
    }

    async fn release(
        &self,
        network_id: NetworkId,
        subnet_id: SubnetId,
        address: IpAddr,
        reclaim: bool,
    ) -> Result<()> {
        let _lock = self.locks.acquire(ipam_lock(&network_id)).await;
        let mut tx = self.store.begin().await?;

        if !tx.delete_allocation(subnet_id, address).await? {
            tx.rollback().await?;
            debug!(subnet_id = %subnet_id, ip_address = %address, "Address was not allocated");
            return Ok(());
        }
        if reclaim {
            reclaim_address(tx.as_mut(), subnet_id, address).await?;
        }
        tx.commit().await?;

        debug!(
            subnet_id = %subnet_id,
            ip_address = %address,
            reclaimed = reclaim,
            "Released IP address"
        );
        Ok(())
    }

    /// Return addresses allocated by an operation that is being abandoned.
    ///
    /// Unlike [`IpamAllocator::release_ip`] the addresses go straight back to
    /// the availability ranges, whatever the reclaim setting.
    ///
    /// # Errors
    ///
    /// Returns store errors only.
    pub async fn rollback_ips(&self, network_id: NetworkId, ips: &[AllocatedIp]) -> Result<()> {
        for ip in ips {
            self.release(network_id, ip.subnet_id, ip.ip_address, true)
                .await?;
        }
        Ok(())
    }

    /// Release every address held by a port and return what was released.
    ///
    /// # Errors
    ///
    /// Returns store errors only.
    pub async fn release_port_ips(&self, port_id: PortId) -> Result<Vec<AllocatedIp>> {
        let allocations = self.port_allocations(port_id).await?;
        for allocation in &allocations {
            self.release_ip(allocation.network_id, allocation.subnet_id, allocation.ip_address)
                .await?;
        }
        Ok(allocations.iter().map(AllocatedIp::from).collect())
    }

    /// Recompute the availability ranges of each subnet from its pools and
    /// live allocations.
    ///
    /// Pools whose computed ranges already match the stored ones are left
    /// untouched, so repeated rebuilds change nothing. Subnets that no longer
    /// exist are skipped.
    ///
    /// # Errors
    ///
    /// Returns store errors only.
    pub async fn rebuild_ranges(&self, subnet_ids: &[SubnetId]) -> Result<()> {
        for subnet_id in subnet_ids {
            let Some(subnet) = self.read_subnet(*subnet_id).await? else {
                continue;
            };

            let _lock = self.locks.acquire(ipam_lock(&subnet.network_id)).await;
            let mut tx = self.store.begin().await?;
            if tx.get_subnet(subnet.id).await?.is_none() {
                tx.rollback().await?;
                continue;
            }

            let allocated: Vec<IpAddr> = tx
                .allocations_for_update(subnet.id)
                .await?
                .into_iter()
                .map(|allocation| allocation.ip_address)
                .collect();

            let mut rewritten = 0usize;
            for pool in tx.pools_for_subnet(subnet.id).await? {
                let stored = tx.pool_ranges_for_update(pool.id).await?;
                let runs = free_runs(pool.first_ip, pool.last_ip, allocated.iter().copied());
                let unchanged = stored.len() == runs.len()
                    && stored
                        .iter()
                        .zip(&runs)
                        .all(|(range, run)| (range.first_ip, range.last_ip) == *run);
                if unchanged {
                    continue;
                }

                for range in stored {
                    tx.delete_range(range.id).await?;
                }
                for (first_ip, last_ip) in runs {
                    tx.insert_range(AvailabilityRange::new(pool.id, first_ip, last_ip))
                        .await?;
                }
                rewritten += 1;
            }
            tx.commit().await?;

            debug!(
                subnet_id = %subnet.id,
                allocations = allocated.len(),
                pools_rewritten = rewritten,
                "Rebuilt availability ranges"
            );
        }
        Ok(())
    }

    /// Free ranges of a subnet in ascending order.
    ///
    /// # Errors
    ///
    /// Returns store errors only.
    pub async fn available_ranges(&self, subnet_id: SubnetId) -> Result<Vec<AvailabilityRange>> {
        let mut tx = self.store.begin().await?;
        let ranges = tx.ranges_for_update(subnet_id).await?;
        tx.commit().await?;
        Ok(ranges)
    }

    /// Live allocations of a subnet.
    ///
    /// # Errors
    ///
    /// Returns store errors only.
    pub async fn allocations(&self, subnet_id: SubnetId) -> Result<Vec<IpAllocation>> {
        let mut tx = self.store.begin().await?;
        let allocations = tx.allocations_for_update(subnet_id).await?;
        tx.commit().await?;
        Ok(allocations)
    }

    /// Live allocations of a port.
    ///
    /// # Errors
    ///
    /// Returns store errors only.
    pub async fn port_allocations(&self, port_id: PortId) -> Result<Vec<IpAllocation>> {
        let mut tx = self.store.begin().await?;
        let allocations = tx.allocations_for_port(port_id).await?;
        tx.commit().await?;
        Ok(allocations)
    }

    pub(crate) async fn read_subnet(&self, subnet_id: SubnetId) -> Result<Option<Subnet>> {
        let mut tx = self.store.begin().await?;
        let subnet = tx.get_subnet(subnet_id).await?;
        tx.commit().await?;
        Ok(subnet)
    }
}

fn resolve_requests(
    network_id: NetworkId,
    subnets: &[Subnet],
    requests: &[FixedIpRequest],
) -> Result<Vec<(Subnet, Option<IpAddr>)>> {
    let mut seen = HashSet::new();
    let mut plan = Vec::with_capacity(requests.len());

    for request in requests {
        let subnet = match (request.subnet_id, request.ip_address) {
            (Some(subnet_id), _) => subnets
                .iter()
                .find(|subnet| subnet.id == subnet_id)
                .ok_or_else(|| {
                    Error::InvalidInput(format!(
                        "Subnet {subnet_id} does not belong to network {network_id}"
                    ))
                })?,
            (None, Some(address)) => subnets
                .iter()
                .find(|subnet| subnet.contains(address))
                .ok_or_else(|| {
                    Error::InvalidInput(format!(
                        "IP address {address} does not belong to any subnet of network {network_id}"
                    ))
                })?,
            (None, None) => {
                return Err(Error::InvalidInput(
                    "A fixed IP request needs a subnet, an address or both".into(),
                ))
            }
        };

        if let Some(address) = request.ip_address {
            if !subnet.is_valid_host_address(address) {
                return Err(Error::InvalidInput(format!(
                    "IP address {address} is not a valid host address of subnet {}",
                    subnet.cidr
                )));
            }
            if !seen.insert(address) {
                return Err(Error::InvalidInput(format!(
                    "Duplicate fixed IP {address} in request"
                )));
            }
        }
        plan.push((subnet.clone(), request.ip_address));
    }

    Ok(plan)
}

/// Take `address` out of `range`.
async fn apply_carve(
    tx: &mut dyn IpamTransaction,
    range: &AvailabilityRange,
    address: IpAddr,
) -> Result<()> {
    let carve = range.carve(address).ok_or_else(|| {
        Error::InternalError(format!("address {address} is not in range {}", range.id))
    })?;
    match carve {
        RangeCarve::Remove => tx.delete_range(range.id).await,
        RangeCarve::Shrink(shrunk) => tx.save_range(shrunk).await,
        RangeCarve::Split(head, tail) => {
            tx.save_range(head).await?;
            tx.insert_range(tail).await
        }
    }
}

/// Merge a released address back into its pool's ranges.
async fn reclaim_address(
    tx: &mut dyn IpamTransaction,
    subnet_id: SubnetId,
    address: IpAddr,
) -> Result<()> {
    let pools = tx.pools_for_subnet(subnet_id).await?;
    let Some(pool) = pools.into_iter().find(|pool| pool.contains(address)) else {
        return Ok(());
    };

    let ranges = tx.pool_ranges_for_update(pool.id).await?;
    if ranges.iter().any(|range| range.contains(address)) {
        return Ok(());
    }

    let before = ranges
        .iter()
        .find(|range| next_address(range.last_ip) == Some(address))
        .cloned();
    let after = ranges
        .iter()
        .find(|range| previous_address(range.first_ip) == Some(address))
        .cloned();

    match (before, after) {
        (Some(mut before), Some(after)) => {
            before.last_ip = after.last_ip;
            tx.save_range(before).await?;
            tx.delete_range(after.id).await
        }
        (Some(mut before), None) => {
            before.last_ip = address;
            tx.save_range(before).await
        }
        (None, Some(mut after)) => {
            after.first_ip = address;
            tx.save_range(after).await
        }
        (None, None) => {
            tx.insert_range(AvailabilityRange::new(pool.id, address, address))
                .await
        }
    }
}
