//! Subnet lifecycle on top of the allocator.

use netplane_core::lock::ipam_lock;
use netplane_core::uuid::{NetworkId, SubnetId};
use netplane_core::Error;
use tracing::info;
use validator::Validate;

use crate::allocator::IpamAllocator;
use crate::models::{AddressPool, AvailabilityRange, CreateSubnetRequest, Subnet, SubnetDetails};
use crate::pools;
use crate::Result;

impl IpamAllocator {
    /// Create a subnet with its pools and one initial availability range per
    /// pool.
    ///
    /// Explicit pools are validated against the CIDR and gateway; without
    /// them the host range is split around the gateway.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for an invalid CIDR, gateway or pool or a CIDR
    /// overlapping another subnet of the network, `ValidationError` for a
    /// malformed request and `NotFound` if the network does not exist.
    pub async fn create_subnet(&self, request: CreateSubnetRequest) -> Result<SubnetDetails> {
        request.validate()?;

        let cidr = pools::parse_cidr(&request.cidr, request.ip_version)?;
        let gateway_ip = pools::resolve_gateway(&cidr, &request.gateway_ip)?;
        let bounds = match &request.allocation_pools {
            Some(specs) => pools::validate_pools(&cidr, gateway_ip, specs)?,
            None => pools::derive_pools(&cidr, gateway_ip),
        };

        let _lock = self.locks.acquire(ipam_lock(&request.network_id)).await;
        let mut tx = self.store.begin().await?;

        if tx.get_network(request.network_id).await?.is_none() {
            return Err(Error::NotFound(format!("Network {}", request.network_id)));
        }
        for existing in tx.subnets_for_network(request.network_id).await? {
            if existing.cidr.contains(cidr.network()) || cidr.contains(existing.cidr.network()) {
                return Err(Error::InvalidInput(format!(
                    "CIDR {cidr} overlaps subnet {} ({})",
                    existing.id, existing.cidr
                )));
            }
        }

        let subnet = Subnet {
            id: SubnetId::new_v4(),
            network_id: request.network_id,
            cidr,
            ip_version: request.ip_version,
            gateway_ip,
            enable_dhcp: request.enable_dhcp,
        };
        tx.insert_subnet(subnet.clone()).await?;

        let mut pools = Vec::with_capacity(bounds.len());
        for (first_ip, last_ip) in bounds {
            let pool = AddressPool::new(subnet.id, first_ip, last_ip);
            tx.insert_pool(pool.clone()).await?;
            tx.insert_range(AvailabilityRange::new(pool.id, first_ip, last_ip))
                .await?;
            pools.push(pool);
        }
        tx.commit().await?;

        info!(
            subnet_id = %subnet.id,
            network_id = %subnet.network_id,
            cidr = %subnet.cidr,
            pools = pools.len(),
            "Created subnet"
        );
        Ok(SubnetDetails { subnet, pools })
    }

    /// Delete a subnet with its pools and ranges.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown subnet and `InUse` while addresses of
    /// the subnet are allocated.
    pub async fn delete_subnet(&self, subnet_id: SubnetId) -> Result<()> {
        let subnet = self.get_subnet(subnet_id).await?;

        let _lock = self.locks.acquire(ipam_lock(&subnet.network_id)).await;
        let mut tx = self.store.begin().await?;
        if tx.get_subnet(subnet_id).await?.is_none() {
            return Err(Error::NotFound(format!("Subnet {subnet_id}")));
        }
        let allocations = tx.allocations_for_update(subnet_id).await?;
        if !allocations.is_empty() {
            return Err(Error::InUse(format!(
                "Subnet {subnet_id} has {} allocated addresses",
                allocations.len()
            )));
        }
        tx.delete_subnet(subnet_id).await?;
        tx.commit().await?;

        info!(subnet_id = %subnet_id, network_id = %subnet.network_id, "Deleted subnet");
        Ok(())
    }

    /// Fetch a subnet.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown subnet.
    pub async fn get_subnet(&self, subnet_id: SubnetId) -> Result<Subnet> {
        self.read_subnet(subnet_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Subnet {subnet_id}")))
    }

    /// Pools of a subnet in ascending order.
    ///
    /// # Errors
    ///
    /// Returns store errors only.
    pub async fn subnet_pools(&self, subnet_id: SubnetId) -> Result<Vec<AddressPool>> {
        let mut tx = self.store.begin().await?;
        let pools = tx.pools_for_subnet(subnet_id).await?;
        tx.commit().await?;
        Ok(pools)
    }

    /// Subnets of a network, IPv4 first.
    ///
    /// # Errors
    ///
    /// Returns store errors only.
    pub async fn subnets_for_network(&self, network_id: NetworkId) -> Result<Vec<Subnet>> {
        let mut tx = self.store.begin().await?;
        let subnets = tx.subnets_for_network(network_id).await?;
        tx.commit().await?;
        Ok(subnets)
    }
}
