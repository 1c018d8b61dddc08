//! Network, subnet and port operations.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use netplane_binding::{
    MechanismManager, PortBinder, PortBinding, PortContext, PortNotifier, PortStore,
    PortTransaction, VifType,
};
use netplane_core::config::ControlPlaneConfig;
use netplane_core::lock::{port_lock, LockManager};
use netplane_core::types::{Network, Port, PortStatus, DEVICE_OWNER_DISTRIBUTED_ROUTER};
use netplane_core::uuid::{NetworkId, PortId, SubnetId};
use netplane_core::Error;
use netplane_ipam::{
    AllocatedIp, CreateSubnetRequest, FixedIpRequest, IpAllocation, IpamAllocator, IpamStore,
    Subnet, SubnetDetails,
};
use tracing::{debug, info, warn};
use validator::Validate;

use crate::mac::{normalize_mac, MacGenerator};
use crate::models::{CreateNetworkRequest, CreatePortRequest, PortDetails, UpdatePortRequest};
use crate::Result;

/// Composes IPAM, port storage and binding into the control-plane API.
///
/// Networks, subnets, pools and allocations live in the [`IpamStore`]; ports
/// and bindings live in the [`PortStore`]. No operation keeps a transaction
/// of one store open while it works on the other.
#[derive(Clone)]
pub struct CorePlugin {
    pub(crate) ipam_store: Arc<dyn IpamStore>,
    pub(crate) port_store: Arc<dyn PortStore>,
    pub(crate) allocator: IpamAllocator,
    pub(crate) binder: PortBinder,
    pub(crate) locks: Arc<LockManager>,
    macs: MacGenerator,
    config: ControlPlaneConfig,
}

impl fmt::Debug for CorePlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorePlugin")
            .field("allocator", &self.allocator)
            .field("binder", &self.binder)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CorePlugin {
    /// Create a plugin from its stores, driver registry and notifier.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` or `ValidationError` for an invalid
    /// configuration.
    pub fn new(
        config: ControlPlaneConfig,
        ipam_store: Arc<dyn IpamStore>,
        port_store: Arc<dyn PortStore>,
        drivers: MechanismManager,
        notifier: Arc<dyn PortNotifier>,
    ) -> Result<Self> {
        let config = config.validated()?;
        let locks = Arc::new(LockManager::new());
        let allocator =
            IpamAllocator::from_config(Arc::clone(&ipam_store), Arc::clone(&locks), &config);
        let binder = PortBinder::from_config(
            Arc::clone(&port_store),
            Arc::new(drivers),
            notifier,
            Arc::clone(&locks),
            &config,
        );
        let macs = MacGenerator::from_config(&config)?;

        info!(
            drivers = ?binder.drivers().names(),
            reclaim_on_release = config.ipam.reclaim_on_release,
            "Core plugin initialized"
        );
        Ok(Self {
            ipam_store,
            port_store,
            allocator,
            binder,
            locks,
            macs,
            config,
        })
    }

    /// The address allocator.
    #[must_use]
    pub const fn allocator(&self) -> &IpamAllocator {
        &self.allocator
    }

    /// The port binder.
    #[must_use]
    pub const fn binder(&self) -> &PortBinder {
        &self.binder
    }

    /// The effective configuration.
    #[must_use]
    pub const fn config(&self) -> &ControlPlaneConfig {
        &self.config
    }

    /// Create a network.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` for a malformed request.
    pub async fn create_network(&self, request: CreateNetworkRequest) -> Result<Network> {
        request.validate()?;
        let network = Network {
            id: NetworkId::new_v4(),
            name: request.name,
            admin_state_up: request.admin_state_up,
            shared: request.shared,
            segments: request.segments,
        };

        let mut tx = self.ipam_store.begin().await?;
        tx.insert_network(network.clone()).await?;
        tx.commit().await?;

        info!(
            network_id = %network.id,
            segments = network.segments.len(),
            "Created network"
        );
        Ok(network)
    }

    /// Fetch a network.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown network.
    pub async fn get_network(&self, network_id: NetworkId) -> Result<Network> {
        let mut tx = self.ipam_store.begin().await?;
        let network = tx.get_network(network_id).await?;
        tx.commit().await?;
        network.ok_or_else(|| Error::NotFound(format!("Network {network_id}")))
    }

    /// Delete a network and its subnets.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown network and `InUse` while it has
    /// ports.
    pub async fn delete_network(&self, network_id: NetworkId) -> Result<()> {
        self.get_network(network_id).await?;

        let ports = self.list_ports(network_id).await?;
        if !ports.is_empty() {
            return Err(Error::InUse(format!(
                "Network {network_id} has {} ports",
                ports.len()
            )));
        }

        for subnet in self.allocator.subnets_for_network(network_id).await? {
            self.allocator.delete_subnet(subnet.id).await?;
        }

        let mut tx = self.ipam_store.begin().await?;
        if !tx.delete_network(network_id).await? {
            tx.rollback().await?;
            return Err(Error::NotFound(format!("Network {network_id}")));
        }
        tx.commit().await?;

        info!(network_id = %network_id, "Deleted network");
        Ok(())
    }

    /// Create a subnet with its pools.
    ///
    /// # Errors
    ///
    /// See [`IpamAllocator::create_subnet`].
    pub async fn create_subnet(&self, request: CreateSubnetRequest) -> Result<SubnetDetails> {
        self.allocator.create_subnet(request).await
    }

    /// Fetch a subnet.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown subnet.
    pub async fn get_subnet(&self, subnet_id: SubnetId) -> Result<Subnet> {
        self.allocator.get_subnet(subnet_id).await
    }

    /// Delete a subnet.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown subnet and `InUse` while addresses of
    /// the subnet are allocated.
    pub async fn delete_subnet(&self, subnet_id: SubnetId) -> Result<()> {
        self.allocator.delete_subnet(subnet_id).await
    }

    /// Create a port, allocate its addresses and bind it if a host is given.
    ///
    /// Without `fixed_ips` the port gets one address per IP family of the
    /// network; an explicit empty list allocates nothing. The port is
    /// removed again if address allocation or binding fails.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown network, `InvalidInput` for a bad
    /// MAC, fixed IP request or a host on a distributed port,
    /// `MacAddressInUse`, `MacAddressGenerationFailure`, allocation errors
    /// and precommit hook failures.
    pub async fn create_port(&self, request: CreatePortRequest) -> Result<PortDetails> {
        request.validate()?;
        let network = self.get_network(request.network_id).await?;

        let now = Utc::now();
        let mut port = Port {
            id: PortId::new_v4(),
            network_id: network.id,
            mac_address: String::new(),
            device_owner: request.device_owner,
            device_id: request.device_id,
            admin_state_up: request.admin_state_up,
            status: PortStatus::Down,
            created_at: now,
            updated_at: now,
        };

        let mut binding = PortBinding::unbound(port.id)
            .with_vnic_type(request.vnic_type)
            .with_profile(request.profile);
        if port.is_distributed() {
            if request.host.is_some() {
                return Err(Error::InvalidInput(
                    "Distributed ports are bound per host, not through the host attribute"
                        .to_string(),
                ));
            }
            binding.vif_type = VifType::Distributed;
        } else {
            binding.host = request.host.filter(|host| !host.is_empty());
        }

        self.insert_port(&mut port, &binding, request.mac_address.as_deref())
            .await?;

        let fixed_ips = match request.fixed_ips {
            Some(requests) if requests.is_empty() => Vec::new(),
            requests => {
                let requests = requests.unwrap_or_default();
                match self
                    .allocator
                    .allocate_ips_for_port(port.id, network.id, &requests)
                    .await
                {
                    Ok(fixed_ips) => fixed_ips,
                    Err(err) => {
                        warn!(
                            port_id = %port.id,
                            error = %err,
                            "Removing port after failed address allocation"
                        );
                        self.remove_port_row(port.id).await?;
                        return Err(err);
                    }
                }
            }
        };

        info!(
            port_id = %port.id,
            network_id = %network.id,
            mac_address = %port.mac_address,
            fixed_ips = fixed_ips.len(),
            "Created port"
        );

        let port_id = port.id;
        let network_id = network.id;
        let context = PortContext::new(port, network, binding);
        let context = match self.binder.bind_port_if_needed(context, false, false).await {
            Ok(context) => context,
            Err(err) => {
                warn!(
                    port_id = %port_id,
                    error = %err,
                    "Removing port after failed binding"
                );
                self.remove_port_row(port_id).await?;
                self.allocator.rollback_ips(network_id, &fixed_ips).await?;
                return Err(err);
            }
        };
        Ok(PortDetails {
            port: context.port,
            binding: context.binding,
            fixed_ips,
        })
    }

    /// Fetch a port with its primary binding and addresses.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown port.
    pub async fn get_port(&self, port_id: PortId) -> Result<PortDetails> {
        let mut tx = self.port_store.begin().await?;
        let Some(port) = tx.get_port_for_update(port_id).await? else {
            tx.rollback().await?;
            return Err(Error::NotFound(format!("Port {port_id}")));
        };
        let binding = tx
            .get_binding_for_update(port_id)
            .await?
            .unwrap_or_else(|| PortBinding::unbound(port_id));
        tx.commit().await?;

        let fixed_ips = self.port_fixed_ips(port_id).await?;
        Ok(PortDetails {
            port,
            binding,
            fixed_ips,
        })
    }

    /// Ports of a network.
    ///
    /// # Errors
    ///
    /// Returns store errors only.
    pub async fn list_ports(&self, network_id: NetworkId) -> Result<Vec<Port>> {
        let mut tx = self.port_store.begin().await?;
        let ports = tx.ports_for_network(network_id).await?;
        tx.commit().await?;
        Ok(ports)
    }

    /// Update a port.
    ///
    /// Replacement fixed IPs are diffed against the current allocations: new
    /// addresses are allocated before the port is saved and removed ones are
    /// released once the port update has committed. If the update fails, the
    /// new addresses are returned and the port keeps its old ones. A change
    /// of host, vnic type or profile resets the binding to unbound, after
    /// which the port is bound again and agents are notified.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown port, `InvalidInput` for invalid
    /// changes, allocation errors and precommit hook failures.
    pub async fn update_port(
        &self,
        port_id: PortId,
        request: UpdatePortRequest,
    ) -> Result<PortDetails> {
        request.validate()?;
        let current = self
            .find_port(port_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Port {port_id}")))?;
        check_owner_change(&current, &request)?;
        let network = self.get_network(current.network_id).await?;

        let changes = match &request.fixed_ips {
            Some(requests) => self.stage_fixed_ips(&current, requests).await?,
            None => FixedIpChanges::default(),
        };

        let (context, changed) = match self.save_port_update(port_id, network, &request).await {
            Ok(Some(saved)) => saved,
            Ok(None) => {
                // Deleted meanwhile; anything allocated above is orphaned.
                self.allocator.release_port_ips(port_id).await?;
                return Err(Error::NotFound(format!("Port {port_id}")));
            }
            Err(err) => {
                if !changes.added.is_empty() {
                    warn!(
                        port_id = %port_id,
                        added = changes.added.len(),
                        error = %err,
                        "Port update failed, returning new fixed IPs"
                    );
                    self.allocator
                        .rollback_ips(current.network_id, &changes.added)
                        .await?;
                }
                return Err(err);
            }
        };

        for allocation in &changes.removed {
            self.allocator
                .release_ip(allocation.network_id, allocation.subnet_id, allocation.ip_address)
                .await?;
        }
        let need_notify = changed || changes.is_changed();

        let context = self
            .binder
            .bind_port_if_needed(context, true, need_notify)
            .await?;
        let fixed_ips = self.port_fixed_ips(port_id).await?;
        Ok(PortDetails {
            port: context.port,
            binding: context.binding,
            fixed_ips,
        })
    }

    /// Delete a port, release its addresses and notify agents.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown port.
    pub async fn delete_port(&self, port_id: PortId) -> Result<()> {
        if !self.remove_port_row(port_id).await? {
            return Err(Error::NotFound(format!("Port {port_id}")));
        }
        let released = self.allocator.release_port_ips(port_id).await?;
        self.binder.notifier().port_delete(port_id);

        info!(port_id = %port_id, released = released.len(), "Deleted port");
        Ok(())
    }

    pub(crate) async fn find_port(&self, port_id: PortId) -> Result<Option<Port>> {
        let mut tx = self.port_store.begin().await?;
        let port = tx.get_port_for_update(port_id).await?;
        tx.commit().await?;
        Ok(port)
    }

    async fn port_fixed_ips(&self, port_id: PortId) -> Result<Vec<AllocatedIp>> {
        Ok(self
            .allocator
            .port_allocations(port_id)
            .await?
            .iter()
            .map(AllocatedIp::from)
            .collect())
    }

    async fn insert_port(
        &self,
        port: &mut Port,
        binding: &PortBinding,
        requested_mac: Option<&str>,
    ) -> Result<()> {
        let mut tx = self.port_store.begin().await?;
        let mac_address = match requested_mac {
            Some(mac) => {
                let mac = normalize_mac(mac)?;
                if tx.find_port_by_mac(port.network_id, &mac).await?.is_some() {
                    tx.rollback().await?;
                    return Err(Error::MacAddressInUse {
                        network_id: port.network_id,
                        mac_address: mac,
                    });
                }
                mac
            }
            None => self.unique_mac(tx.as_mut(), port.network_id).await?,
        };
        port.mac_address = mac_address;

        tx.save_port(port.clone()).await?;
        tx.save_binding(binding.clone()).await?;
        tx.commit().await
    }

    async fn unique_mac(
        &self,
        tx: &mut dyn PortTransaction,
        network_id: NetworkId,
    ) -> Result<String> {
        for attempt in 1..=self.macs.retries() {
            let mac = self.macs.generate();
            if tx.find_port_by_mac(network_id, &mac).await?.is_none() {
                return Ok(mac);
            }
            debug!(
                network_id = %network_id,
                mac_address = %mac,
                attempt,
                "Generated MAC address already in use"
            );
        }
        warn!(
            network_id = %network_id,
            retries = self.macs.retries(),
            "Unable to generate a unique MAC address"
        );
        Err(Error::MacAddressGenerationFailure { network_id })
    }

    async fn remove_port_row(&self, port_id: PortId) -> Result<bool> {
        let _lock = self.locks.acquire(port_lock(&port_id)).await;
        let mut tx = self.port_store.begin().await?;
        if !tx.delete_port(port_id).await? {
            tx.rollback().await?;
            return Ok(false);
        }
        tx.commit().await?;
        Ok(true)
    }

    /// Apply the port, owner and binding input changes of `request` under
    /// the port lock.
    ///
    /// Returns the saved context and whether the port or its binding changed,
    /// or `None` if the port no longer exists. Nothing is written if the
    /// precommit hooks reject the update.
    async fn save_port_update(
        &self,
        port_id: PortId,
        network: Network,
        request: &UpdatePortRequest,
    ) -> Result<Option<(PortContext, bool)>> {
        let lock = self.locks.acquire(port_lock(&port_id)).await;
        let mut tx = self.port_store.begin().await?;
        let Some(mut port) = tx.get_port_for_update(port_id).await? else {
            tx.rollback().await?;
            return Ok(None);
        };
        let Some(mut binding) = tx.get_binding_for_update(port_id).await? else {
            tx.rollback().await?;
            return Err(Error::StoreError(format!("Port {port_id} has no binding")));
        };
        let original_port = port.clone();
        let original_binding = binding.clone();

        if let Some(admin_state_up) = request.admin_state_up {
            port.admin_state_up = admin_state_up;
        }
        if let Some(device_owner) = &request.device_owner {
            port.device_owner.clone_from(device_owner);
        }
        if let Some(device_id) = &request.device_id {
            port.device_id.clone_from(device_id);
        }

        let binding_changed = apply_binding_inputs(&mut binding, request);
        if binding_changed && port.is_distributed() {
            reset_distributed_bindings(tx.as_mut(), &binding).await?;
        }

        let port_changed = port != original_port;
        if port_changed {
            port.touch();
            tx.save_port(port.clone()).await?;
        }
        if binding_changed {
            tx.save_binding(binding.clone()).await?;
        }

        let context =
            PortContext::new(port, network, binding).with_original(original_port, original_binding);
        if let Err(err) = self.binder.drivers().update_port_precommit(&context).await {
            tx.rollback().await?;
            return Err(err);
        }
        tx.commit().await?;
        drop(lock);
        self.binder.drivers().update_port_postcommit(&context).await;

        debug!(
            port_id = %port_id,
            port_changed,
            binding_changed,
            "Updated port"
        );
        Ok(Some((context, port_changed || binding_changed)))
    }

    /// Allocate the addresses `requests` adds to the port and work out which
    /// current allocations it drops. Dropped addresses stay allocated until
    /// the caller releases them.
    async fn stage_fixed_ips(
        &self,
        port: &Port,
        requests: &[FixedIpRequest],
    ) -> Result<FixedIpChanges> {
        let max = self.config.max_fixed_ips_per_port;
        if requests.len() > max {
            return Err(Error::InvalidInput(format!(
                "Exceeded maximum of {max} fixed IPs per port"
            )));
        }

        let current = self.allocator.port_allocations(port.id).await?;
        let mut keep = vec![false; current.len()];
        let mut wanted = Vec::new();
        for request in requests {
            let existing = request.ip_address.and_then(|address| {
                current.iter().position(|allocation| {
                    allocation.ip_address == address
                        && request
                            .subnet_id
                            .map_or(true, |subnet_id| subnet_id == allocation.subnet_id)
                })
            });
            match existing {
                Some(index) if keep[index] => {
                    return Err(Error::InvalidInput(format!(
                        "Duplicate fixed IP {}",
                        current[index].ip_address
                    )));
                }
                Some(index) => keep[index] = true,
                None => wanted.push(*request),
            }
        }

        let added = if wanted.is_empty() {
            Vec::new()
        } else {
            self.allocator
                .allocate_ips_for_port(port.id, port.network_id, &wanted)
                .await?
        };
        let removed: Vec<IpAllocation> = current
            .into_iter()
            .zip(keep)
            .filter_map(|(allocation, keep)| (!keep).then_some(allocation))
            .collect();

        debug!(
            port_id = %port.id,
            added = added.len(),
            removed = removed.len(),
            "Staged fixed IP changes"
        );
        Ok(FixedIpChanges { added, removed })
    }
}

/// Fixed IP changes of a port update that has not committed yet.
#[derive(Debug, Default)]
struct FixedIpChanges {
    added: Vec<AllocatedIp>,
    removed: Vec<IpAllocation>,
}

impl FixedIpChanges {
    fn is_changed(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }
}

fn check_owner_change(port: &Port, request: &UpdatePortRequest) -> Result<()> {
    let owner = request.device_owner.as_deref().unwrap_or(&port.device_owner);
    let distributed = owner == DEVICE_OWNER_DISTRIBUTED_ROUTER;
    if distributed != port.is_distributed() {
        return Err(Error::InvalidInput(format!(
            "Port {} cannot change device owner to or from {DEVICE_OWNER_DISTRIBUTED_ROUTER}",
            port.id
        )));
    }
    if distributed && request.host.is_some() {
        return Err(Error::InvalidInput(
            "Distributed ports are bound per host, not through the host attribute".to_string(),
        ));
    }
    Ok(())
}

/// Apply requested host, vnic type and profile. Returns true if any of them
/// changed, in which case a non-distributed binding is reset to unbound.
fn apply_binding_inputs(binding: &mut PortBinding, request: &UpdatePortRequest) -> bool {
    if !request.changes_binding() {
        return false;
    }
    let original = binding.clone();
    if let Some(host) = &request.host {
        binding.host = Some(host.clone()).filter(|host| !host.is_empty());
    }
    if let Some(vnic_type) = request.vnic_type {
        binding.vnic_type = vnic_type;
    }
    if let Some(profile) = &request.profile {
        binding.profile.clone_from(profile);
    }

    if binding.same_inputs(&original) {
        return false;
    }
    if binding.vif_type != VifType::Distributed {
        binding.reset();
    }
    true
}

async fn reset_distributed_bindings(
    tx: &mut dyn PortTransaction,
    primary: &PortBinding,
) -> Result<()> {
    for mut row in tx.distributed_bindings(primary.port_id).await? {
        if row.vnic_type == primary.vnic_type && row.profile == primary.profile {
            continue;
        }
        row.vnic_type = primary.vnic_type;
        row.profile.clone_from(&primary.profile);
        row.reset();
        tx.save_distributed_binding(row).await?;
    }
    Ok(())
}
