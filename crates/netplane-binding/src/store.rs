//! Transactional storage seam for ports and their bindings.

use async_trait::async_trait;
use netplane_core::types::Port;
use netplane_core::uuid::{NetworkId, PortId};

use crate::models::PortBinding;
use crate::Result;

/// Source of port transactions.
#[async_trait]
pub trait PortStore: Send + Sync {
    /// Open a transaction. Dropping it without [`PortTransaction::commit`]
    /// rolls it back.
    async fn begin(&self) -> Result<Box<dyn PortTransaction>>;
}

/// One port transaction.
#[async_trait]
pub trait PortTransaction: Send {
    /// Lock and return a port.
    async fn get_port_for_update(&mut self, port_id: PortId) -> Result<Option<Port>>;

    /// Port of a network with the given MAC address.
    async fn find_port_by_mac(
        &mut self,
        network_id: NetworkId,
        mac_address: &str,
    ) -> Result<Option<Port>>;

    /// All ports of a network.
    async fn ports_for_network(&mut self, network_id: NetworkId) -> Result<Vec<Port>>;

    /// Insert or update a port.
    async fn save_port(&mut self, port: Port) -> Result<()>;

    /// Delete a port with all of its bindings. Returns false if it did not
    /// exist.
    async fn delete_port(&mut self, port_id: PortId) -> Result<bool>;

    /// Lock and return the primary binding of a port.
    async fn get_binding_for_update(&mut self, port_id: PortId) -> Result<Option<PortBinding>>;

    /// Insert or update the primary binding of a port.
    async fn save_binding(&mut self, binding: PortBinding) -> Result<()>;

    /// Lock and return the binding of a distributed port on one host.
    async fn get_distributed_binding_for_update(
        &mut self,
        port_id: PortId,
        host: &str,
    ) -> Result<Option<PortBinding>>;

    /// Insert or update a per-host binding, keyed by port and host.
    async fn save_distributed_binding(&mut self, binding: PortBinding) -> Result<()>;

    /// Per-host bindings of a distributed port, ordered by host.
    async fn distributed_bindings(&mut self, port_id: PortId) -> Result<Vec<PortBinding>>;

    /// Make all changes durable and release the row locks.
    async fn commit(&mut self) -> Result<()>;

    /// Discard all changes and release the row locks.
    async fn rollback(&mut self) -> Result<()>;
}
