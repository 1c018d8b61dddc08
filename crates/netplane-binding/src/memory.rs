//! In-memory [`PortStore`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use netplane_core::types::Port;
use netplane_core::uuid::{NetworkId, PortId};
use netplane_core::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

use crate::models::PortBinding;
use crate::store::{PortStore, PortTransaction};
use crate::Result;

#[derive(Debug, Clone, Default)]
struct PortTables {
    ports: BTreeMap<PortId, Port>,
    bindings: BTreeMap<PortId, PortBinding>,
    distributed: BTreeMap<(PortId, String), PortBinding>,
}

impl PortTables {
    fn require_port(&self, port_id: PortId) -> Result<()> {
        if self.ports.contains_key(&port_id) {
            Ok(())
        } else {
            Err(Error::StoreError(format!(
                "binding references missing port {port_id}"
            )))
        }
    }
}

/// Port store kept in process memory.
///
/// Transactions are serialized on one table lock and undone from a snapshot
/// unless committed.
#[derive(Debug, Clone, Default)]
pub struct MemoryPortStore {
    tables: Arc<Mutex<PortTables>>,
}

impl MemoryPortStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PortStore for MemoryPortStore {
    async fn begin(&self) -> Result<Box<dyn PortTransaction>> {
        let guard = Arc::clone(&self.tables).lock_owned().await;
        let snapshot = guard.clone();
        Ok(Box::new(MemoryPortTransaction {
            guard: Some(guard),
            snapshot,
        }))
    }
}

struct MemoryPortTransaction {
    guard: Option<OwnedMutexGuard<PortTables>>,
    snapshot: PortTables,
}

impl MemoryPortTransaction {
    fn tables(&mut self) -> Result<&mut PortTables> {
        self.guard
            .as_deref_mut()
            .ok_or_else(|| Error::StoreError("transaction is already closed".to_string()))
    }

    fn close(&mut self) -> Result<OwnedMutexGuard<PortTables>> {
        self.guard
            .take()
            .ok_or_else(|| Error::StoreError("transaction is already closed".to_string()))
    }
}

impl Drop for MemoryPortTransaction {
    fn drop(&mut self) {
        if let Some(mut guard) = self.guard.take() {
            *guard = std::mem::take(&mut self.snapshot);
            trace!("rolled back abandoned port transaction");
        }
    }
}

#[async_trait]
impl PortTransaction for MemoryPortTransaction {
    async fn get_port_for_update(&mut self, port_id: PortId) -> Result<Option<Port>> {
        Ok(self.tables()?.ports.get(&port_id).cloned())
    }

    async fn find_port_by_mac(
        &mut self,
        network_id: NetworkId,
        mac_address: &str,
    ) -> Result<Option<Port>> {
        Ok(self
            .tables()?
            .ports
            .values()
            .find(|port| {
                port.network_id == network_id && port.mac_address.eq_ignore_ascii_case(mac_address)
            })
            .cloned())
    }

    async fn ports_for_network(&mut self, network_id: NetworkId) -> Result<Vec<Port>> {
        Ok(self
            .tables()?
            .ports
            .values()
            .filter(|port| port.network_id == network_id)
            .cloned()
            .collect())
    }

    async fn save_port(&mut self, port: Port) -> Result<()> {
        self.tables()?.ports.insert(port.id, port);
        Ok(())
    }

    async fn delete_port(&mut self, port_id: PortId) -> Result<bool> {
        let tables = self.tables()?;
        tables.bindings.remove(&port_id);
        tables.distributed.retain(|(port, _), _| *port != port_id);
        Ok(tables.ports.remove(&port_id).is_some())
    }

    async fn get_binding_for_update(&mut self, port_id: PortId) -> Result<Option<PortBinding>> {
        Ok(self.tables()?.bindings.get(&port_id).cloned())
    }

    async fn save_binding(&mut self, binding: PortBinding) -> Result<()> {
        let tables = self.tables()?;
        tables.require_port(binding.port_id)?;
        tables.bindings.insert(binding.port_id, binding);
        Ok(())
    }

    async fn get_distributed_binding_for_update(
        &mut self,
        port_id: PortId,
        host: &str,
    ) -> Result<Option<PortBinding>> {
        Ok(self
            .tables()?
            .distributed
            .get(&(port_id, host.to_string()))
            .cloned())
    }

    async fn save_distributed_binding(&mut self, binding: PortBinding) -> Result<()> {
        let tables = self.tables()?;
        tables.require_port(binding.port_id)?;
        let host = binding
            .host
            .clone()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| Error::InvalidInput("Distributed binding requires a host".into()))?;
        tables.distributed.insert((binding.port_id, host), binding);
        Ok(())
    }

    async fn distributed_bindings(&mut self, port_id: PortId) -> Result<Vec<PortBinding>> {
        Ok(self
            .tables()?
            .distributed
            .iter()
            .filter(|((port, _), _)| *port == port_id)
            .map(|(_, binding)| binding.clone())
            .collect())
    }

    async fn commit(&mut self) -> Result<()> {
        drop(self.close()?);
        self.snapshot = PortTables::default();
        trace!("committed port transaction");
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        let mut guard = self.close()?;
        *guard = std::mem::take(&mut self.snapshot);
        trace!("rolled back port transaction");
        Ok(())
    }
}
