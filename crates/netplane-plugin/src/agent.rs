//! Operations invoked on behalf of host agents.

use netplane_binding::{PortBinding, PortContext};
use netplane_core::lock::port_lock;
use netplane_core::types::PortStatus;
use netplane_core::uuid::PortId;
use netplane_core::Error;
use tracing::{debug, info};

use crate::plugin::CorePlugin;
use crate::Result;

impl CorePlugin {
    /// Context of a port as seen by the agent on `host`, bound first if
    /// needed.
    ///
    /// Returns `None` if the port does not exist, if it is bound to another
    /// host, or if it is distributed and has no binding on `host`.
    ///
    /// # Errors
    ///
    /// Returns store errors and precommit hook failures.
    pub async fn bound_port_context(
        &self,
        port_id: PortId,
        host: &str,
    ) -> Result<Option<PortContext>> {
        let Some(port) = self.find_port(port_id).await? else {
            debug!(port_id = %port_id, host, "Port requested by agent does not exist");
            return Ok(None);
        };
        let network = self.get_network(port.network_id).await?;
        let Some(context) = self
            .binder
            .load_context(&network, port_id, Some(host))
            .await?
        else {
            debug!(port_id = %port_id, host, "Port has no binding for host");
            return Ok(None);
        };

        if context.host() != Some(host) {
            debug!(
                port_id = %port_id,
                host,
                bound_host = context.host().unwrap_or_default(),
                "Port requested by agent is bound to another host"
            );
            return Ok(None);
        }

        let context = self.binder.bind_port_if_needed(context, true, false).await?;
        Ok(Some(context))
    }

    /// Create or refresh the binding of a distributed port on `host` and
    /// bind it.
    ///
    /// A new per-host row takes vnic type and profile from the port's primary
    /// binding. An existing row whose inputs no longer match is reset.
    /// Returns `None` if the port was deleted.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for an empty host or a port that is not
    /// distributed, plus store errors and precommit hook failures.
    pub async fn update_distributed_port_binding(
        &self,
        port_id: PortId,
        host: &str,
    ) -> Result<Option<PortContext>> {
        if host.is_empty() {
            return Err(Error::InvalidInput(
                "Distributed binding requires a host".to_string(),
            ));
        }
        let Some(port) = self.find_port(port_id).await? else {
            return Ok(None);
        };
        if !port.is_distributed() {
            return Err(Error::InvalidInput(format!(
                "Port {port_id} is not a distributed port"
            )));
        }
        let network = self.get_network(port.network_id).await?;

        let lock = self.locks.acquire(port_lock(&port_id)).await;
        let mut tx = self.port_store.begin().await?;
        let Some(port) = tx.get_port_for_update(port_id).await? else {
            tx.rollback().await?;
            return Ok(None);
        };
        let Some(primary) = tx.get_binding_for_update(port_id).await? else {
            tx.rollback().await?;
            return Ok(None);
        };

        let binding = match tx.get_distributed_binding_for_update(port_id, host).await? {
            Some(row) if row.vnic_type == primary.vnic_type && row.profile == primary.profile => {
                row
            }
            Some(mut row) => {
                row.vnic_type = primary.vnic_type;
                row.profile = primary.profile;
                row.reset();
                tx.save_distributed_binding(row.clone()).await?;
                debug!(port_id = %port_id, host, "Reset stale distributed binding");
                row
            }
            None => {
                let row = PortBinding::unbound(port_id)
                    .with_host(host)
                    .with_vnic_type(primary.vnic_type)
                    .with_profile(primary.profile);
                tx.save_distributed_binding(row.clone()).await?;
                debug!(port_id = %port_id, host, "Created distributed binding");
                row
            }
        };
        tx.commit().await?;
        drop(lock);

        let context = PortContext::new(port, network, binding);
        let context = self.binder.bind_port_if_needed(context, true, false).await?;
        Ok(Some(context))
    }

    /// Record the status an agent reports for a port.
    ///
    /// Returns false if the port does not exist or already has `status`.
    ///
    /// # Errors
    ///
    /// Returns store errors and precommit hook failures.
    pub async fn update_port_status(&self, port_id: PortId, status: PortStatus) -> Result<bool> {
        let Some(port) = self.find_port(port_id).await? else {
            return Ok(false);
        };
        let network = self.get_network(port.network_id).await?;

        let lock = self.locks.acquire(port_lock(&port_id)).await;
        let mut tx = self.port_store.begin().await?;
        let Some(mut port) = tx.get_port_for_update(port_id).await? else {
            tx.rollback().await?;
            return Ok(false);
        };
        if port.status == status {
            tx.rollback().await?;
            return Ok(false);
        }
        let binding = tx
            .get_binding_for_update(port_id)
            .await?
            .unwrap_or_else(|| PortBinding::unbound(port_id));

        let original = port.clone();
        port.status = status;
        port.touch();
        tx.save_port(port.clone()).await?;

        let context =
            PortContext::new(port, network, binding.clone()).with_original(original, binding);
        if let Err(err) = self.binder.drivers().update_port_precommit(&context).await {
            tx.rollback().await?;
            return Err(err);
        }
        tx.commit().await?;
        drop(lock);
        self.binder.drivers().update_port_postcommit(&context).await;

        info!(
            port_id = %port_id,
            status = %status,
            "Updated port status"
        );
        Ok(true)
    }
}
