//! Mechanism drivers and the ordered registry that calls them.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use netplane_core::Error;
use tracing::{debug, error, warn};

use crate::models::{BindResult, PortContext, VifType};
use crate::Result;

/// Pluggable backend deciding how ports attach to the infrastructure.
///
/// `bind_port` is called outside every lock and may be slow. The commit hooks
/// run only for changes that were committed: `update_port_precommit` inside
/// the store transaction, where an error aborts the change, and
/// `update_port_postcommit` after it, where errors are only logged.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MechanismDriver: Send + Sync {
    /// Try to bind the port described by `context`.
    ///
    /// Returns `None` if the driver cannot bind the port on its host.
    async fn bind_port(&self, context: &PortContext) -> Result<Option<BindResult>>;

    /// Validate a committed change inside the transaction.
    async fn update_port_precommit(&self, _context: &PortContext) -> Result<()> {
        Ok(())
    }

    /// React to a committed change.
    async fn update_port_postcommit(&self, _context: &PortContext) -> Result<()> {
        Ok(())
    }
}

struct RegisteredDriver {
    name: String,
    driver: Arc<dyn MechanismDriver>,
}

/// Ordered set of named mechanism drivers.
#[derive(Default)]
pub struct MechanismManager {
    drivers: Vec<RegisteredDriver>,
}

impl fmt::Debug for MechanismManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MechanismManager")
            .field("drivers", &self.names())
            .finish()
    }
}

impl MechanismManager {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a driver. Drivers are tried in registration order.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a driver with the same name is registered.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        driver: Arc<dyn MechanismDriver>,
    ) -> Result<()> {
        let name = name.into();
        if self.drivers.iter().any(|registered| registered.name == name) {
            return Err(Error::ConfigError(format!(
                "Mechanism driver {name} is registered twice"
            )));
        }
        debug!(driver = %name, position = self.drivers.len(), "Registered mechanism driver");
        self.drivers.push(RegisteredDriver { name, driver });
        Ok(())
    }

    /// Builder form of [`MechanismManager::register`].
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a driver with the same name is registered.
    pub fn with_driver(
        mut self,
        name: impl Into<String>,
        driver: Arc<dyn MechanismDriver>,
    ) -> Result<Self> {
        self.register(name, driver)?;
        Ok(self)
    }

    /// Driver names in call order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.drivers.iter().map(|d| d.name.as_str()).collect()
    }

    /// Ask each driver in turn to bind the candidate in `context`.
    ///
    /// The first driver returning a result on one of the network's segments
    /// wins. Driver errors and results on unknown segments are logged and the
    /// next driver is tried. If nobody binds, the vif type becomes
    /// `BindingFailed`.
    pub async fn bind_port(&self, context: &mut PortContext) {
        let port_id = context.port.id;
        for registered in &self.drivers {
            match registered.driver.bind_port(context).await {
                Ok(Some(result)) => {
                    let on_network = context
                        .segments_to_bind()
                        .iter()
                        .any(|segment| segment.id == result.segment);
                    if !on_network {
                        warn!(
                            port_id = %port_id,
                            driver = %registered.name,
                            segment_id = %result.segment,
                            "Mechanism driver bound port to a segment outside its network"
                        );
                        continue;
                    }
                    debug!(
                        port_id = %port_id,
                        driver = %registered.name,
                        vif_type = %result.vif_type,
                        segment_id = %result.segment,
                        "Bound port"
                    );
                    context.set_binding(&registered.name, result);
                    return;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(
                        port_id = %port_id,
                        driver = %registered.name,
                        error = %err,
                        "Mechanism driver failed in bind_port"
                    );
                }
            }
        }

        context.binding.vif_type = VifType::BindingFailed;
        warn!(
            port_id = %port_id,
            host = context.host().unwrap_or_default(),
            vnic_type = ?context.binding.vnic_type,
            "Failed to bind port"
        );
    }

    /// Run every driver's precommit hook, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// Returns `MechanismDriver` naming the failing driver.
    pub async fn update_port_precommit(&self, context: &PortContext) -> Result<()> {
        for registered in &self.drivers {
            if let Err(err) = registered.driver.update_port_precommit(context).await {
                error!(
                    port_id = %context.port.id,
                    driver = %registered.name,
                    error = %err,
                    "Mechanism driver failed in update_port_precommit"
                );
                return Err(Error::MechanismDriver {
                    driver: registered.name.clone(),
                    method: "update_port_precommit".to_string(),
                    message: err.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Run every driver's postcommit hook. Failures are logged.
    pub async fn update_port_postcommit(&self, context: &PortContext) {
        for registered in &self.drivers {
            if let Err(err) = registered.driver.update_port_postcommit(context).await {
                error!(
                    port_id = %context.port.id,
                    driver = %registered.name,
                    error = %err,
                    "Mechanism driver failed in update_port_postcommit"
                );
            }
        }
    }
}
