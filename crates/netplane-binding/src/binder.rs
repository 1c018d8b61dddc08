//! Negotiate and commit port bindings.
//!
//! Negotiation calls the mechanism drivers on a copy of the binding without
//! holding any lock. The commit then takes the port lock, re-reads the live
//! binding and only writes the candidate back if the live row is still
//! unbound and still has the host, vnic type and profile the candidate was
//! negotiated for. Otherwise the live state becomes the new starting point and
//! negotiation runs again.

use std::fmt;
use std::sync::Arc;

use netplane_core::config::{ControlPlaneConfig, DEFAULT_MAX_BIND_TRIES};
use netplane_core::lock::{port_lock, LockManager};
use netplane_core::types::Network;
use netplane_core::uuid::PortId;
use tracing::{debug, error, info};

use crate::driver::MechanismManager;
use crate::models::{PortBinding, PortContext, VifType};
use crate::notifier::PortNotifier;
use crate::store::{PortStore, PortTransaction};
use crate::Result;

/// Result of committing a candidate binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The candidate was written; the context reflects the stored state.
    Committed(PortContext),
    /// The live binding changed meanwhile; retry from this context.
    Retry(PortContext),
    /// The port or its binding row no longer exists.
    Gone,
}

impl CommitOutcome {
    /// Split into the resulting context and whether the candidate was
    /// committed.
    #[must_use]
    pub fn into_parts(self) -> (Option<PortContext>, bool) {
        match self {
            Self::Committed(context) => (Some(context), true),
            Self::Retry(context) => (Some(context), false),
            Self::Gone => (None, false),
        }
    }
}

/// Drives port bindings through the mechanism drivers.
#[derive(Clone)]
pub struct PortBinder {
    store: Arc<dyn PortStore>,
    drivers: Arc<MechanismManager>,
    notifier: Arc<dyn PortNotifier>,
    locks: Arc<LockManager>,
    max_bind_tries: u32,
}

impl fmt::Debug for PortBinder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortBinder")
            .field("drivers", &self.drivers)
            .field("max_bind_tries", &self.max_bind_tries)
            .finish_non_exhaustive()
    }
}

impl PortBinder {
    /// Create a binder with the default attempt bound.
    #[must_use]
    pub fn new(
        store: Arc<dyn PortStore>,
        drivers: Arc<MechanismManager>,
        notifier: Arc<dyn PortNotifier>,
        locks: Arc<LockManager>,
    ) -> Self {
        Self {
            store,
            drivers,
            notifier,
            locks,
            max_bind_tries: DEFAULT_MAX_BIND_TRIES,
        }
    }

    /// Create a binder configured from `config`.
    #[must_use]
    pub fn from_config(
        store: Arc<dyn PortStore>,
        drivers: Arc<MechanismManager>,
        notifier: Arc<dyn PortNotifier>,
        locks: Arc<LockManager>,
        config: &ControlPlaneConfig,
    ) -> Self {
        Self::new(store, drivers, notifier, locks).with_max_bind_tries(config.binding.max_bind_tries)
    }

    /// Override the number of negotiate/commit cycles per call.
    #[must_use]
    pub const fn with_max_bind_tries(mut self, max_bind_tries: u32) -> Self {
        self.max_bind_tries = max_bind_tries;
        self
    }

    /// The driver registry.
    #[must_use]
    pub fn drivers(&self) -> &MechanismManager {
        &self.drivers
    }

    /// The notifier.
    #[must_use]
    pub fn notifier(&self) -> &dyn PortNotifier {
        self.notifier.as_ref()
    }

    /// Bind the port of `context` if it has a host and is not bound yet.
    ///
    /// Runs up to `max_bind_tries` negotiate/commit cycles. Running out of
    /// attempts is logged and returns the last observed context; it is not an
    /// error, the next change to the port triggers binding again. If the port
    /// disappears, the context passed in is returned. When the loop finishes
    /// and `allow_notify` is set, the notifier is told about the port if a
    /// commit produced a usable binding or `need_notify` was passed in.
    ///
    /// # Errors
    ///
    /// Returns store errors and precommit hook failures.
    pub async fn bind_port_if_needed(
        &self,
        context: PortContext,
        allow_notify: bool,
        need_notify: bool,
    ) -> Result<PortContext> {
        let mut context = context;
        let mut need_notify = need_notify;
        let mut count: u32 = 0;

        while context.binding.vif_type.needs_binding() && context.binding.has_host() {
            count += 1;
            if count > self.max_bind_tries {
                error!(
                    port_id = %context.port.id,
                    host = context.host().unwrap_or_default(),
                    tries = self.max_bind_tries,
                    "Failed to commit binding results for port after retries"
                );
                return Ok(context);
            }
            if count > 1 {
                tokio::task::yield_now().await;
                info!(
                    port_id = %context.port.id,
                    attempt = count,
                    "Attempting to bind port again"
                );
            }

            let candidate = self.negotiate(&context).await;
            let original = context.binding.clone();
            match self
                .commit_port_binding(context.port.id, &original, candidate)
                .await?
            {
                CommitOutcome::Committed(committed) => {
                    if committed.binding.vif_type != VifType::BindingFailed {
                        need_notify = true;
                    }
                    context = committed;
                }
                CommitOutcome::Retry(live) => {
                    debug!(
                        port_id = %context.port.id,
                        "Binding changed concurrently, renegotiating"
                    );
                    context = live;
                }
                CommitOutcome::Gone => {
                    debug!(port_id = %context.port.id, "Port deleted while binding");
                    return Ok(context);
                }
            }
        }

        if allow_notify && need_notify {
            self.notifier.port_update(&context);
        }
        Ok(context)
    }

    /// Run the drivers on a fresh candidate copied from `context`.
    ///
    /// Holds no lock; the result is only a proposal for
    /// [`PortBinder::commit_port_binding`].
    pub async fn negotiate(&self, context: &PortContext) -> PortContext {
        let mut candidate = context.clone();
        candidate.binding = context.binding.candidate();
        candidate.new_status = None;
        candidate.original_port = Some(context.port.clone());
        candidate.original_binding = Some(context.binding.clone());
        self.drivers.bind_port(&mut candidate).await;
        candidate
    }

    /// Write `candidate`'s binding result if the live binding of `port_id`
    /// still matches `original`.
    ///
    /// Driver precommit hooks run inside the transaction and postcommit hooks
    /// after it.
    ///
    /// # Errors
    ///
    /// Returns store errors and precommit hook failures; the transaction is
    /// rolled back in both cases.
    pub async fn commit_port_binding(
        &self,
        port_id: PortId,
        original: &PortBinding,
        candidate: PortContext,
    ) -> Result<CommitOutcome> {
        let lock = self.locks.acquire(port_lock(&port_id)).await;
        let mut tx = self.store.begin().await?;

        let Some(port) = tx.get_port_for_update(port_id).await? else {
            tx.rollback().await?;
            return Ok(CommitOutcome::Gone);
        };
        let distributed = port.is_distributed();
        let live = read_binding(tx.as_mut(), port_id, distributed, original.host.as_deref()).await?;
        let Some(live) = live else {
            tx.rollback().await?;
            return Ok(CommitOutcome::Gone);
        };

        let mut current = PortContext::new(port, candidate.network.clone(), live);
        let commit = current.binding.vif_type.needs_binding() && current.binding.same_inputs(original);
        if !commit {
            tx.rollback().await?;
            debug!(
                port_id = %port_id,
                live_vif_type = %current.binding.vif_type,
                "Discarding stale binding candidate"
            );
            return Ok(CommitOutcome::Retry(current));
        }

        current.original_port = Some(current.port.clone());
        current.original_binding = Some(current.binding.clone());
        current.binding.copy_result(&candidate.binding);
        if current.binding.segment.is_some() {
            if let Some(status) = candidate.new_status {
                current.port.status = status;
                current.port.touch();
                tx.save_port(current.port.clone()).await?;
            }
        }
        current.new_status = candidate.new_status;

        if distributed {
            tx.save_distributed_binding(current.binding.clone()).await?;
        } else {
            tx.save_binding(current.binding.clone()).await?;
        }

        if let Err(err) = self.drivers.update_port_precommit(&current).await {
            tx.rollback().await?;
            return Err(err);
        }
        tx.commit().await?;
        drop(lock);

        self.drivers.update_port_postcommit(&current).await;
        debug!(
            port_id = %port_id,
            host = current.host().unwrap_or_default(),
            vif_type = %current.binding.vif_type,
            "Committed port binding"
        );
        Ok(CommitOutcome::Committed(current))
    }

    /// Load the context of a port as stored, with the per-host binding for
    /// distributed ports.
    ///
    /// Returns `None` if the port or the binding row does not exist.
    ///
    /// # Errors
    ///
    /// Returns store errors only.
    pub async fn load_context(
        &self,
        network: &Network,
        port_id: PortId,
        host: Option<&str>,
    ) -> Result<Option<PortContext>> {
        let mut tx = self.store.begin().await?;
        let Some(port) = tx.get_port_for_update(port_id).await? else {
            tx.rollback().await?;
            return Ok(None);
        };
        let binding = read_binding(tx.as_mut(), port_id, port.is_distributed(), host).await?;
        tx.commit().await?;
        Ok(binding.map(|binding| PortContext::new(port, network.clone(), binding)))
    }
}

async fn read_binding(
    tx: &mut dyn PortTransaction,
    port_id: PortId,
    distributed: bool,
    host: Option<&str>,
) -> Result<Option<PortBinding>> {
    if distributed {
        match host {
            Some(host) => tx.get_distributed_binding_for_update(port_id, host).await,
            None => Ok(None),
        }
    } else {
        tx.get_binding_for_update(port_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use netplane_core::types::{NetworkSegment, Port, PortStatus};
    use netplane_core::uuid::NetworkId;
    use netplane_core::Error;
    use serde_json::json;

    use crate::driver::MockMechanismDriver;
    use crate::memory::MemoryPortStore;
    use crate::models::BindResult;
    use crate::notifier::MockPortNotifier;

    struct Fixture {
        store: Arc<MemoryPortStore>,
        context: PortContext,
    }

    async fn fixture(host: Option<&str>) -> Fixture {
        let store = Arc::new(MemoryPortStore::new());
        let network = Network {
            id: NetworkId::new_v4(),
            name: "binder".to_string(),
            admin_state_up: true,
            shared: false,
            segments: vec![NetworkSegment::new("vxlan").with_segmentation_id(1001)],
        };
        let port = Port {
            id: PortId::new_v4(),
            network_id: network.id,
            mac_address: "fa:16:3e:12:34:56".to_string(),
            device_owner: "compute:nova".to_string(),
            device_id: "vm-1".to_string(),
            admin_state_up: true,
            status: PortStatus::Down,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let mut binding = PortBinding::unbound(port.id);
        binding.host = host.map(str::to_string);

        let mut tx = store.begin().await.unwrap();
        tx.save_port(port.clone()).await.unwrap();
        tx.save_binding(binding.clone()).await.unwrap();
        tx.commit().await.unwrap();

        Fixture {
            store,
            context: PortContext::new(port, network, binding),
        }
    }

    fn binder(
        store: Arc<MemoryPortStore>,
        manager: MechanismManager,
        notifier: MockPortNotifier,
    ) -> PortBinder {
        PortBinder::new(
            store,
            Arc::new(manager),
            Arc::new(notifier),
            Arc::new(LockManager::new()),
        )
    }

    async fn stored_binding(store: &MemoryPortStore, port_id: PortId) -> PortBinding {
        let mut tx = store.begin().await.unwrap();
        tx.get_binding_for_update(port_id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_binds_and_notifies() {
        let f = fixture(Some("compute-1")).await;
        let segment = f.context.network.segments[0].id;

        let mut driver = MockMechanismDriver::new();
        driver.expect_bind_port().times(1).returning(move |_| {
            Ok(Some(
                BindResult::new(segment, "ovs")
                    .with_detail("port_filter", true)
                    .with_status(PortStatus::Active),
            ))
        });
        driver.expect_update_port_precommit().times(1).returning(|_| Ok(()));
        driver.expect_update_port_postcommit().times(1).returning(|_| Ok(()));
        let mut notifier = MockPortNotifier::new();
        notifier.expect_port_update().times(1).return_const(());

        let manager = MechanismManager::new()
            .with_driver("openvswitch", Arc::new(driver))
            .unwrap();
        let binder = binder(Arc::clone(&f.store), manager, notifier);

        let ctx = binder
            .bind_port_if_needed(f.context.clone(), true, false)
            .await
            .unwrap();
        assert_eq!(ctx.binding.vif_type, VifType::Bound("ovs".to_string()));
        assert_eq!(ctx.port.status, PortStatus::Active);

        let stored = stored_binding(&f.store, f.context.port.id).await;
        assert_eq!(stored.driver.as_deref(), Some("openvswitch"));
        assert_eq!(stored.segment, Some(segment));
        assert_eq!(stored.vif_details.get("port_filter"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_always_failing_driver_runs_exactly_max_tries() {
        let f = fixture(Some("compute-1")).await;

        let mut driver = MockMechanismDriver::new();
        driver.expect_bind_port().times(4).returning(|_| Ok(None));
        driver.expect_update_port_precommit().times(4).returning(|_| Ok(()));
        driver.expect_update_port_postcommit().times(4).returning(|_| Ok(()));
        let mut notifier = MockPortNotifier::new();
        notifier.expect_port_update().never();

        let manager = MechanismManager::new()
            .with_driver("never", Arc::new(driver))
            .unwrap();
        let binder = binder(Arc::clone(&f.store), manager, notifier).with_max_bind_tries(4);

        let ctx = tokio_test::assert_ok!(
            binder.bind_port_if_needed(f.context.clone(), true, true).await
        );
        assert_eq!(ctx.binding.vif_type, VifType::BindingFailed);
        assert_eq!(
            stored_binding(&f.store, f.context.port.id).await.vif_type,
            VifType::BindingFailed
        );
    }

    #[tokio::test]
    async fn test_default_attempt_bound() {
        let f = fixture(Some("compute-1")).await;
        let mut driver = MockMechanismDriver::new();
        driver
            .expect_bind_port()
            .times(DEFAULT_MAX_BIND_TRIES as usize)
            .returning(|_| Err(Error::InternalError("agent down".to_string())));
        driver.expect_update_port_precommit().returning(|_| Ok(()));
        driver.expect_update_port_postcommit().returning(|_| Ok(()));
        let mut notifier = MockPortNotifier::new();
        notifier.expect_port_update().never();

        let manager = MechanismManager::new()
            .with_driver("broken", Arc::new(driver))
            .unwrap();
        let binder = binder(Arc::clone(&f.store), manager, notifier);

        let ctx = binder
            .bind_port_if_needed(f.context.clone(), true, false)
            .await
            .unwrap();
        assert_eq!(ctx.binding.vif_type, VifType::BindingFailed);
    }

    #[tokio::test]
    async fn test_no_host_means_no_binding() {
        let f = fixture(None).await;
        let mut driver = MockMechanismDriver::new();
        driver.expect_bind_port().never();
        let mut notifier = MockPortNotifier::new();
        notifier.expect_port_update().times(1).return_const(());

        let manager = MechanismManager::new()
            .with_driver("unused", Arc::new(driver))
            .unwrap();
        let binder = binder(Arc::clone(&f.store), manager, notifier);

        let ctx = binder
            .bind_port_if_needed(f.context.clone(), true, true)
            .await
            .unwrap();
        assert_eq!(ctx.binding.vif_type, VifType::Unbound);
    }

    #[tokio::test]
    async fn test_commit_rejected_when_inputs_changed() {
        let f = fixture(Some("compute-1")).await;
        let segment = f.context.network.segments[0].id;
        let manager = MechanismManager::new();
        let binder = binder(Arc::clone(&f.store), manager, MockPortNotifier::new());

        let original = f.context.binding.clone();
        let mut candidate = f.context.clone();
        candidate.set_binding("openvswitch", BindResult::new(segment, "ovs"));

        for change in 0..3 {
            let mut live = original.clone();
            match change {
                0 => live.host = Some("compute-2".to_string()),
                1 => live.vnic_type = crate::models::VnicType::Direct,
                _ => live.profile = json!({ "trusted": true }),
            }
            let mut tx = f.store.begin().await.unwrap();
            tx.save_binding(live.clone()).await.unwrap();
            tx.commit().await.unwrap();

            let outcome = binder
                .commit_port_binding(f.context.port.id, &original, candidate.clone())
                .await
                .unwrap();
            let CommitOutcome::Retry(ctx) = outcome else {
                panic!("expected retry for change {change}");
            };
            assert_eq!(ctx.binding, live);
            assert_eq!(stored_binding(&f.store, f.context.port.id).await, live);
        }
    }

    #[tokio::test]
    async fn test_commit_rejected_when_already_bound() {
        let f = fixture(Some("compute-1")).await;
        let segment = f.context.network.segments[0].id;
        let binder = binder(
            Arc::clone(&f.store),
            MechanismManager::new(),
            MockPortNotifier::new(),
        );

        let mut bound = f.context.binding.clone();
        bound.vif_type = VifType::Bound("bridge".to_string());
        let mut tx = f.store.begin().await.unwrap();
        tx.save_binding(bound).await.unwrap();
        tx.commit().await.unwrap();

        let mut candidate = f.context.clone();
        candidate.set_binding("openvswitch", BindResult::new(segment, "ovs"));
        let (ctx, committed) = binder
            .commit_port_binding(f.context.port.id, &f.context.binding, candidate)
            .await
            .unwrap()
            .into_parts();
        assert!(!committed);
        assert_eq!(
            ctx.unwrap().binding.vif_type,
            VifType::Bound("bridge".to_string())
        );
    }

    #[tokio::test]
    async fn test_commit_on_deleted_port_is_gone() {
        let f = fixture(Some("compute-1")).await;
        let mut tx = f.store.begin().await.unwrap();
        tx.delete_port(f.context.port.id).await.unwrap();
        tx.commit().await.unwrap();

        let mut driver = MockMechanismDriver::new();
        driver.expect_bind_port().times(1).returning(|_| Ok(None));
        let mut notifier = MockPortNotifier::new();
        notifier.expect_port_update().never();
        let manager = MechanismManager::new()
            .with_driver("declines", Arc::new(driver))
            .unwrap();
        let binder = binder(Arc::clone(&f.store), manager, notifier);

        let ctx = binder
            .bind_port_if_needed(f.context.clone(), true, true)
            .await
            .unwrap();
        assert_eq!(ctx, f.context);
        assert_eq!(CommitOutcome::Gone.into_parts(), (None, false));
    }

    #[tokio::test]
    async fn test_precommit_failure_rolls_back() {
        let f = fixture(Some("compute-1")).await;
        let segment = f.context.network.segments[0].id;
        let mut driver = MockMechanismDriver::new();
        driver
            .expect_bind_port()
            .returning(move |_| {
                Ok(Some(
                    BindResult::new(segment, "ovs").with_status(PortStatus::Active),
                ))
            });
        driver
            .expect_update_port_precommit()
            .times(1)
            .returning(|_| Err(Error::InvalidInput("segment full".to_string())));
        driver.expect_update_port_postcommit().never();
        let mut notifier = MockPortNotifier::new();
        notifier.expect_port_update().never();

        let manager = MechanismManager::new()
            .with_driver("openvswitch", Arc::new(driver))
            .unwrap();
        let binder = binder(Arc::clone(&f.store), manager, notifier);

        let err = binder
            .bind_port_if_needed(f.context.clone(), true, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MechanismDriver { .. }));

        let stored = stored_binding(&f.store, f.context.port.id).await;
        assert_eq!(stored.vif_type, VifType::Unbound);
        let mut tx = f.store.begin().await.unwrap();
        let port = tx.get_port_for_update(f.context.port.id).await.unwrap().unwrap();
        assert_eq!(port.status, PortStatus::Down);
    }

    #[tokio::test]
    async fn test_load_context() {
        let f = fixture(Some("compute-1")).await;
        let binder = binder(
            Arc::clone(&f.store),
            MechanismManager::new(),
            MockPortNotifier::new(),
        );
        let ctx = binder
            .load_context(&f.context.network, f.context.port.id, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ctx.binding, f.context.binding);
        assert!(binder
            .load_context(&f.context.network, PortId::new_v4(), None)
            .await
            .unwrap()
            .is_none());
    }
}
