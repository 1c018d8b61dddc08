//! Agent-facing lookups, distributed bindings and status reports.

use std::sync::Arc;

use async_trait::async_trait;
use netplane_binding::{
    BindResult, ChannelNotifier, MechanismDriver, MechanismManager, MemoryPortStore, PortContext,
    PortEvent, VifType,
};
use netplane_core::config::ControlPlaneConfig;
use netplane_core::types::{NetworkSegment, PortStatus, DEVICE_OWNER_DISTRIBUTED_ROUTER};
use netplane_core::uuid::PortId;
use netplane_core::{Error, Result};
use netplane_ipam::MemoryIpamStore;
use netplane_plugin::{CorePlugin, CreateNetworkRequest, CreatePortRequest};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_test::assert_ok;

/// Binds to the first segment and refuses to store ports in error state.
struct OvsDriver;

#[async_trait]
impl MechanismDriver for OvsDriver {
    async fn bind_port(&self, context: &PortContext) -> Result<Option<BindResult>> {
        tokio::task::yield_now().await;
        Ok(context.segments_to_bind().first().map(|segment| {
            BindResult::new(segment.id, "ovs")
                .with_detail("host", context.host().unwrap_or_default())
        }))
    }

    async fn update_port_precommit(&self, context: &PortContext) -> Result<()> {
        if context.port.status == PortStatus::Error {
            return Err(Error::InvalidInput("port in error state".to_string()));
        }
        Ok(())
    }
}

fn setup() -> (CorePlugin, UnboundedReceiver<PortEvent>, CreateNetworkRequest) {
    let drivers = MechanismManager::new()
        .with_driver("openvswitch", Arc::new(OvsDriver))
        .unwrap();
    let (notifier, events) = ChannelNotifier::new();
    let plugin = CorePlugin::new(
        ControlPlaneConfig::default(),
        Arc::new(MemoryIpamStore::new()),
        Arc::new(MemoryPortStore::new()),
        drivers,
        Arc::new(notifier),
    )
    .unwrap();
    let network = CreateNetworkRequest::new("tenant")
        .with_segment(NetworkSegment::new("vxlan").with_segmentation_id(7));
    (plugin, events, network)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distributed_port_is_bound_on_each_host() {
    let (plugin, mut events, network) = setup();
    let network = plugin.create_network(network).await.unwrap();
    let created = plugin
        .create_port(
            CreatePortRequest::new(network.id)
                .with_device(DEVICE_OWNER_DISTRIBUTED_ROUTER, "router-1"),
        )
        .await
        .unwrap();
    assert_eq!(created.binding.vif_type, VifType::Distributed);
    let port_id = created.port.id;

    let mut handles = Vec::new();
    for host in ["compute-1", "compute-2"] {
        let plugin = plugin.clone();
        handles.push(tokio::spawn(async move {
            plugin.update_distributed_port_binding(port_id, host).await
        }));
    }
    for handle in handles {
        let context = assert_ok!(handle.await.unwrap()).expect("port exists");
        assert_eq!(context.binding.vif_type, VifType::Bound("ovs".to_string()));
        assert_eq!(context.binding.driver.as_deref(), Some("openvswitch"));
    }

    let mut notified = Vec::new();
    while let Ok(PortEvent::Updated(context)) = events.try_recv() {
        notified.push(context.host().map(str::to_string));
    }
    notified.sort();
    assert_eq!(
        notified,
        vec![Some("compute-1".to_string()), Some("compute-2".to_string())]
    );

    let primary = plugin.get_port(port_id).await.unwrap().binding;
    assert_eq!(primary.vif_type, VifType::Distributed);

    let context = plugin
        .bound_port_context(port_id, "compute-2")
        .await
        .unwrap()
        .expect("bound on compute-2");
    assert_eq!(context.host(), Some("compute-2"));
    assert_eq!(context.binding.vif_type, VifType::Bound("ovs".to_string()));
    assert!(plugin
        .bound_port_context(port_id, "compute-3")
        .await
        .unwrap()
        .is_none());

    // Repeating the call reuses the bound row.
    let again = plugin
        .update_distributed_port_binding(port_id, "compute-1")
        .await
        .unwrap()
        .expect("port exists");
    assert_eq!(again.binding.vif_type, VifType::Bound("ovs".to_string()));
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_distributed_binding_requires_distributed_port_and_host() {
    let (plugin, _events, network) = setup();
    let network = plugin.create_network(network).await.unwrap();
    let compute = plugin
        .create_port(CreatePortRequest::new(network.id).with_device("compute:nova", "vm-1"))
        .await
        .unwrap();
    let router = plugin
        .create_port(
            CreatePortRequest::new(network.id).with_device(DEVICE_OWNER_DISTRIBUTED_ROUTER, "r1"),
        )
        .await
        .unwrap();

    assert!(matches!(
        plugin
            .update_distributed_port_binding(compute.port.id, "compute-1")
            .await,
        Err(Error::InvalidInput(_))
    ));
    assert!(matches!(
        plugin.update_distributed_port_binding(router.port.id, "").await,
        Err(Error::InvalidInput(_))
    ));
    assert_eq!(
        plugin
            .update_distributed_port_binding(PortId::new_v4(), "compute-1")
            .await
            .unwrap(),
        None
    );
    assert!(matches!(
        plugin
            .create_port(
                CreatePortRequest::new(network.id)
                    .with_device(DEVICE_OWNER_DISTRIBUTED_ROUTER, "r2")
                    .with_host("compute-1"),
            )
            .await,
        Err(Error::InvalidInput(_))
    ));
}

#[tokio::test]
async fn test_agent_only_sees_ports_bound_to_its_host() {
    let (plugin, _events, network) = setup();
    let network = plugin.create_network(network).await.unwrap();
    let created = plugin
        .create_port(CreatePortRequest::new(network.id).with_host("compute-1"))
        .await
        .unwrap();

    let context = plugin
        .bound_port_context(created.port.id, "compute-1")
        .await
        .unwrap()
        .expect("bound on compute-1");
    assert_eq!(context.binding, created.binding);

    assert!(plugin
        .bound_port_context(created.port.id, "compute-2")
        .await
        .unwrap()
        .is_none());
    assert!(plugin
        .bound_port_context(PortId::new_v4(), "compute-1")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_status_reports_are_recorded_once() {
    let (plugin, _events, network) = setup();
    let network = plugin.create_network(network).await.unwrap();
    let created = plugin
        .create_port(CreatePortRequest::new(network.id))
        .await
        .unwrap();
    let port_id = created.port.id;
    assert_eq!(created.port.status, PortStatus::Down);

    assert!(plugin.update_port_status(port_id, PortStatus::Active).await.unwrap());
    assert!(!plugin.update_port_status(port_id, PortStatus::Active).await.unwrap());
    assert_eq!(
        plugin.get_port(port_id).await.unwrap().port.status,
        PortStatus::Active
    );

    let err = plugin
        .update_port_status(port_id, PortStatus::Error)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::MechanismDriver { ref driver, .. } if driver == "openvswitch"
    ));
    assert_eq!(
        plugin.get_port(port_id).await.unwrap().port.status,
        PortStatus::Active
    );

    assert!(!plugin
        .update_port_status(PortId::new_v4(), PortStatus::Active)
        .await
        .unwrap());
}
