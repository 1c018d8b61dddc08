//! Request and response models for plugin operations.

use netplane_binding::{PortBinding, VnicType};
use netplane_core::types::{NetworkSegment, Port};
use netplane_core::uuid::NetworkId;
use netplane_ipam::{AllocatedIp, FixedIpRequest};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use validator::Validate;

const fn default_true() -> bool {
    true
}

fn empty_profile() -> Value {
    Value::Object(Map::new())
}

/// Request payload to create a network.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct CreateNetworkRequest {
    /// Network name.
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    /// Administrative state.
    #[serde(default = "default_true")]
    pub admin_state_up: bool,
    /// Whether the network is shared.
    #[serde(default)]
    pub shared: bool,
    /// Provider segments in binding preference order.
    #[serde(default)]
    pub segments: Vec<NetworkSegment>,
}

impl CreateNetworkRequest {
    /// Request an unshared, enabled network without segments.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            admin_state_up: true,
            shared: false,
            segments: Vec::new(),
        }
    }

    /// Add a provider segment.
    #[must_use]
    pub fn with_segment(mut self, segment: NetworkSegment) -> Self {
        self.segments.push(segment);
        self
    }

    /// Mark the network as shared.
    #[must_use]
    pub const fn with_shared(mut self, shared: bool) -> Self {
        self.shared = shared;
        self
    }
}

/// Request payload to create a port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct CreatePortRequest {
    /// Network of the port.
    pub network_id: NetworkId,
    /// Explicit MAC address; generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    /// Owning entity.
    #[validate(length(max = 255))]
    #[serde(default)]
    pub device_owner: String,
    /// Device using the port.
    #[validate(length(max = 255))]
    #[serde(default)]
    pub device_id: String,
    /// Administrative state.
    #[serde(default = "default_true")]
    pub admin_state_up: bool,
    /// Fixed IPs; one address per IP family when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_ips: Option<Vec<FixedIpRequest>>,
    /// Host to bind the port on.
    #[validate(length(max = 255))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Requested NIC kind.
    #[serde(default)]
    pub vnic_type: VnicType,
    /// Opaque binding profile.
    #[serde(default = "empty_profile")]
    pub profile: Value,
}

impl CreatePortRequest {
    /// Request an enabled port on `network_id` with defaults for everything
    /// else.
    #[must_use]
    pub fn new(network_id: NetworkId) -> Self {
        Self {
            network_id,
            mac_address: None,
            device_owner: String::new(),
            device_id: String::new(),
            admin_state_up: true,
            fixed_ips: None,
            host: None,
            vnic_type: VnicType::Normal,
            profile: empty_profile(),
        }
    }

    /// Set the device owner and ID.
    #[must_use]
    pub fn with_device(mut self, owner: impl Into<String>, id: impl Into<String>) -> Self {
        self.device_owner = owner.into();
        self.device_id = id.into();
        self
    }

    /// Request a specific MAC address.
    #[must_use]
    pub fn with_mac_address(mut self, mac_address: impl Into<String>) -> Self {
        self.mac_address = Some(mac_address.into());
        self
    }

    /// Add a fixed IP request.
    #[must_use]
    pub fn with_fixed_ip(mut self, request: FixedIpRequest) -> Self {
        self.fixed_ips.get_or_insert_with(Vec::new).push(request);
        self
    }

    /// Bind the port on `host`.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set the vnic type.
    #[must_use]
    pub const fn with_vnic_type(mut self, vnic_type: VnicType) -> Self {
        self.vnic_type = vnic_type;
        self
    }

    /// Set the binding profile.
    #[must_use]
    pub fn with_profile(mut self, profile: Value) -> Self {
        self.profile = profile;
        self
    }
}

/// Request payload to update a port. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct UpdatePortRequest {
    /// Administrative state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_state_up: Option<bool>,
    /// Owning entity.
    #[validate(length(max = 255))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_owner: Option<String>,
    /// Device using the port.
    #[validate(length(max = 255))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Replacement fixed IPs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_ips: Option<Vec<FixedIpRequest>>,
    /// Host to bind the port on.
    #[validate(length(max = 255))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Requested NIC kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vnic_type: Option<VnicType>,
    /// Opaque binding profile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<Value>,
}

impl UpdatePortRequest {
    /// An update changing nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Change the administrative state.
    #[must_use]
    pub const fn with_admin_state_up(mut self, admin_state_up: bool) -> Self {
        self.admin_state_up = Some(admin_state_up);
        self
    }

    /// Change the device ID.
    #[must_use]
    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    /// Replace the fixed IPs.
    #[must_use]
    pub fn with_fixed_ips(mut self, fixed_ips: Vec<FixedIpRequest>) -> Self {
        self.fixed_ips = Some(fixed_ips);
        self
    }

    /// Move the binding to `host`.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Change the vnic type.
    #[must_use]
    pub const fn with_vnic_type(mut self, vnic_type: VnicType) -> Self {
        self.vnic_type = Some(vnic_type);
        self
    }

    /// Change the binding profile.
    #[must_use]
    pub fn with_profile(mut self, profile: Value) -> Self {
        self.profile = Some(profile);
        self
    }

    /// Returns true if the update touches host, vnic type or profile.
    #[must_use]
    pub const fn changes_binding(&self) -> bool {
        self.host.is_some() || self.vnic_type.is_some() || self.profile.is_some()
    }
}

/// A port with its binding and addresses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortDetails {
    /// The port.
    pub port: Port,
    /// Its primary binding.
    pub binding: PortBinding,
    /// Addresses allocated to it.
    pub fixed_ips: Vec<AllocatedIp>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_create_port_request_defaults() {
        let request: CreatePortRequest = serde_json::from_value(json!({
            "network_id": NetworkId::new_v4(),
        }))
        .unwrap();
        assert!(request.admin_state_up);
        assert_eq!(request.vnic_type, VnicType::Normal);
        assert_eq!(request.profile, json!({}));
        assert!(request.fixed_ips.is_none());
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_create_port_request_validation() {
        let request = CreatePortRequest::new(NetworkId::new_v4()).with_device("x".repeat(256), "vm");
        assert!(request.validate().is_err());
        let request = CreatePortRequest::new(NetworkId::new_v4()).with_host("h".repeat(256));
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_create_network_request_validation() {
        assert!(CreateNetworkRequest::new("").validate().is_err());
        assert!(CreateNetworkRequest::new("private").validate().is_ok());
    }

    #[test]
    fn test_update_changes_binding() {
        assert!(!UpdatePortRequest::new().with_admin_state_up(false).changes_binding());
        assert!(UpdatePortRequest::new().with_host("compute-2").changes_binding());
        assert!(UpdatePortRequest::new()
            .with_profile(json!({ "trusted": true }))
            .changes_binding());
    }
}
