//! Binding models.

use std::fmt;

use netplane_core::types::{Network, NetworkSegment, Port, PortStatus};
use netplane_core::uuid::{PortId, SegmentId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Kind of virtual NIC requested for a port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VnicType {
    /// Regular virtual NIC.
    #[default]
    Normal,
    /// SR-IOV passthrough.
    Direct,
    /// Macvtap device.
    Macvtap,
    /// Bare metal port.
    Baremetal,
}

/// How a port is attached, as decided by a mechanism driver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum VifType {
    /// Not bound yet.
    #[default]
    Unbound,
    /// Every driver declined or failed the last attempt.
    BindingFailed,
    /// Bound per host; the primary row of a distributed port.
    Distributed,
    /// Bound by a driver with the given attachment kind (`ovs`, `bridge`, ...).
    Bound(String),
}

impl VifType {
    /// Wire name of the vif type.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Unbound => "unbound",
            Self::BindingFailed => "binding_failed",
            Self::Distributed => "distributed",
            Self::Bound(kind) => kind,
        }
    }

    /// Returns true for the states a bind attempt may replace.
    #[must_use]
    pub const fn needs_binding(&self) -> bool {
        matches!(self, Self::Unbound | Self::BindingFailed)
    }
}

impl From<String> for VifType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "unbound" => Self::Unbound,
            "binding_failed" => Self::BindingFailed,
            "distributed" => Self::Distributed,
            _ => Self::Bound(value),
        }
    }
}

impl From<VifType> for String {
    fn from(value: VifType) -> Self {
        match value {
            VifType::Bound(kind) => kind,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for VifType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Binding state of a port, or of one host of a distributed port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    /// Bound port.
    pub port_id: PortId,
    /// Host the port lives on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Requested NIC kind.
    #[serde(default)]
    pub vnic_type: VnicType,
    /// Opaque driver-specific request data.
    #[serde(default)]
    pub profile: Value,
    /// Binding result.
    #[serde(default)]
    pub vif_type: VifType,
    /// Driver-provided attachment details.
    #[serde(default)]
    pub vif_details: Map<String, Value>,
    /// Driver that produced the binding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    /// Segment the port was bound to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment: Option<SegmentId>,
}

impl PortBinding {
    /// An unbound binding without a host.
    #[must_use]
    pub fn unbound(port_id: PortId) -> Self {
        Self {
            port_id,
            host: None,
            vnic_type: VnicType::Normal,
            profile: Value::Object(Map::new()),
            vif_type: VifType::Unbound,
            vif_details: Map::new(),
            driver: None,
            segment: None,
        }
    }

    /// Set the host.
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

    /// Set the profile.
    #[must_use]
    pub fn with_profile(mut self, profile: Value) -> Self {
        self.profile = profile;
        self
    }

    /// Returns true if host, vnic type and profile equal those of `other`.
    #[must_use]
    pub fn same_inputs(&self, other: &Self) -> bool {
        self.host == other.host && self.vnic_type == other.vnic_type && self.profile == other.profile
    }

    /// Returns true if the binding has a non-empty host.
    #[must_use]
    pub fn has_host(&self) -> bool {
        self.host.as_deref().is_some_and(|host| !host.is_empty())
    }

    /// A copy carrying only the inputs, ready for a new bind attempt.
    #[must_use]
    pub fn candidate(&self) -> Self {
        let mut candidate = self.clone();
        candidate.reset();
        candidate
    }

    /// Drop the binding result, keeping the inputs.
    pub fn reset(&mut self) {
        self.vif_type = VifType::Unbound;
        self.vif_details = Map::new();
        self.driver = None;
        self.segment = None;
    }

    /// Copy the result of `other` onto this binding.
    pub fn copy_result(&mut self, other: &Self) {
        self.vif_type = other.vif_type.clone();
        self.vif_details = other.vif_details.clone();
        self.driver = other.driver.clone();
        self.segment = other.segment;
    }
}

/// What a mechanism driver decided for a port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindResult {
    /// Segment the port is bound to.
    pub segment: SegmentId,
    /// Attachment kind.
    pub vif_type: String,
    /// Attachment details.
    #[serde(default)]
    pub vif_details: Map<String, Value>,
    /// Status the driver wants the port to have.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PortStatus>,
}

impl BindResult {
    /// Bind to `segment` with the given attachment kind.
    #[must_use]
    pub fn new(segment: SegmentId, vif_type: impl Into<String>) -> Self {
        Self {
            segment,
            vif_type: vif_type.into(),
            vif_details: Map::new(),
            status: None,
        }
    }

    /// Add an attachment detail.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.vif_details.insert(key.into(), value.into());
        self
    }

    /// Request a port status.
    #[must_use]
    pub const fn with_status(mut self, status: PortStatus) -> Self {
        self.status = Some(status);
        self
    }
}

/// A port as seen by mechanism drivers and notifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortContext {
    /// Current port.
    pub port: Port,
    /// Network of the port.
    pub network: Network,
    /// Current binding; the per-host row for distributed ports.
    pub binding: PortBinding,
    /// Port before the change that produced this context.
    pub original_port: Option<Port>,
    /// Binding before the change that produced this context.
    pub original_binding: Option<PortBinding>,
    /// Status requested by the driver that bound the port.
    pub new_status: Option<PortStatus>,
}

impl PortContext {
    /// Build a context with no prior state.
    #[must_use]
    pub const fn new(port: Port, network: Network, binding: PortBinding) -> Self {
        Self {
            port,
            network,
            binding,
            original_port: None,
            original_binding: None,
            new_status: None,
        }
    }

    /// Record the state before the change.
    #[must_use]
    pub fn with_original(mut self, port: Port, binding: PortBinding) -> Self {
        self.original_port = Some(port);
        self.original_binding = Some(binding);
        self
    }

    /// Host of the binding.
    #[must_use]
    pub fn host(&self) -> Option<&str> {
        self.binding.host.as_deref()
    }

    /// Segments a driver may bind to, in preference order.
    #[must_use]
    pub fn segments_to_bind(&self) -> &[NetworkSegment] {
        &self.network.segments
    }

    /// Segment the port is bound to.
    #[must_use]
    pub fn bound_segment(&self) -> Option<&NetworkSegment> {
        let id = self.binding.segment?;
        self.network.segments.iter().find(|segment| segment.id == id)
    }

    /// Record a driver's decision on the binding.
    pub fn set_binding(&mut self, driver: &str, result: BindResult) {
        self.binding.vif_type = VifType::Bound(result.vif_type);
        self.binding.vif_details = result.vif_details;
        self.binding.driver = Some(driver.to_string());
        self.binding.segment = Some(result.segment);
        self.new_status = result.status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_vif_type_wire_names() {
        for (vif, name) in [
            (VifType::Unbound, "unbound"),
            (VifType::BindingFailed, "binding_failed"),
            (VifType::Distributed, "distributed"),
            (VifType::Bound("ovs".to_string()), "ovs"),
        ] {
            assert_eq!(serde_json::to_value(&vif).unwrap(), json!(name));
            assert_eq!(serde_json::from_value::<VifType>(json!(name)).unwrap(), vif);
        }
    }

    #[test]
    fn test_needs_binding() {
        assert!(VifType::Unbound.needs_binding());
        assert!(VifType::BindingFailed.needs_binding());
        assert!(!VifType::Distributed.needs_binding());
        assert!(!VifType::Bound("ovs".to_string()).needs_binding());
    }

    #[test]
    fn test_candidate_keeps_inputs_only() {
        let mut binding = PortBinding::unbound(PortId::new_v4())
            .with_host("compute-1")
            .with_vnic_type(VnicType::Direct)
            .with_profile(json!({ "pci_slot": "0000:03:00.1" }));
        binding.vif_type = VifType::Bound("hw_veb".to_string());
        binding.driver = Some("sriov".to_string());
        binding.segment = Some(SegmentId::new_v4());
        binding.vif_details.insert("vlan".to_string(), json!(100));

        let candidate = binding.candidate();
        assert!(candidate.same_inputs(&binding));
        assert_eq!(candidate.vif_type, VifType::Unbound);
        assert!(candidate.vif_details.is_empty());
        assert_eq!(candidate.driver, None);
        assert_eq!(candidate.segment, None);
    }

    #[test]
    fn test_same_inputs_detects_each_field() {
        let base = PortBinding::unbound(PortId::new_v4()).with_host("a");
        assert!(!base.same_inputs(&base.clone().with_host("b")));
        assert!(!base.same_inputs(&base.clone().with_vnic_type(VnicType::Macvtap)));
        assert!(!base.same_inputs(&base.clone().with_profile(json!({ "x": 1 }))));

        let mut bound = base.clone();
        bound.vif_type = VifType::Bound("ovs".to_string());
        assert!(base.same_inputs(&bound));
    }

    #[test]
    fn test_has_host() {
        let binding = PortBinding::unbound(PortId::new_v4());
        assert!(!binding.has_host());
        assert!(!binding.clone().with_host("").has_host());
        assert!(binding.with_host("compute-1").has_host());
    }

    #[test]
    fn test_bind_result_builder() {
        let segment = SegmentId::new_v4();
        let result = BindResult::new(segment, "ovs")
            .with_detail("port_filter", true)
            .with_status(PortStatus::Active);
        assert_eq!(result.vif_details.get("port_filter"), Some(&json!(true)));
        assert_eq!(result.status, Some(PortStatus::Active));
    }
}
