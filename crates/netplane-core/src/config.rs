//! Configuration structures for the control plane.
//!
//! Configuration is plain serde data validated with `validator`. Every field
//! has a default, so an empty JSON object is a valid configuration.

use crate::Error;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Default number of negotiate/commit cycles before a port is left unbound.
pub const DEFAULT_MAX_BIND_TRIES: u32 = 10;

/// Default base MAC; the zero octets are randomized per port.
pub const DEFAULT_BASE_MAC: &str = "fa:16:3e:00:00:00";

/// Top-level control-plane configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ControlPlaneConfig {
    /// Base MAC address for generated port MACs
    #[validate(length(equal = 17))]
    #[serde(default = "default_base_mac")]
    pub base_mac: String,

    /// Attempts at generating a unique MAC before giving up
    #[validate(range(min = 1, max = 64))]
    #[serde(default = "default_mac_generation_retries")]
    pub mac_generation_retries: u32,

    /// Maximum number of fixed IPs a single port may request
    #[validate(range(min = 1, max = 64))]
    #[serde(default = "default_max_fixed_ips_per_port")]
    pub max_fixed_ips_per_port: usize,

    /// IPAM behaviour
    #[validate(nested)]
    #[serde(default)]
    pub ipam: IpamConfig,

    /// Port binding behaviour
    #[validate(nested)]
    #[serde(default)]
    pub binding: BindingConfig,
}

fn default_base_mac() -> String {
    DEFAULT_BASE_MAC.to_string()
}

const fn default_mac_generation_retries() -> u32 {
    16
}

const fn default_max_fixed_ips_per_port() -> usize {
    5
}

impl ControlPlaneConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self {
            base_mac: default_base_mac(),
            mac_generation_retries: default_mac_generation_retries(),
            max_fixed_ips_per_port: default_max_fixed_ips_per_port(),
            ipam: IpamConfig::new(),
            binding: BindingConfig::new(),
        }
    }

    /// Parse a JSON document and validate it.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed or validation fails.
    pub fn from_json(input: &str) -> Result<Self, Error> {
        let config: Self = serde_json::from_str(input)
            .map_err(|e| Error::ConfigError(format!("Invalid configuration: {e}")))?;
        config.validated()
    }

    /// Validate field ranges and the base MAC format.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid field.
    pub fn validated(self) -> Result<Self, Error> {
        self.validate()?;
        self.base_mac_octets()?;
        Ok(self)
    }

    /// Parse the base MAC into octets.
    ///
    /// # Errors
    ///
    /// Returns an error if `base_mac` is not six colon-separated hex octets.
    pub fn base_mac_octets(&self) -> Result<[u8; 6], Error> {
        parse_mac(&self.base_mac)
            .ok_or_else(|| Error::ConfigError(format!("Invalid base MAC: {}", self.base_mac)))
    }

    /// Set the base MAC.
    #[must_use]
    pub fn with_base_mac(mut self, base_mac: impl Into<String>) -> Self {
        self.base_mac = base_mac.into();
        self
    }

    /// Set MAC generation retries.
    #[must_use]
    pub const fn with_mac_generation_retries(mut self, retries: u32) -> Self {
        self.mac_generation_retries = retries;
        self
    }

    /// Set the per-port fixed IP limit.
    #[must_use]
    pub const fn with_max_fixed_ips_per_port(mut self, max: usize) -> Self {
        self.max_fixed_ips_per_port = max;
        self
    }

    /// Set the IPAM configuration.
    #[must_use]
    pub const fn with_ipam(mut self, ipam: IpamConfig) -> Self {
        self.ipam = ipam;
        self
    }

    /// Set the binding configuration.
    #[must_use]
    pub const fn with_binding(mut self, binding: BindingConfig) -> Self {
        self.binding = binding;
        self
    }
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// IPAM configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Validate)]
pub struct IpamConfig {
    /// Merge released addresses back into availability ranges immediately
    /// instead of waiting for the next rebuild
    #[serde(default)]
    pub reclaim_on_release: bool,
}

impl IpamConfig {
    /// Create an IPAM configuration with lazy reclamation.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            reclaim_on_release: false,
        }
    }

    /// Enable or disable eager reclamation.
    #[must_use]
    pub const fn with_reclaim_on_release(mut self, enabled: bool) -> Self {
        self.reclaim_on_release = enabled;
        self
    }
}

/// Port binding configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct BindingConfig {
    /// Negotiate/commit cycles before giving up on a port
    #[validate(range(min = 1, max = 100))]
    #[serde(default = "default_max_bind_tries")]
    pub max_bind_tries: u32,
}

const fn default_max_bind_tries() -> u32 {
    DEFAULT_MAX_BIND_TRIES
}

impl BindingConfig {
    /// Create a binding configuration with default values.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_bind_tries: default_max_bind_tries(),
        }
    }

    /// Set the maximum number of bind attempts.
    #[must_use]
    pub const fn with_max_bind_tries(mut self, tries: u32) -> Self {
        self.max_bind_tries = tries;
        self
    }
}

impl Default for BindingConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a colon-separated MAC address into octets.
#[must_use]
pub fn parse_mac(input: &str) -> Option<[u8; 6]> {
    let mut octets = [0u8; 6];
    let mut parts = input.split(':');
    for octet in &mut octets {
        let part = parts.next()?;
        if part.len() != 2 {
            return None;
        }
        *octet = u8::from_str_radix(part, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(octets)
}

/// Format octets as a lowercase colon-separated MAC address.
#[must_use]
pub fn format_mac(octets: &[u8; 6]) -> String {
    octets
        .iter()
        .map(|octet| format!("{octet:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_new() {
        let config = ControlPlaneConfig::new();
        assert_eq!(config.base_mac, "fa:16:3e:00:00:00");
        assert_eq!(config.mac_generation_retries, 16);
        assert_eq!(config.max_fixed_ips_per_port, 5);
        assert!(!config.ipam.reclaim_on_release);
        assert_eq!(config.binding.max_bind_tries, DEFAULT_MAX_BIND_TRIES);
    }

    #[test]
    fn test_config_builder() {
        let config = ControlPlaneConfig::new()
            .with_base_mac("aa:bb:cc:00:00:00")
            .with_mac_generation_retries(3)
            .with_max_fixed_ips_per_port(2)
            .with_ipam(IpamConfig::new().with_reclaim_on_release(true))
            .with_binding(BindingConfig::new().with_max_bind_tries(4));

        assert_eq!(config.base_mac, "aa:bb:cc:00:00:00");
        assert_eq!(config.mac_generation_retries, 3);
        assert_eq!(config.max_fixed_ips_per_port, 2);
        assert!(config.ipam.reclaim_on_release);
        assert_eq!(config.binding.max_bind_tries, 4);
    }

    #[test]
    fn test_from_json_defaults() {
        let config = ControlPlaneConfig::from_json("{}").unwrap();
        assert_eq!(config, ControlPlaneConfig::default());
    }

    #[test]
    fn test_from_json_overrides() {
        let config = ControlPlaneConfig::from_json(
            r#"{"binding": {"max_bind_tries": 3}, "ipam": {"reclaim_on_release": true}}"#,
        )
        .unwrap();
        assert_eq!(config.binding.max_bind_tries, 3);
        assert!(config.ipam.reclaim_on_release);
    }

    #[test]
    fn test_from_json_malformed() {
        let err = ControlPlaneConfig::from_json("{not json").unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[test]
    fn test_validation_bind_tries_range() {
        let mut config = ControlPlaneConfig::default();
        config.binding.max_bind_tries = 0;
        assert!(config.validate().is_err());

        config.binding.max_bind_tries = 101;
        assert!(config.validate().is_err());

        config.binding.max_bind_tries = 10;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_mac_retries_range() {
        let mut config = ControlPlaneConfig::default();
        config.mac_generation_retries = 0;
        assert!(matches!(
            config.validated().unwrap_err(),
            Error::ValidationError(_)
        ));
    }

    #[test]
    fn test_validation_base_mac_format() {
        let config = ControlPlaneConfig::default().with_base_mac("fa:16:3e:00:00:zz");
        assert!(matches!(
            config.validated().unwrap_err(),
            Error::ConfigError(_)
        ));
    }

    #[test]
    fn test_parse_and_format_mac() {
        let octets = parse_mac("FA:16:3e:0a:00:ff").unwrap();
        assert_eq!(octets, [0xfa, 0x16, 0x3e, 0x0a, 0x00, 0xff]);
        assert_eq!(format_mac(&octets), "fa:16:3e:0a:00:ff");

        assert!(parse_mac("fa:16:3e:00:00").is_none());
        assert!(parse_mac("fa:16:3e:00:00:00:00").is_none());
        assert!(parse_mac("fa-16-3e-00-00-00").is_none());
        assert!(parse_mac("fa:16:3e:0:00:00").is_none());
    }

    #[test]
    fn test_config_serialization() {
        let config = ControlPlaneConfig::new().with_mac_generation_retries(7);
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: ControlPlaneConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, deserialized);
    }
}
