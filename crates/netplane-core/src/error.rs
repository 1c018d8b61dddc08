//! Error types for control-plane operations.
//!
//! Caller errors (validation, uniqueness) and exhausted retry bounds are
//! surfaced through [`Error`]. Lost races and concurrently deleted rows are not
//! errors; they are modelled as ordinary outcomes by the subsystems that retry
//! them.

use std::net::IpAddr;

use serde::Serialize;
use thiserror::Error;

use crate::uuid::NetworkId;

/// Main error type for control-plane operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Malformed or semantically invalid request
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// No free address in any candidate subnet, even after a rebuild
    #[error("No more IP addresses available on network {network_id}")]
    IpAddressGenerationFailure {
        /// Network the candidate subnets belong to
        network_id: NetworkId,
    },

    /// Explicitly requested address is already allocated
    #[error("IP address {ip_address} already allocated on network {network_id}")]
    IpAddressInUse {
        /// Network of the subnet holding the address
        network_id: NetworkId,
        /// Requested address
        ip_address: IpAddr,
    },

    /// Explicitly requested MAC address is already used on the network
    #[error("MAC address {mac_address} already in use on network {network_id}")]
    MacAddressInUse {
        /// Network the port belongs to
        network_id: NetworkId,
        /// Requested MAC address
        mac_address: String,
    },

    /// Every generated MAC address collided with an existing one
    #[error("Unable to generate a unique MAC address on network {network_id}")]
    MacAddressGenerationFailure {
        /// Network the port belongs to
        network_id: NetworkId,
    },

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource is still referenced and cannot be removed
    #[error("In use: {0}")]
    InUse(String),

    /// A mechanism driver rejected an operation
    #[error("Mechanism driver {driver} failed in {method}: {message}")]
    MechanismDriver {
        /// Driver name
        driver: String,
        /// Hook that failed
        method: String,
        /// Error message
        message: String,
    },

    /// Invalid UUID format
    #[error("Invalid UUID: {0}")]
    InvalidUuid(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Backing store failure
    #[error("Store error: {0}")]
    StoreError(String),

    /// Internal error
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Specialized result type for control-plane operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Structured error response for serialization by an API layer.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ErrorResponse {
    /// Error details
    pub error: ErrorDetail,
    /// Optional request ID for tracing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Error detail structure.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ErrorDetail {
    /// Error code for programmatic handling
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Additional error details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl Error {
    /// Returns the error code for this error type.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::IpAddressGenerationFailure { .. } => "IP_ADDRESS_GENERATION_FAILURE",
            Self::IpAddressInUse { .. } => "IP_ADDRESS_IN_USE",
            Self::MacAddressInUse { .. } => "MAC_ADDRESS_IN_USE",
            Self::MacAddressGenerationFailure { .. } => "MAC_ADDRESS_GENERATION_FAILURE",
            Self::NotFound(_) => "NOT_FOUND",
            Self::InUse(_) => "IN_USE",
            Self::MechanismDriver { .. } => "MECHANISM_DRIVER_ERROR",
            Self::InvalidUuid(_) => "INVALID_UUID",
            Self::ConfigError(_) => "CONFIG_ERROR",
            Self::ValidationError(_) => "VALIDATION_ERROR",
            Self::StoreError(_) => "STORE_ERROR",
            Self::InternalError(_) => "INTERNAL_ERROR",
        }
    }

    /// Converts the error into an `ErrorResponse`.
    #[must_use]
    pub fn into_error_response(self) -> ErrorResponse {
        self.into_error_response_with_id(None)
    }

    /// Converts the error into an `ErrorResponse` with a request ID.
    #[must_use]
    pub fn into_error_response_with_id(self, request_id: Option<String>) -> ErrorResponse {
        let details = match &self {
            Self::IpAddressInUse { ip_address, .. } => {
                Some(serde_json::json!({ "ip_address": ip_address.to_string() }))
            }
            Self::MacAddressInUse { mac_address, .. } => {
                Some(serde_json::json!({ "mac_address": mac_address }))
            }
            _ => None,
        };

        ErrorResponse {
            error: ErrorDetail {
                code: self.error_code().to_string(),
                message: self.to_string(),
                details,
            },
            request_id,
        }
    }

    /// Returns true if this error should be logged as a serious error.
    #[must_use]
    pub const fn should_log(&self) -> bool {
        matches!(
            self,
            Self::InternalError(_)
                | Self::ConfigError(_)
                | Self::StoreError(_)
                | Self::MechanismDriver { .. }
        )
    }

    /// Returns true for errors caused by the request itself; retrying the same
    /// request cannot succeed.
    #[must_use]
    pub const fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput(_)
                | Self::IpAddressInUse { .. }
                | Self::MacAddressInUse { .. }
                | Self::InvalidUuid(_)
                | Self::ValidationError(_)
        )
    }
}

// Conversions from external error types
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::ConfigError(err.to_string())
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(err: validator::ValidationErrors) -> Self {
        Self::ValidationError(err.to_string())
    }
}

impl From<uuid::Error> for Error {
    fn from(err: uuid::Error) -> Self {
        Self::InvalidUuid(err.to_string())
    }
}

impl From<ipnetwork::IpNetworkError> for Error {
    fn from(err: ipnetwork::IpNetworkError) -> Self {
        Self::InvalidInput(err.to_string())
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(err: std::net::AddrParseError) -> Self {
        Self::InvalidInput(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network() -> NetworkId {
        NetworkId::new_v4()
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            Error::InvalidInput("test".to_string()).error_code(),
            "INVALID_INPUT"
        );
        assert_eq!(
            Error::IpAddressGenerationFailure {
                network_id: network()
            }
            .error_code(),
            "IP_ADDRESS_GENERATION_FAILURE"
        );
        assert_eq!(
            Error::IpAddressInUse {
                network_id: network(),
                ip_address: "10.0.0.2".parse().unwrap()
            }
            .error_code(),
            "IP_ADDRESS_IN_USE"
        );
        assert_eq!(
            Error::MacAddressInUse {
                network_id: network(),
                mac_address: "fa:16:3e:00:00:01".to_string()
            }
            .error_code(),
            "MAC_ADDRESS_IN_USE"
        );
        assert_eq!(
            Error::MacAddressGenerationFailure {
                network_id: network()
            }
            .error_code(),
            "MAC_ADDRESS_GENERATION_FAILURE"
        );
        assert_eq!(
            Error::NotFound("test".to_string()).error_code(),
            "NOT_FOUND"
        );
        assert_eq!(Error::InUse("test".to_string()).error_code(), "IN_USE");
        assert_eq!(
            Error::MechanismDriver {
                driver: "ovs".to_string(),
                method: "update_port_precommit".to_string(),
                message: "boom".to_string()
            }
            .error_code(),
            "MECHANISM_DRIVER_ERROR"
        );
        assert_eq!(
            Error::StoreError("test".to_string()).error_code(),
            "STORE_ERROR"
        );
    }

    #[test]
    fn test_error_display() {
        let id = network();
        let err = Error::IpAddressGenerationFailure { network_id: id };
        assert_eq!(
            err.to_string(),
            format!("No more IP addresses available on network {id}")
        );

        let err = Error::MechanismDriver {
            driver: "ovs".to_string(),
            method: "update_port_precommit".to_string(),
            message: "agent down".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Mechanism driver ovs failed in update_port_precommit: agent down"
        );
    }

    #[test]
    fn test_into_error_response() {
        let err = Error::NotFound("port 123".to_string());
        let response = err.clone().into_error_response();

        assert_eq!(response.error.code, "NOT_FOUND");
        assert_eq!(response.error.message, "Not found: port 123");
        assert!(response.error.details.is_none());
        assert!(response.request_id.is_none());

        let response_with_id = err.into_error_response_with_id(Some("req-456".to_string()));
        assert_eq!(response_with_id.request_id, Some("req-456".to_string()));
    }

    #[test]
    fn test_in_use_response_carries_address() {
        let err = Error::IpAddressInUse {
            network_id: network(),
            ip_address: "10.0.0.4".parse().unwrap(),
        };
        let response = err.into_error_response();
        let details = response.error.details.unwrap();
        assert_eq!(details["ip_address"], "10.0.0.4");
    }

    #[test]
    fn test_should_log() {
        assert!(Error::InternalError("test".to_string()).should_log());
        assert!(Error::StoreError("test".to_string()).should_log());
        assert!(!Error::InvalidInput("test".to_string()).should_log());
        assert!(!Error::IpAddressGenerationFailure {
            network_id: network()
        }
        .should_log());
    }

    #[test]
    fn test_caller_errors() {
        assert!(Error::InvalidInput("cidr".to_string()).is_caller_error());
        assert!(Error::MacAddressInUse {
            network_id: network(),
            mac_address: "fa:16:3e:00:00:01".to_string()
        }
        .is_caller_error());
        assert!(!Error::IpAddressGenerationFailure {
            network_id: network()
        }
        .is_caller_error());
    }

    #[test]
    fn test_from_uuid_error() {
        let err = uuid::Uuid::parse_str("not-a-uuid").unwrap_err();
        let converted: Error = err.into();
        assert!(matches!(converted, Error::InvalidUuid(_)));
    }

    #[test]
    fn test_from_ipnetwork_error() {
        let err = "10.0.0.0/33".parse::<ipnetwork::IpNetwork>().unwrap_err();
        let converted: Error = err.into();
        assert!(matches!(converted, Error::InvalidInput(_)));
    }

    #[test]
    fn test_from_addr_parse_error() {
        let err = "10.0.0.300".parse::<IpAddr>().unwrap_err();
        let converted: Error = err.into();
        assert_eq!(converted.error_code(), "INVALID_INPUT");
    }

    #[test]
    fn test_error_response_serialization_no_request_id() {
        let response = Error::InUse("subnet".to_string()).into_error_response();
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("IN_USE"));
        assert!(!json.contains("request_id"));
        assert!(!json.contains("details"));
    }
}
