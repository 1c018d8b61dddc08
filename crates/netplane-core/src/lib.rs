//! # netplane-core
//!
//! Core types and utilities shared by the netplane control plane.
//!
//! This crate provides the error type, strongly-typed identifiers, the shared
//! network/port domain model, configuration, and the per-process named locks
//! that the IPAM engine and the port binding protocol build on.
//!
//! ## Modules
//!
//! - [`error`] - Error taxonomy and machine-readable error codes
//! - [`uuid`] - Strongly-typed UUID wrappers for control-plane resources
//! - [`types`] - Networks, segments, ports and IP versions
//! - [`config`] - Control-plane configuration and validation
//! - [`lock`] - Named in-process locks serializing critical sections

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod lock;
pub mod types;
pub mod uuid;

// Re-export commonly used types
pub use error::{Error, Result};
