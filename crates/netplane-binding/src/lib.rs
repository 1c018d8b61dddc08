//! Port binding for netplane.
//!
//! A binding is negotiated against the mechanism drivers outside any lock and
//! then committed under the port lock only if the host, vnic type and profile
//! it was negotiated for are still the live ones. Lost races are retried a
//! bounded number of times; see [`PortBinder::bind_port_if_needed`].

#![deny(missing_docs)]

pub mod binder;
pub mod driver;
pub mod memory;
pub mod models;
pub mod notifier;
pub mod store;

pub use binder::{CommitOutcome, PortBinder};
pub use driver::{MechanismDriver, MechanismManager};
pub use memory::MemoryPortStore;
pub use models::{BindResult, PortBinding, PortContext, VifType, VnicType};
pub use notifier::{ChannelNotifier, PortEvent, PortNotifier};
pub use store::{PortStore, PortTransaction};

/// Convenient result alias sharing the `netplane-core` error type.
pub type Result<T> = netplane_core::Result<T>;
