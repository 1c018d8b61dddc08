//! Core plugin for netplane.
//!
//! [`CorePlugin`] owns no state of its own: it composes an [`IpamStore`], a
//! [`PortStore`], the mechanism driver registry and a notifier into network,
//! subnet and port operations, allocating addresses before handing ports to
//! the binder.
//!
//! [`IpamStore`]: netplane_ipam::IpamStore
//! [`PortStore`]: netplane_binding::PortStore

#![deny(missing_docs)]

mod agent;
pub mod mac;
pub mod models;
mod plugin;

pub use mac::MacGenerator;
pub use models::{CreateNetworkRequest, CreatePortRequest, PortDetails, UpdatePortRequest};
pub use plugin::CorePlugin;

/// Convenient result alias sharing the `netplane-core` error type.
pub type Result<T> = netplane_core::Result<T>;
