//! Device links: supplier/consumer dependencies between devices.
//!
//! A link tells the driver core that a consumer device needs its supplier. Managed links gate the
//! consumer's probe on the supplier's driver, force consumers off before their supplier unbinds
//! and keep the registration and PM lists ordered so suppliers come first. Links are also inferred
//! from firmware descriptions, see [DeviceLinks::materialize].
//!
//! All state lives in a [DeviceLinks] graph. The driver core drives it through the lifecycle
//! handlers ([DeviceLinks::on_probe_start] and friends) and supplies the services it needs by
//! implementing [DeviceHooks].
#![cfg_attr(not(test), no_std)]
extern crate alloc;

#[macro_use]
mod macros;

pub mod config;
pub mod device;
pub mod error;
pub mod fwnode;
pub mod graph;
pub mod hooks;
pub mod link;

mod fw_devlink;
mod probe;
mod reorder;
mod sync;

#[cfg(test)]
mod tests;

pub use config::{DevlinkConfig, FwDevlinkMode};
pub use device::{Device, DevicePtr, DeviceRef, ProbeStatus};
pub use error::{ConfigError, FwLinkError, LinkError, PmError, ProbeDefer};
pub use fwnode::{FwLink, FwLinkTable, FwNode, FwNodeFlags, FwNodePtr, FwNodeRef};
pub use graph::{DeviceLinks, LinksState};
pub use hooks::{DeviceHooks, DeviceList, DpmOrder};
pub use link::{DeviceLink, LinkFlags, LinkPtr, LinkStatus, initial_status};
