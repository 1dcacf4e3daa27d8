use core::fmt::{Display, Formatter};

/// Reasons for [crate::DeviceLinks::add_link] and [crate::DeviceLinks::remove_link] to refuse
/// a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    /// The flag combination is contradictory or contains unknown bits.
    InvalidFlags,
    /// Consumer and supplier are the same device.
    SelfLink,
    /// The supplier is not (or no longer) registered with power management.
    SupplierNotRegistered,
    /// The supplier already depends on the consumer.
    Cycle,
    /// A sync-state-only link was requested for a consumer that already has a driver.
    ConsumerBound,
    /// Resuming the supplier failed.
    PmRuntime(PmError),
    /// Only stateless links may be released by their creator.
    Managed,
    /// No link between the two devices.
    NotFound,
}

impl Display for LinkError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            LinkError::InvalidFlags => f.write_str("invalid link flags"),
            LinkError::SelfLink => f.write_str("a device cannot link to itself"),
            LinkError::SupplierNotRegistered => f.write_str("supplier is not registered"),
            LinkError::Cycle => f.write_str("link would create a dependency cycle"),
            LinkError::ConsumerBound => f.write_str("consumer is already bound"),
            LinkError::PmRuntime(err) => write!(f, "runtime PM failure: {}", err),
            LinkError::Managed => f.write_str("managed links cannot be released directly"),
            LinkError::NotFound => f.write_str("no such link"),
        }
    }
}

impl core::error::Error for LinkError {}

/// Runtime PM failure reported by [crate::DeviceHooks::pm_runtime_get_sync].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmError {
    pub info: &'static str,
}

impl Display for PmError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.info)
    }
}

impl core::error::Error for PmError {}

/// Why a consumer may not probe yet. The caller is expected to retry later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeDefer {
    /// Firmware still describes suppliers that have no device.
    WaitingForSupplier,
    /// A managed supplier link is not [crate::LinkStatus::Available].
    SupplierNotReady,
}

impl Display for ProbeDefer {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            ProbeDefer::WaitingForSupplier => f.write_str("waiting for supplier to be added"),
            ProbeDefer::SupplierNotReady => f.write_str("supplier not ready"),
        }
    }
}

impl core::error::Error for ProbeDefer {}

/// Outcome of turning a pending firmware edge into a device link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FwLinkError {
    /// The edge can never become a link; drop it.
    Invalid,
    /// The supplier device does not exist yet; keep the edge.
    Again,
}

impl Display for FwLinkError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            FwLinkError::Invalid => f.write_str("firmware link is invalid"),
            FwLinkError::Again => f.write_str("supplier not present yet"),
        }
    }
}

impl core::error::Error for FwLinkError {}

/// Malformed boot argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    UnknownMode,
    InvalidBool,
    UnknownSyncState,
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            ConfigError::UnknownMode => f.write_str("unknown fw_devlink mode"),
            ConfigError::InvalidBool => f.write_str("expected a boolean"),
            ConfigError::UnknownSyncState => f.write_str("unknown fw_devlink.sync_state value"),
        }
    }
}

impl core::error::Error for ConfigError {}
