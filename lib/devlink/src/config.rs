//! Boot-time configuration of the link core.
//!
//! The defaults match a kernel booted without any `fw_devlink` arguments.
use crate::{error::ConfigError, link::LinkFlags};
use core::str::FromStr;

/// How links inferred from firmware are created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FwDevlinkMode {
    /// Firmware edges are never materialized.
    Off,
    /// Inferred links only delay sync-state, never probing.
    Permissive,
    /// Inferred links gate probing and re-probe consumers.
    #[default]
    On,
    /// [FwDevlinkMode::On] plus runtime PM tracking.
    Rpm,
}

impl FwDevlinkMode {
    /// Flags given to links created from firmware edges.
    pub fn flags(self) -> LinkFlags {
        match self {
            FwDevlinkMode::Off => LinkFlags::empty(),
            FwDevlinkMode::Permissive => crate::link::fw_permissive(),
            FwDevlinkMode::On => LinkFlags::INFERRED | LinkFlags::AUTOPROBE_CONSUMER,
            FwDevlinkMode::Rpm => {
                LinkFlags::INFERRED | LinkFlags::AUTOPROBE_CONSUMER | LinkFlags::PM_RUNTIME
            }
        }
    }
}

impl FromStr for FwDevlinkMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(FwDevlinkMode::Off),
            "permissive" => Ok(FwDevlinkMode::Permissive),
            "on" => Ok(FwDevlinkMode::On),
            "rpm" => Ok(FwDevlinkMode::Rpm),
            _ => Err(ConfigError::UnknownMode),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DevlinkConfig {
    pub fw_devlink: FwDevlinkMode,
    pub strict: bool,
    /// Start with sync-state paused; the platform resumes it once initial probing is done.
    pub defer_sync_state: bool,
}

impl DevlinkConfig {
    /// Parse the recognised `key=value` tokens of a kernel command line.
    ///
    /// Besides `fw_devlink=` and `fw_devlink.strict=`, this accepts
    /// `fw_devlink.sync_state=deferred|immediate`, an extension with no kernel counterpart: the
    /// kernel always boots with sync-state paused. Here it is not paused unless asked for.
    ///
    /// Unrelated tokens are skipped. A recognised key with a bad value is an error.
    pub fn from_cmdline(cmdline: &str) -> Result<DevlinkConfig, ConfigError> {
        let mut config = DevlinkConfig::default();
        for token in cmdline.split_ascii_whitespace() {
            let Some((key, value)) = token.split_once('=') else {
                continue;
            };
            match key {
                "fw_devlink" => config.fw_devlink = value.parse()?,
                "fw_devlink.strict" => config.strict = parse_bool(value)?,
                "fw_devlink.sync_state" => {
                    config.defer_sync_state = match value {
                        "deferred" => true,
                        "immediate" => false,
                        _ => return Err(ConfigError::UnknownSyncState),
                    }
                }
                _ => {}
            }
        }
        Ok(config)
    }

    pub fn is_permissive(&self) -> bool {
        self.fw_devlink == FwDevlinkMode::Permissive
    }

    /// Strict mode has no effect while firmware links are permissive.
    pub fn is_strict(&self) -> bool {
        self.strict && !self.is_permissive()
    }
}

fn parse_bool(value: &str) -> Result<bool, ConfigError> {
    match value {
        "1" | "y" | "Y" | "yes" | "on" | "true" => Ok(true),
        "0" | "n" | "N" | "no" | "off" | "false" => Ok(false),
        _ => Err(ConfigError::InvalidBool),
    }
}
