//! Services the link core needs from the rest of the driver model.
use crate::{device::DevicePtr, error::PmError, link::LinkPtr};

/// The two externally owned device orderings kept consistent with links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceList {
    /// Registration order, used for shutdown.
    Kset,
    /// Power-management order, used for suspend and resume.
    Dpm,
}

/// How [crate::DeviceLinks::move_device] reorders the PM list after re-parenting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DpmOrder {
    None,
    /// Place the device right after its new parent.
    DevAfterParent,
    /// Place the new parent right before the device.
    ParentBeforeDev,
    /// Move the device and everything depending on it to the end.
    DevLast,
}

/// Collaborator interface implemented by the device registry, PM core and probe scheduler.
///
/// Only [DeviceHooks::sync_state], [DeviceHooks::pm_runtime_get_sync],
/// [DeviceHooks::pm_runtime_put], [DeviceHooks::wait_for_device_probe] and
/// [DeviceHooks::release_driver] are called outside the writer section. Every other hook runs
/// inside it and must not call back into [crate::DeviceLinks].
pub trait DeviceHooks: Send + Sync {
    /// The device is on the registration list.
    fn is_registered(&self, dev: &DevicePtr) -> bool;
    /// The device is known to power management. Links may only point to such suppliers.
    fn is_pm_initialized(&self, dev: &DevicePtr) -> bool;
    /// The bound driver implements the sync-state callback.
    fn has_sync_state(&self, dev: &DevicePtr) -> bool;
    /// Invoke the sync-state callback. Called once per device at most.
    fn sync_state(&self, dev: &DevicePtr);

    fn move_last(&self, list: DeviceList, dev: &DevicePtr);
    fn move_before(&self, list: DeviceList, dev: &DevicePtr, pos: &DevicePtr);
    fn move_after(&self, list: DeviceList, dev: &DevicePtr, pos: &DevicePtr);

    /// Put the consumer back on the deferred probe list.
    fn request_probe_retry(&self, dev: &DevicePtr);

    /// Runtime-resume a supplier whose consumer is probing.
    fn resume_supplier(&self, _dev: &DevicePtr) {}

    fn pm_runtime_get_sync(&self, _dev: &DevicePtr) -> Result<(), PmError> {
        Ok(())
    }

    fn pm_runtime_put(&self, _dev: &DevicePtr) {}

    /// A runtime-PM link to this consumer appeared.
    fn pm_runtime_new_link(&self, _dev: &DevicePtr) {}

    /// A runtime-PM link is going away or losing its PM role.
    fn pm_runtime_drop_link(&self, _link: &LinkPtr) {}

    /// Block until no probe is in progress. Called without the writer section.
    fn wait_for_device_probe(&self) {}

    /// Unbind the driver of `dev`. Called without the writer section.
    fn release_driver(&self, _dev: &DevicePtr) {}

    /// Whether any registered driver can ever bind to `dev`.
    fn can_match(&self, _dev: &DevicePtr) -> bool {
        true
    }
}
