//! Supplier/consumer links and their per-link state.
use crate::{
    device::{DevicePtr, ProbeStatus},
    error::LinkError,
};
use alloc::sync::Arc;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU8, AtomicU32, AtomicUsize, Ordering};
use num_enum::{FromPrimitive, IntoPrimitive};
use utils::{impl_deref, impl_ptr_identity};

bitflags! {
    /// Link behaviour requested by the creator, plus bits maintained by the core.
    pub struct LinkFlags: u32 {
        /// The creator owns a reference and releases it with `remove_link`.
        const STATELESS = 1 << 0;
        /// Delete the link when the consumer unbinds.
        const AUTOREMOVE_CONSUMER = 1 << 1;
        /// Track runtime PM of the consumer on the supplier.
        const PM_RUNTIME = 1 << 2;
        /// Resume the supplier when the link is created.
        const RPM_ACTIVE = 1 << 3;
        /// Delete the link when the supplier unbinds.
        const AUTOREMOVE_SUPPLIER = 1 << 4;
        /// Retry probing the consumer once the supplier binds.
        const AUTOPROBE_CONSUMER = 1 << 5;
        /// The core drives the link state. Set by the core only.
        const MANAGED = 1 << 6;
        /// Only delays the supplier's sync-state; never gates probing.
        const SYNC_STATE_ONLY = 1 << 7;
        /// Created from firmware description rather than by a driver.
        const INFERRED = 1 << 8;
    }
}

/// Flags whose lifetime semantics only make sense for managed links.
pub(crate) fn managed_mask() -> LinkFlags {
    LinkFlags::AUTOREMOVE_CONSUMER
        | LinkFlags::AUTOREMOVE_SUPPLIER
        | LinkFlags::AUTOPROBE_CONSUMER
        | LinkFlags::SYNC_STATE_ONLY
        | LinkFlags::INFERRED
}

pub(crate) fn fw_permissive() -> LinkFlags {
    LinkFlags::INFERRED | LinkFlags::SYNC_STATE_ONLY
}

/// Reject contradictory requests before touching the graph.
pub(crate) fn validate_request(bits: u32) -> Result<LinkFlags, LinkError> {
    let flags = LinkFlags::from_bits(bits).ok_or(LinkError::InvalidFlags)?;
    if flags.contains(LinkFlags::MANAGED) {
        return Err(LinkError::InvalidFlags);
    }
    if flags.contains(LinkFlags::STATELESS) && flags.intersects(managed_mask()) {
        return Err(LinkError::InvalidFlags);
    }
    if flags.contains(LinkFlags::SYNC_STATE_ONLY) && !fw_permissive().contains(flags) {
        return Err(LinkError::InvalidFlags);
    }
    if flags.contains(LinkFlags::AUTOPROBE_CONSUMER)
        && flags.intersects(LinkFlags::AUTOREMOVE_CONSUMER | LinkFlags::AUTOREMOVE_SUPPLIER)
    {
        return Err(LinkError::InvalidFlags);
    }
    Ok(flags)
}

/// Managed link that exists only to delay sync-state (possibly inferred).
pub(crate) fn is_managed_sync_state_only(flags: LinkFlags) -> bool {
    flags - LinkFlags::INFERRED == LinkFlags::SYNC_STATE_ONLY | LinkFlags::MANAGED
}

/// State of a managed link. Stateless links stay [LinkStatus::None].
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum LinkStatus {
    #[default]
    None = 0,
    /// Neither side is ready.
    Dormant = 1,
    /// Supplier is bound; consumer may probe.
    Available = 2,
    /// Consumer is probing.
    ConsumerProbe = 3,
    /// Both sides bound.
    Active = 4,
    /// Supplier is unbinding.
    SupplierUnbind = 5,
}

/// Status of a fresh managed link given the driver state of both ends.
pub fn initial_status(supplier: ProbeStatus, consumer: ProbeStatus) -> LinkStatus {
    match (supplier, consumer) {
        (ProbeStatus::Probing, ProbeStatus::Probing) => LinkStatus::ConsumerProbe,
        (ProbeStatus::Probing, _) => LinkStatus::Dormant,
        (ProbeStatus::DriverBound, ProbeStatus::Probing) => LinkStatus::ConsumerProbe,
        (ProbeStatus::DriverBound, ProbeStatus::DriverBound) => LinkStatus::Active,
        (ProbeStatus::DriverBound, _) => LinkStatus::Available,
        (ProbeStatus::Unbinding, _) => LinkStatus::SupplierUnbind,
        (ProbeStatus::NoDriver, _) => LinkStatus::Dormant,
    }
}

/// An edge from a supplier to a consumer.
///
/// All mutable fields are atomics so that readers may inspect them without the writer section;
/// they are only ever changed by a writer.
pub struct DeviceLink {
    supplier: DevicePtr,
    consumer: DevicePtr,
    flags: AtomicU32,
    status: AtomicU8,
    kref: AtomicUsize,
    rpm_active: AtomicUsize,
}

pub struct LinkPtr {
    inner: Arc<DeviceLink>,
}
impl_deref!(LinkPtr, Arc<DeviceLink>);
impl_ptr_identity!(LinkPtr);

impl LinkPtr {
    pub(crate) fn new(
        supplier: DevicePtr,
        consumer: DevicePtr,
        flags: LinkFlags,
        status: LinkStatus,
    ) -> LinkPtr {
        let rpm_active = if flags.contains(LinkFlags::PM_RUNTIME | LinkFlags::RPM_ACTIVE) {
            2
        } else {
            1
        };
        LinkPtr {
            inner: Arc::new(DeviceLink {
                supplier,
                consumer,
                flags: AtomicU32::new(flags.bits()),
                status: AtomicU8::new(status.into()),
                kref: AtomicUsize::new(1),
                rpm_active: AtomicUsize::new(rpm_active),
            }),
        }
    }
}

impl DeviceLink {
    pub fn supplier(&self) -> &DevicePtr {
        &self.supplier
    }

    pub fn consumer(&self) -> &DevicePtr {
        &self.consumer
    }

    pub fn flags(&self) -> LinkFlags {
        LinkFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn status(&self) -> LinkStatus {
        LinkStatus::from_primitive(self.status.load(Ordering::Acquire))
    }

    pub fn refcount(&self) -> usize {
        self.kref.load(Ordering::Acquire)
    }

    pub fn rpm_active(&self) -> usize {
        self.rpm_active.load(Ordering::Acquire)
    }

    pub fn is_managed(&self) -> bool {
        self.flags().contains(LinkFlags::MANAGED)
    }

    /// The link blocks the consumer from probing and orders the two devices.
    pub fn is_hard(&self) -> bool {
        !self.flags().contains(LinkFlags::SYNC_STATE_ONLY)
    }

    pub(crate) fn set_flags(&self, flags: LinkFlags) {
        self.flags.store(flags.bits(), Ordering::Release);
    }

    pub(crate) fn insert_flags(&self, flags: LinkFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn remove_flags(&self, flags: LinkFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn set_status(&self, status: LinkStatus) {
        self.status.store(status.into(), Ordering::Release);
    }

    pub(crate) fn kref_get(&self) {
        self.kref.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one reference. Returns true when it was the last one.
    pub(crate) fn kref_put(&self) -> bool {
        self.kref.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub(crate) fn rpm_active_get(&self) {
        let _ = self
            .rpm_active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_add(1));
    }
}

impl core::fmt::Debug for DeviceLink {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeviceLink")
            .field("supplier", &self.supplier.name())
            .field("consumer", &self.consumer.name())
            .field("flags", &self.flags())
            .field("status", &self.status())
            .finish()
    }
}

impl core::fmt::Debug for LinkPtr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.inner.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_validation() {
        let ok = [
            LinkFlags::STATELESS,
            LinkFlags::STATELESS | LinkFlags::PM_RUNTIME | LinkFlags::RPM_ACTIVE,
            LinkFlags::AUTOREMOVE_CONSUMER,
            LinkFlags::AUTOREMOVE_SUPPLIER | LinkFlags::AUTOREMOVE_CONSUMER,
            LinkFlags::AUTOPROBE_CONSUMER | LinkFlags::INFERRED,
            LinkFlags::SYNC_STATE_ONLY,
            LinkFlags::SYNC_STATE_ONLY | LinkFlags::INFERRED,
            LinkFlags::empty(),
        ];
        for flags in ok {
            assert_eq!(validate_request(flags.bits()), Ok(flags), "{:?}", flags);
        }

        let bad = [
            LinkFlags::STATELESS | LinkFlags::AUTOREMOVE_CONSUMER,
            LinkFlags::STATELESS | LinkFlags::INFERRED,
            LinkFlags::STATELESS | LinkFlags::SYNC_STATE_ONLY,
            LinkFlags::SYNC_STATE_ONLY | LinkFlags::PM_RUNTIME,
            LinkFlags::SYNC_STATE_ONLY | LinkFlags::AUTOPROBE_CONSUMER,
            LinkFlags::AUTOPROBE_CONSUMER | LinkFlags::AUTOREMOVE_SUPPLIER,
            LinkFlags::AUTOPROBE_CONSUMER | LinkFlags::AUTOREMOVE_CONSUMER,
            LinkFlags::MANAGED,
        ];
        for flags in bad {
            assert_eq!(
                validate_request(flags.bits()),
                Err(LinkError::InvalidFlags),
                "{:?}",
                flags
            );
        }
        assert_eq!(validate_request(1 << 20), Err(LinkError::InvalidFlags));
    }

    #[test]
    fn managed_sync_state_only() {
        let sso = LinkFlags::SYNC_STATE_ONLY | LinkFlags::MANAGED;
        assert!(is_managed_sync_state_only(sso));
        assert!(is_managed_sync_state_only(sso | LinkFlags::INFERRED));
        assert!(!is_managed_sync_state_only(LinkFlags::SYNC_STATE_ONLY));
        assert!(!is_managed_sync_state_only(sso | LinkFlags::AUTOPROBE_CONSUMER));
    }

    #[test]
    fn status_table() {
        use LinkStatus::*;
        use ProbeStatus::*;
        let cases = [
            (Probing, Probing, ConsumerProbe),
            (Probing, NoDriver, Dormant),
            (Probing, DriverBound, Dormant),
            (DriverBound, Probing, ConsumerProbe),
            (DriverBound, DriverBound, Active),
            (DriverBound, NoDriver, Available),
            (DriverBound, Unbinding, Available),
            (Unbinding, DriverBound, SupplierUnbind),
            (Unbinding, NoDriver, SupplierUnbind),
            (NoDriver, DriverBound, Dormant),
            (NoDriver, NoDriver, Dormant),
        ];
        for (sup, con, expected) in cases {
            assert_eq!(initial_status(sup, con), expected, "{:?} -> {:?}", sup, con);
        }
    }

    #[test]
    fn status_round_trips_through_u8() {
        assert_eq!(LinkStatus::from_primitive(4), LinkStatus::Active);
        assert_eq!(LinkStatus::from_primitive(200), LinkStatus::None);
    }
}
