//! Device nodes as seen by the link core.
use crate::{fwnode::FwNodePtr, link::LinkPtr};
use alloc::{
    boxed::Box,
    sync::{Arc, Weak},
    vec,
    vec::Vec,
};
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use num_enum::{FromPrimitive, IntoPrimitive};
use spin::RwLock;
use utils::{
    impl_conversion, impl_deref, impl_ptr_identity,
    rcu::{RcuCell, RcuGuard},
};

/// Driver binding state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ProbeStatus {
    #[default]
    NoDriver = 0,
    Probing = 1,
    DriverBound = 2,
    Unbinding = 3,
}

/// Link bookkeeping embedded in every device.
///
/// Both adjacency vectors are replaced as a whole under the writer section and read through
/// a reader ticket or the writer guard.
pub struct DevLinksInfo {
    suppliers: RcuCell<Vec<LinkPtr>>,
    consumers: RcuCell<Vec<LinkPtr>>,
    status: AtomicU8,
    /// The sync-state callback has been queued once and never will be again.
    state_synced: AtomicBool,
    /// Parked on the holding queue while sync-state is paused.
    defer_sync: AtomicBool,
}

pub struct Device {
    name: Box<str>,
    parent: RwLock<Option<DeviceRef>>,
    children: RwLock<Vec<DevicePtr>>,
    fwnode: Option<FwNodePtr>,
    pub(crate) links: DevLinksInfo,
}

/// Strong handle to a device. Supplier and consumer ends of a link are held this way, so a
/// device stays alive while any link touching it does.
pub struct DevicePtr {
    inner: Arc<Device>,
}
impl_deref!(DevicePtr, Arc<Device>);
impl_conversion!(DevicePtr, Arc<Device>);
impl_ptr_identity!(DevicePtr);

/// Weak back-reference, used for parents.
#[derive(Clone)]
pub struct DeviceRef {
    inner: Weak<Device>,
}
impl_deref!(DeviceRef, Weak<Device>);
impl_conversion!(DeviceRef, Weak<Device>);

impl DeviceRef {
    pub fn get_handle(&self) -> Option<DevicePtr> {
        self.inner.upgrade().map(DevicePtr::from)
    }
}

impl DevicePtr {
    /// Create a root device, optionally described by `fwnode`.
    pub fn new(name: &str, fwnode: Option<FwNodePtr>) -> DevicePtr {
        DevicePtr::build(name, None, fwnode)
    }

    /// Create a device below `self` and register it as a child.
    pub fn new_child(&self, name: &str, fwnode: Option<FwNodePtr>) -> DevicePtr {
        let dev = DevicePtr::build(name, Some(self.create_ref()), fwnode);
        self.children.write().push(dev.clone());
        dev
    }

    fn build(name: &str, parent: Option<DeviceRef>, fwnode: Option<FwNodePtr>) -> DevicePtr {
        let dev = DevicePtr::from(Arc::new(Device {
            name: Box::from(name),
            parent: RwLock::new(parent),
            children: RwLock::new(vec![]),
            fwnode,
            links: DevLinksInfo {
                suppliers: RcuCell::new(vec![]),
                consumers: RcuCell::new(vec![]),
                status: AtomicU8::new(ProbeStatus::NoDriver.into()),
                state_synced: AtomicBool::new(false),
                defer_sync: AtomicBool::new(false),
            },
        }));
        if let Some(fw) = &dev.fwnode {
            if fw.device().is_none() {
                fw.set_device(Some(dev.create_ref()));
            }
        }
        dev
    }

    pub fn create_ref(&self) -> DeviceRef {
        DeviceRef::from(Arc::downgrade(self))
    }

    /// Move `self` below `parent` (or make it a root). Only the tree is updated.
    pub(crate) fn set_parent(&self, parent: Option<&DevicePtr>) {
        if let Some(old) = self.parent() {
            old.children.write().retain(|c| c != self);
        }
        if let Some(new) = parent {
            new.children.write().push(self.clone());
        }
        *self.parent.write() = parent.map(DevicePtr::create_ref);
    }
}

impl Device {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<DevicePtr> {
        self.parent.read().as_ref().and_then(DeviceRef::get_handle)
    }

    /// Snapshot of the children.
    pub fn children(&self) -> Vec<DevicePtr> {
        self.children.read().clone()
    }

    pub fn fwnode(&self) -> Option<&FwNodePtr> {
        self.fwnode.as_ref()
    }

    pub fn probe_status(&self) -> ProbeStatus {
        ProbeStatus::from_primitive(self.links.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_probe_status(&self, status: ProbeStatus) {
        self.links.status.store(status.into(), Ordering::Release);
    }

    /// Links in which this device is the consumer, oldest first.
    pub fn suppliers<'a, G: RcuGuard>(&'a self, guard: &'a G) -> &'a [LinkPtr] {
        self.links.suppliers.get(guard)
    }

    /// Links in which this device is the supplier, oldest first.
    pub fn consumers<'a, G: RcuGuard>(&'a self, guard: &'a G) -> &'a [LinkPtr] {
        self.links.consumers.get(guard)
    }

    pub(crate) fn suppliers_cell(&self) -> &RcuCell<Vec<LinkPtr>> {
        &self.links.suppliers
    }

    pub(crate) fn consumers_cell(&self) -> &RcuCell<Vec<LinkPtr>> {
        &self.links.consumers
    }

    pub fn state_synced(&self) -> bool {
        self.links.state_synced.load(Ordering::Acquire)
    }

    pub(crate) fn set_state_synced(&self) {
        self.links.state_synced.store(true, Ordering::Release);
    }

    pub(crate) fn defer_sync(&self) -> bool {
        self.links.defer_sync.load(Ordering::Acquire)
    }

    pub(crate) fn set_defer_sync(&self, value: bool) {
        self.links.defer_sync.store(value, Ordering::Release);
    }

    /// Whether `self` is `other` or one of its ancestors.
    pub fn is_ancestor_of(&self, other: &DevicePtr) -> bool {
        let mut cur = Some(other.clone());
        while let Some(dev) = cur {
            if core::ptr::eq(&**dev, self) {
                return true;
            }
            cur = dev.parent();
        }
        false
    }
}

impl core::fmt::Debug for Device {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("status", &self.probe_status())
            .finish()
    }
}

impl core::fmt::Debug for DevicePtr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.inner.fmt(f)
    }
}
