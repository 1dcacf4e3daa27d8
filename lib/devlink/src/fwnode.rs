//! Firmware description nodes and the pending edges declared between them.
//!
//! A firmware node describes hardware that may or may not end up with a [crate::Device]. Supplier
//! references found in the description become [FwLink]s, which wait in a [FwLinkTable] until
//! both ends have devices and a real link can be created.
use crate::device::{DevicePtr, DeviceRef};
use alloc::{
    boxed::Box,
    sync::{Arc, Weak},
    vec,
    vec::Vec,
};
use bitflags::bitflags;
use core::sync::atomic::{AtomicU8, Ordering};
use spin::RwLock;
use utils::{impl_conversion, impl_deref, impl_ptr_identity};

bitflags! {
    pub struct FwNodeFlags: u8 {
        /// Supplier references have been turned into pending edges.
        const LINKS_ADDED = 1 << 0;
        /// No device will ever be created for this node.
        const NOT_DEVICE = 1 << 1;
        /// Initialized by something other than a driver bound through the core.
        const INITIALIZED = 1 << 2;
    }
}

pub struct FwNode {
    name: Box<str>,
    parent: Option<FwNodeRef>,
    children: RwLock<Vec<FwNodePtr>>,
    flags: AtomicU8,
    dev: RwLock<Option<DeviceRef>>,
    supplier_refs: RwLock<Vec<FwNodeRef>>,
}

pub struct FwNodePtr {
    inner: Arc<FwNode>,
}
impl_deref!(FwNodePtr, Arc<FwNode>);
impl_conversion!(FwNodePtr, Arc<FwNode>);
impl_ptr_identity!(FwNodePtr);

#[derive(Clone)]
pub struct FwNodeRef {
    inner: Weak<FwNode>,
}
impl_deref!(FwNodeRef, Weak<FwNode>);
impl_conversion!(FwNodeRef, Weak<FwNode>);

impl FwNodeRef {
    pub fn get_handle(&self) -> Option<FwNodePtr> {
        self.inner.upgrade().map(FwNodePtr::from)
    }

    fn is(&self, node: &FwNodePtr) -> bool {
        core::ptr::eq(self.inner.as_ptr(), Arc::as_ptr(&node.inner))
    }
}

impl FwNodePtr {
    pub fn new_root(name: &str) -> FwNodePtr {
        FwNodePtr::build(name, None)
    }

    pub fn new_child(&self, name: &str) -> FwNodePtr {
        let node = FwNodePtr::build(name, Some(self.create_ref()));
        self.children.write().push(node.clone());
        node
    }

    fn build(name: &str, parent: Option<FwNodeRef>) -> FwNodePtr {
        FwNodePtr::from(Arc::new(FwNode {
            name: Box::from(name),
            parent,
            children: RwLock::new(vec![]),
            flags: AtomicU8::new(0),
            dev: RwLock::new(None),
            supplier_refs: RwLock::new(vec![]),
        }))
    }

    pub fn create_ref(&self) -> FwNodeRef {
        FwNodeRef::from(Arc::downgrade(self))
    }

    /// Declare that the firmware lists `supplier` as providing a resource to this node.
    pub fn add_supplier_ref(&self, supplier: &FwNodePtr) {
        self.supplier_refs.write().push(supplier.create_ref());
    }

    /// Whether `self` is `other` or one of its ancestors.
    pub fn is_ancestor_of(&self, other: &FwNodePtr) -> bool {
        let mut cur = Some(other.clone());
        while let Some(node) = cur {
            if node == *self {
                return true;
            }
            cur = node.parent();
        }
        false
    }

    /// Device of the closest strict ancestor that has one.
    pub fn parent_device(&self) -> Option<DevicePtr> {
        let mut cur = self.parent();
        while let Some(node) = cur {
            if let Some(dev) = node.device() {
                return Some(dev);
            }
            cur = node.parent();
        }
        None
    }
}

impl FwNode {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<FwNodePtr> {
        self.parent.as_ref().and_then(FwNodeRef::get_handle)
    }

    pub fn children(&self) -> Vec<FwNodePtr> {
        self.children.read().clone()
    }

    pub fn flags(&self) -> FwNodeFlags {
        FwNodeFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn insert_flags(&self, flags: FwNodeFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// The device created for this node, if it still exists.
    pub fn device(&self) -> Option<DevicePtr> {
        self.dev.read().as_ref().and_then(DeviceRef::get_handle)
    }

    pub(crate) fn set_device(&self, dev: Option<DeviceRef>) {
        *self.dev.write() = dev;
    }

    /// Whether `dev` is the device created for this node.
    pub fn is_device(&self, dev: &DevicePtr) -> bool {
        self.device().is_some_and(|d| d == *dev)
    }

    /// Declared suppliers that still exist.
    pub fn supplier_refs(&self) -> Vec<FwNodePtr> {
        self.supplier_refs
            .read()
            .iter()
            .filter_map(FwNodeRef::get_handle)
            .collect()
    }
}

impl core::fmt::Debug for FwNode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FwNode")
            .field("name", &self.name)
            .field("flags", &self.flags())
            .finish()
    }
}

impl core::fmt::Debug for FwNodePtr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.inner.fmt(f)
    }
}

impl core::fmt::Debug for FwNodeRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.get_handle() {
            Some(node) => write!(f, "FwNodeRef({})", node.name()),
            None => f.write_str("FwNodeRef(<gone>)"),
        }
    }
}

/// Firmware-declared dependency of `consumer` on `supplier`, waiting for devices.
#[derive(Debug, Clone)]
pub struct FwLink {
    pub supplier: FwNodePtr,
    pub consumer: FwNodePtr,
}

/// All pending firmware edges, plus the pairs found to be permanently invalid.
#[derive(Debug, Default)]
pub struct FwLinkTable {
    links: Vec<FwLink>,
    invalid: Vec<(FwNodeRef, FwNodeRef)>,
}

impl FwLinkTable {
    /// Add `consumer -> supplier`. Duplicates and pairs recorded invalid are ignored.
    ///
    /// Returns whether a new edge was added.
    pub fn add(&mut self, consumer: &FwNodePtr, supplier: &FwNodePtr) -> bool {
        if self.is_invalid(consumer, supplier) || self.contains(consumer, supplier) {
            return false;
        }
        self.links.push(FwLink {
            supplier: supplier.clone(),
            consumer: consumer.clone(),
        });
        true
    }

    pub fn contains(&self, consumer: &FwNodePtr, supplier: &FwNodePtr) -> bool {
        self.links
            .iter()
            .any(|l| l.consumer == *consumer && l.supplier == *supplier)
    }

    pub fn is_invalid(&self, consumer: &FwNodePtr, supplier: &FwNodePtr) -> bool {
        self.invalid
            .iter()
            .any(|(c, s)| c.is(consumer) && s.is(supplier))
    }

    pub fn has_suppliers(&self, consumer: &FwNodePtr) -> bool {
        self.links.iter().any(|l| l.consumer == *consumer)
    }

    /// Pending edges in which `consumer` is the consumer.
    pub fn suppliers_of(&self, consumer: &FwNodePtr) -> Vec<FwLink> {
        self.links
            .iter()
            .filter(|l| l.consumer == *consumer)
            .cloned()
            .collect()
    }

    /// Pending edges in which `supplier` is the supplier.
    pub fn consumers_of(&self, supplier: &FwNodePtr) -> Vec<FwLink> {
        self.links
            .iter()
            .filter(|l| l.supplier == *supplier)
            .cloned()
            .collect()
    }

    pub fn remove(&mut self, consumer: &FwNodePtr, supplier: &FwNodePtr) {
        self.links
            .retain(|l| !(l.consumer == *consumer && l.supplier == *supplier));
    }

    /// Remove the edge and never accept the pair again.
    pub fn discard_invalid(&mut self, consumer: &FwNodePtr, supplier: &FwNodePtr) {
        self.remove(consumer, supplier);
        self.invalid.retain(|(c, s)| c.strong_count() > 0 && s.strong_count() > 0);
        if !self.is_invalid(consumer, supplier) {
            self.invalid.push((consumer.create_ref(), supplier.create_ref()));
        }
    }

    pub fn purge_suppliers(&mut self, consumer: &FwNodePtr) {
        self.links.retain(|l| l.consumer != *consumer);
    }

    pub fn purge_consumers(&mut self, supplier: &FwNodePtr) {
        self.links.retain(|l| l.supplier != *supplier);
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}
