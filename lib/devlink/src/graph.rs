//! The link store and the graph context everything else hangs off.
//!
//! Locking:
//! - Every mutation of links, link state and the sync-state queues happens inside the writer
//!   section of the graph's RCU domain. The section may be held across a whole cascade of
//!   updates and across calls to the ordering hooks.
//! - Adjacency vectors are published through RCU cells. Readers take a ticket with
//!   [DeviceLinks::read_lock] and walk them without ever waiting for a writer.
//! - The pending firmware-edge table has its own lock. When both are needed, the table is
//!   locked first.
use crate::{
    config::DevlinkConfig,
    device::{DevicePtr, ProbeStatus},
    error::LinkError,
    fwnode::FwLinkTable,
    hooks::DeviceHooks,
    link::{
        LinkFlags, LinkPtr, LinkStatus, initial_status, is_managed_sync_state_only,
        validate_request,
    },
    reorder::reorder_to_tail,
};
use alloc::{collections::BTreeSet, vec, vec::Vec};
use core::sync::atomic::AtomicBool;
use spin::Mutex;
use utils::rcu::{RcuDomain, RcuGuard, RcuReadGuard, RcuWriteGuard};

/// State only touched inside the writer section.
#[derive(Debug)]
pub struct LinksState {
    /// Sync-state is held back while non-zero.
    pub(crate) sync_pause: u32,
    /// Devices parked while sync-state is paused.
    pub(crate) deferred_sync: Vec<DevicePtr>,
    /// Devices whose sync-state callback is due, flushed outside the section.
    pub(crate) sync_queue: Vec<DevicePtr>,
    /// Every link in the graph, oldest first.
    pub(crate) all: Vec<LinkPtr>,
}

pub(crate) type WriteGuard<'a> = RcuWriteGuard<'a, LinksState>;

/// The device link graph.
///
/// A device must only ever be linked through one graph: its adjacency cells are protected by
/// this graph's read epochs.
pub struct DeviceLinks<H: DeviceHooks> {
    pub(crate) hooks: H,
    pub(crate) config: DevlinkConfig,
    pub(crate) domain: RcuDomain<LinksState>,
    pub(crate) fw: Mutex<FwLinkTable>,
    pub(crate) drv_reg_done: AtomicBool,
}

impl<H: DeviceHooks> DeviceLinks<H> {
    pub fn new(hooks: H, config: DevlinkConfig) -> DeviceLinks<H> {
        DeviceLinks {
            hooks,
            config,
            domain: RcuDomain::new(LinksState {
                sync_pause: if config.defer_sync_state { 1 } else { 0 },
                deferred_sync: vec![],
                sync_queue: vec![],
                all: vec![],
            }),
            fw: Mutex::new(FwLinkTable::default()),
            drv_reg_done: AtomicBool::new(false),
        }
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn config(&self) -> &DevlinkConfig {
        &self.config
    }

    /// Take a reader ticket for walking [crate::Device::suppliers] and [crate::Device::consumers].
    pub fn read_lock(&self) -> RcuReadGuard<'_, LinksState> {
        self.domain.read_lock()
    }

    pub(crate) fn write(&self) -> WriteGuard<'_> {
        self.domain.write()
    }

    /// Wait until every removed link has been released.
    ///
    /// **Deadlocks if the caller holds a reader ticket of this graph.**
    pub fn synchronize(&self) {
        self.domain.synchronize();
    }

    /// Snapshot of all links, oldest first.
    pub fn links(&self) -> Vec<LinkPtr> {
        self.write().all.clone()
    }

    /// The link from `supplier` to `consumer`, if any.
    pub fn find_link(&self, consumer: &DevicePtr, supplier: &DevicePtr) -> Option<LinkPtr> {
        let guard = self.read_lock();
        supplier
            .consumers(&guard)
            .iter()
            .find(|l| l.consumer() == consumer)
            .cloned()
    }

    /// Whether `dev` depends on `on`, through the device tree or through links.
    ///
    /// Runs on the read path.
    pub fn depends_on(&self, dev: &DevicePtr, on: &DevicePtr) -> bool {
        is_dependent(&self.read_lock(), on, dev)
    }

    /// Make `consumer` depend on `supplier`.
    ///
    /// Without [LinkFlags::STATELESS] the link is managed: its state follows the drivers of both
    /// ends and it goes away according to its autoremove flags. A stateless link is owned by the
    /// caller, who drops its reference with [DeviceLinks::remove_link].
    ///
    /// Adding a link that already exists merges the flags and returns the existing link.
    pub fn add_link(
        &self,
        consumer: &DevicePtr,
        supplier: &DevicePtr,
        flags: LinkFlags,
    ) -> Result<LinkPtr, LinkError> {
        let mut flags = validate_request(flags.bits())?;
        if consumer == supplier {
            return Err(LinkError::SelfLink);
        }

        let rpm_get = flags.contains(LinkFlags::PM_RUNTIME | LinkFlags::RPM_ACTIVE);
        if rpm_get {
            self.hooks
                .pm_runtime_get_sync(supplier)
                .map_err(LinkError::PmRuntime)?;
        }

        if !flags.contains(LinkFlags::STATELESS) {
            flags.insert(LinkFlags::MANAGED);
        }

        let ret = {
            let mut w = self.write();
            self.link_add_locked(&mut w, consumer, supplier, flags)
        };
        if rpm_get && ret.is_err() {
            self.hooks.pm_runtime_put(supplier);
        }
        ret
    }

    fn link_add_locked(
        &self,
        w: &mut WriteGuard<'_>,
        consumer: &DevicePtr,
        supplier: &DevicePtr,
        mut flags: LinkFlags,
    ) -> Result<LinkPtr, LinkError> {
        if !self.hooks.is_pm_initialized(supplier) {
            return Err(LinkError::SupplierNotRegistered);
        }
        if !flags.contains(LinkFlags::SYNC_STATE_ONLY) && is_dependent(&*w, consumer, supplier) {
            return Err(LinkError::Cycle);
        }
        // A sync-state-only link after the consumer has bound would never be dropped.
        if flags.contains(LinkFlags::SYNC_STATE_ONLY)
            && !matches!(
                consumer.probe_status(),
                ProbeStatus::NoDriver | ProbeStatus::Probing
            )
        {
            return Err(LinkError::ConsumerBound);
        }
        if flags.contains(LinkFlags::AUTOREMOVE_SUPPLIER) {
            flags.remove(LinkFlags::AUTOREMOVE_CONSUMER);
        }

        let existing = supplier
            .consumers(&*w)
            .iter()
            .find(|l| l.consumer() == consumer)
            .cloned();
        if let Some(link) = existing {
            if self.merge_link(&link, consumer, supplier, flags) {
                reorder_to_tail(&self.hooks, &*w, consumer);
                dev_dbg!(consumer, "linked as a consumer to {}", supplier.name());
            }
            return Ok(link);
        }

        let status = if flags.contains(LinkFlags::STATELESS) {
            LinkStatus::None
        } else {
            initial_status(supplier.probe_status(), consumer.probe_status())
        };
        let link = LinkPtr::new(supplier.clone(), consumer.clone(), flags, status);
        if flags.contains(LinkFlags::PM_RUNTIME) {
            self.hooks.pm_runtime_new_link(consumer);
            if status == LinkStatus::ConsumerProbe {
                self.hooks.resume_supplier(supplier);
            }
        }
        link_insert(w, &link);

        if flags.contains(LinkFlags::SYNC_STATE_ONLY) {
            dev_dbg!(
                consumer,
                "linked as a sync state only consumer to {}",
                supplier.name()
            );
            return Ok(link);
        }
        reorder_to_tail(&self.hooks, &*w, consumer);
        dev_dbg!(consumer, "linked as a consumer to {}", supplier.name());
        Ok(link)
    }

    /// Fold a repeated request into an existing link. Returns whether the consumer must be
    /// reordered because the link started to gate it.
    fn merge_link(
        &self,
        link: &LinkPtr,
        consumer: &DevicePtr,
        supplier: &DevicePtr,
        flags: LinkFlags,
    ) -> bool {
        if link.flags().contains(LinkFlags::INFERRED) && !flags.contains(LinkFlags::INFERRED) {
            link.remove_flags(LinkFlags::INFERRED);
        }

        if flags.contains(LinkFlags::PM_RUNTIME) {
            if !link.flags().contains(LinkFlags::PM_RUNTIME) {
                self.hooks.pm_runtime_new_link(consumer);
                link.insert_flags(LinkFlags::PM_RUNTIME);
            }
            if flags.contains(LinkFlags::RPM_ACTIVE) {
                link.rpm_active_get();
            }
        }

        if flags.contains(LinkFlags::STATELESS) {
            link.kref_get();
            let cur = link.flags();
            let promoted =
                cur.contains(LinkFlags::SYNC_STATE_ONLY) && !cur.contains(LinkFlags::STATELESS);
            link.insert_flags(LinkFlags::STATELESS);
            return promoted;
        }

        // The stricter autoremove request wins, and a request without either drops both.
        if flags.contains(LinkFlags::AUTOREMOVE_SUPPLIER) {
            if link.flags().contains(LinkFlags::AUTOREMOVE_CONSUMER) {
                link.remove_flags(LinkFlags::AUTOREMOVE_CONSUMER);
                link.insert_flags(LinkFlags::AUTOREMOVE_SUPPLIER);
            }
        } else if !flags.contains(LinkFlags::AUTOREMOVE_CONSUMER) {
            link.remove_flags(LinkFlags::AUTOREMOVE_CONSUMER | LinkFlags::AUTOREMOVE_SUPPLIER);
        }

        if !link.is_managed() {
            link.kref_get();
            link.insert_flags(LinkFlags::MANAGED);
            link.set_status(initial_status(supplier.probe_status(), consumer.probe_status()));
        }

        if link.flags().contains(LinkFlags::SYNC_STATE_ONLY)
            && !flags.contains(LinkFlags::SYNC_STATE_ONLY)
        {
            link.remove_flags(LinkFlags::SYNC_STATE_ONLY);
            return true;
        }
        false
    }

    /// Drop the caller's reference to a stateless link.
    ///
    /// A managed link may only be released this way once its consumer is unregistered.
    pub fn remove_link(&self, link: &LinkPtr) -> Result<(), LinkError> {
        let mut w = self.write();
        if !w.all.contains(link) {
            return Err(LinkError::NotFound);
        }
        self.link_put_kref(&mut w, link)
    }

    /// Drop the caller's reference to the stateless link from `supplier` to `consumer`.
    pub fn remove_link_between(
        &self,
        consumer: &DevicePtr,
        supplier: &DevicePtr,
    ) -> Result<(), LinkError> {
        if consumer == supplier {
            return Err(LinkError::SelfLink);
        }
        let mut w = self.write();
        let link = supplier
            .consumers(&w)
            .iter()
            .find(|l| l.consumer() == consumer)
            .cloned()
            .ok_or(LinkError::NotFound)?;
        self.link_put_kref(&mut w, &link)
    }

    fn link_put_kref(&self, w: &mut WriteGuard<'_>, link: &LinkPtr) -> Result<(), LinkError> {
        if link.flags().contains(LinkFlags::STATELESS) {
            self.link_put(w, link);
            Ok(())
        } else if !self.hooks.is_registered(link.consumer()) {
            self.drop_managed(w, link);
            Ok(())
        } else {
            dev_warn!(
                link.consumer(),
                "unable to drop a managed link to {}",
                link.supplier().name()
            );
            Err(LinkError::Managed)
        }
    }

    pub(crate) fn link_put(&self, w: &mut WriteGuard<'_>, link: &LinkPtr) {
        if link.kref_put() {
            self.link_del(w, link);
        }
    }

    /// Stop managing `link` and drop the reference the core held for it.
    pub(crate) fn drop_managed(&self, w: &mut WriteGuard<'_>, link: &LinkPtr) {
        link.remove_flags(LinkFlags::MANAGED);
        link.set_status(LinkStatus::None);
        self.link_put(w, link);
    }

    /// Unlink `link` regardless of its reference count.
    pub(crate) fn link_del(&self, w: &mut WriteGuard<'_>, link: &LinkPtr) {
        dev_dbg!(link.consumer(), "dropping the link to {}", link.supplier().name());
        if link.flags().contains(LinkFlags::PM_RUNTIME) {
            self.hooks.pm_runtime_drop_link(link);
        }
        link_unlink(w, link);
    }
}

fn link_insert(w: &mut WriteGuard<'_>, link: &LinkPtr) {
    let supplier = link.supplier();
    let consumer = link.consumer();

    let mut consumers = supplier.consumers(&*w).to_vec();
    consumers.push(link.clone());
    supplier.consumers_cell().publish(w, consumers);

    let mut suppliers = consumer.suppliers(&*w).to_vec();
    suppliers.push(link.clone());
    consumer.suppliers_cell().publish(w, suppliers);

    w.all.push(link.clone());
}

fn link_unlink(w: &mut WriteGuard<'_>, link: &LinkPtr) {
    let supplier = link.supplier();
    let consumer = link.consumer();

    let consumers: Vec<LinkPtr> = supplier
        .consumers(&*w)
        .iter()
        .filter(|l| *l != link)
        .cloned()
        .collect();
    supplier.consumers_cell().publish(w, consumers);

    let suppliers: Vec<LinkPtr> = consumer
        .suppliers(&*w)
        .iter()
        .filter(|l| *l != link)
        .cloned()
        .collect();
    consumer.suppliers_cell().publish(w, suppliers);

    w.all.retain(|l| l != link);
    w.retire(link.clone());
}

/// Whether `target` depends on `dev`: it is `dev`, a descendant of `dev`, or reachable from
/// `dev` through children and consumer links. Sync-state-only links are not dependencies.
pub(crate) fn is_dependent<G: RcuGuard>(guard: &G, dev: &DevicePtr, target: &DevicePtr) -> bool {
    let mut visited = BTreeSet::new();
    let mut stack = vec![dev.clone()];
    while let Some(cur) = stack.pop() {
        if !visited.insert(cur.key()) {
            continue;
        }
        // The ancestry check also catches a target not yet listed among its parent's children.
        if cur.is_ancestor_of(target) {
            return true;
        }
        stack.extend(cur.children());
        for link in cur.consumers(guard) {
            if is_managed_sync_state_only(link.flags()) {
                continue;
            }
            stack.push(link.consumer().clone());
        }
    }
    false
}
