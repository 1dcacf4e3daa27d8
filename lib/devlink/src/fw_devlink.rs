//! Turning firmware-declared dependencies into device links.
//!
//! Firmware nodes name their suppliers long before the devices exist. Each reference becomes a
//! pending edge in the [FwLinkTable]; [DeviceLinks::materialize] converts the pending edges of a
//! newly added device into managed, inferred links. Inferred links that would close a cycle are
//! relaxed to sync-state-only links so that every device in the cycle can still probe.
use crate::{
    config::FwDevlinkMode,
    device::{DevicePtr, ProbeStatus},
    error::{FwLinkError, LinkError},
    fwnode::{FwLinkTable, FwNodeFlags, FwNodePtr},
    graph::{DeviceLinks, WriteGuard},
    hooks::DeviceHooks,
    link::{LinkFlags, LinkPtr, fw_permissive, is_managed_sync_state_only},
    probe::purge_absent_locked,
};
use alloc::{
    collections::{BTreeMap, BTreeSet},
    vec,
    vec::Vec,
};
use core::sync::atomic::Ordering;

impl<H: DeviceHooks> DeviceLinks<H> {
    /// Record that `consumer` depends on `supplier` according to the firmware.
    ///
    /// Returns whether a new pending edge was added.
    pub fn add_pending_fw_edge(&self, consumer: &FwNodePtr, supplier: &FwNodePtr) -> bool {
        self.fw.lock().add(consumer, supplier)
    }

    /// Forget every pending edge touching `fw`.
    pub fn purge_fw_links(&self, fw: &FwNodePtr) {
        let mut table = self.fw.lock();
        table.purge_suppliers(fw);
        table.purge_consumers(fw);
    }

    /// Mark `fw` and its descendants without a device as never getting one.
    pub fn purge_absent_suppliers(&self, fw: &FwNodePtr) {
        purge_absent_locked(&mut self.fw.lock(), fw);
    }

    /// Turn the supplier references of `fw` and its descendants into pending edges.
    ///
    /// Every node is parsed once.
    pub fn parse_fwtree(&self, fw: &FwNodePtr) {
        let mut table = self.fw.lock();
        let mut stack = vec![fw.clone()];
        while let Some(node) = stack.pop() {
            if !node.flags().contains(FwNodeFlags::LINKS_ADDED) {
                for supplier in node.supplier_refs() {
                    table.add(&node, &supplier);
                }
                node.insert_flags(FwNodeFlags::LINKS_ADDED);
            }
            stack.extend(node.children());
        }
    }

    /// Whether `dev` still waits for firmware-declared suppliers that have no link yet.
    pub fn waiting_for_supplier(&self, dev: &DevicePtr) -> bool {
        dev.fwnode()
            .is_some_and(|fw| self.fw.lock().has_suppliers(fw))
    }

    /// Create the links firmware declares for `dev`, in both directions.
    ///
    /// Descendant firmware nodes without a device of their own get sync-state-only proxy links
    /// from `dev`.
    pub fn materialize(&self, dev: &DevicePtr) {
        if self.config.fw_devlink == FwDevlinkMode::Off {
            return;
        }
        let Some(fw) = dev.fwnode() else {
            return;
        };
        self.parse_fwtree(fw);

        {
            let mut table = self.fw.lock();
            self.link_to_consumers(&mut table, fw);
            self.link_to_suppliers(&mut table, dev, fw);
        }

        if self.drv_reg_done.load(Ordering::Acquire) && !self.hooks.can_match(dev) {
            self.unblock_consumers(dev);
        }
    }

    /// Pending edges naming `fw` as supplier.
    fn link_to_consumers(&self, table: &mut FwLinkTable, fw: &FwNodePtr) {
        for edge in table.consumers_of(fw) {
            let (con, own, flags) = match edge.consumer.device() {
                Some(con) => (con, true, self.config.fw_devlink.flags()),
                None => match edge.consumer.parent_device() {
                    // A proxy that is itself above the supplier would link a parent to its child.
                    Some(con) if con.fwnode().is_some_and(|f| f.is_ancestor_of(fw)) => continue,
                    Some(con) => (con, false, fw_permissive()),
                    None => continue,
                },
            };
            let ret = self.create_fw_link(&con, fw, flags);
            if own {
                settle(table, &edge.consumer, fw, ret);
            }
        }
    }

    /// Pending edges of `fw` and its descendants, linked from `dev`.
    fn link_to_suppliers(&self, table: &mut FwLinkTable, dev: &DevicePtr, fw: &FwNodePtr) {
        let mut work = vec![(dev.clone(), fw.clone())];
        while let Some((dev, fw)) = work.pop() {
            let own = dev.fwnode() == Some(&fw);
            let flags = if own {
                self.config.fw_devlink.flags()
            } else {
                fw_permissive()
            };
            for edge in table.suppliers_of(&fw) {
                let ret = self.create_fw_link(&dev, &edge.supplier, flags);
                if !own {
                    continue;
                }
                settle(table, &fw, &edge.supplier, ret);
                if ret.is_ok() {
                    // The supplier may have pending edges of its own that now resolve.
                    if let Some(sup_dev) = edge.supplier.device() {
                        work.push((sup_dev, edge.supplier.clone()));
                    }
                }
            }
            for child in fw.children() {
                work.push((dev.clone(), child));
            }
        }
    }

    /// Link `con` to the device of `sup_fw`.
    pub(crate) fn create_fw_link(
        &self,
        con: &DevicePtr,
        sup_fw: &FwNodePtr,
        flags: LinkFlags,
    ) -> Result<(), FwLinkError> {
        let sso = flags.contains(LinkFlags::SYNC_STATE_ONLY);
        if let Some(sup) = sup_fw.device() {
            // Initialized without binding a driver: it never will.
            if sup.probe_status() == ProbeStatus::NoDriver
                && sup_fw.flags().contains(FwNodeFlags::INITIALIZED)
            {
                return Err(FwLinkError::Invalid);
            }
            return match self.add_link(con, &sup, flags) {
                Ok(_) => Ok(()),
                Err(_) if sso => Ok(()),
                Err(LinkError::SupplierNotRegistered) => Err(FwLinkError::Again),
                Err(LinkError::Cycle) => {
                    dev_info!(con, "fixing up cyclic dependency with {}", sup.name());
                    {
                        let mut w = self.write();
                        self.relax_cycle(&mut w, con, &sup);
                    }
                    if let Err(err) = self.add_link(con, &sup, fw_permissive()) {
                        dev_warn!(con, "sync state only link to {} failed: {}", sup.name(), err);
                    }
                    Err(FwLinkError::Invalid)
                }
                Err(_) => Err(FwLinkError::Invalid),
            };
        }

        let sup_flags = sup_fw.flags();
        if sup_flags.intersects(FwNodeFlags::INITIALIZED | FwNodeFlags::NOT_DEVICE) {
            return Err(FwLinkError::Invalid);
        }
        // Sync-state-only links tolerate cycles, so there is nothing to check.
        if sso {
            return Err(FwLinkError::Again);
        }
        match sup_fw.parent_device() {
            Some(parent) if self.depends_on(&parent, con) => {
                dev_dbg!(con, "not linking to {} - false link", sup_fw.name());
                Err(FwLinkError::Invalid)
            }
            _ => Err(FwLinkError::Again),
        }
    }

    /// Relax every inferred link on a path from `con` to `sup`. Returns whether `sup` is
    /// reachable from `con`.
    ///
    /// A device with a child on such a path gets its consumer links left alone: the path through
    /// the child is what makes it reach `sup`.
    pub(crate) fn relax_cycle(
        &self,
        w: &mut WriteGuard<'_>,
        con: &DevicePtr,
        sup: &DevicePtr,
    ) -> bool {
        // Forward pass: everything reachable from `con`, with the reversed edges.
        let mut seen = BTreeSet::new();
        let mut preds: BTreeMap<usize, Vec<DevicePtr>> = BTreeMap::new();
        let mut stack = vec![con.clone()];
        seen.insert(con.key());
        while let Some(cur) = stack.pop() {
            if cur == *sup {
                continue;
            }
            let next = cur.children().into_iter().chain(
                cur.consumers(&*w)
                    .iter()
                    .filter(|l| !is_managed_sync_state_only(l.flags()))
                    .map(|l| l.consumer().clone()),
            );
            for n in next.collect::<Vec<_>>() {
                preds.entry(n.key()).or_default().push(cur.clone());
                if seen.insert(n.key()) {
                    stack.push(n);
                }
            }
        }
        if !seen.contains(&sup.key()) {
            return false;
        }

        // Backward pass: the devices that reach `sup`.
        let mut reach = BTreeSet::new();
        let mut stack = vec![sup.clone()];
        reach.insert(sup.key());
        while let Some(cur) = stack.pop() {
            for p in preds.remove(&cur.key()).unwrap_or_default() {
                if reach.insert(p.key()) {
                    stack.push(p);
                }
            }
        }

        let mut relax = Vec::new();
        let mut stack = vec![con.clone()];
        let mut done = BTreeSet::new();
        while let Some(cur) = stack.pop() {
            if cur == *sup || !done.insert(cur.key()) {
                continue;
            }
            let on_path: Vec<_> = cur
                .children()
                .into_iter()
                .filter(|c| reach.contains(&c.key()))
                .collect();
            if !on_path.is_empty() {
                stack.extend(on_path);
                continue;
            }
            for link in cur.consumers(&*w) {
                if is_managed_sync_state_only(link.flags())
                    || !reach.contains(&link.consumer().key())
                {
                    continue;
                }
                relax.push(link.clone());
                stack.push(link.consumer().clone());
            }
        }
        for link in relax {
            self.relax_link(&link);
        }
        true
    }

    /// Stop an inferred link from gating its consumer's probe.
    pub(crate) fn relax_link(&self, link: &LinkPtr) {
        let flags = link.flags();
        let relaxed = LinkFlags::MANAGED | fw_permissive();
        if !flags.contains(LinkFlags::INFERRED) || flags == relaxed {
            return;
        }
        if flags.contains(LinkFlags::PM_RUNTIME) {
            self.hooks.pm_runtime_drop_link(link);
        }
        link.set_flags(relaxed);
        dev_dbg!(link.consumer(), "relaxing link with {}", link.supplier().name());
    }

    /// Driver registration is over: suppliers that no driver can match will never bind, so
    /// their inferred links stop gating consumers.
    pub fn drivers_done(&self) {
        self.drv_reg_done.store(true, Ordering::Release);
        let w = self.write();
        for link in w.all.iter() {
            if !self.hooks.can_match(link.supplier()) {
                self.relax_link(link);
            }
        }
    }

    /// Relax every inferred link in which `dev` is the supplier.
    pub fn unblock_consumers(&self, dev: &DevicePtr) {
        if !matches!(self.config.fw_devlink, FwDevlinkMode::On | FwDevlinkMode::Rpm) {
            return;
        }
        let w = self.write();
        for link in dev.consumers(&w) {
            self.relax_link(link);
        }
    }
}

/// Drop a pending edge once its link exists or can never exist.
fn settle(
    table: &mut FwLinkTable,
    consumer: &FwNodePtr,
    supplier: &FwNodePtr,
    ret: Result<(), FwLinkError>,
) {
    match ret {
        Ok(()) => table.remove(consumer, supplier),
        Err(FwLinkError::Invalid) => table.discard_invalid(consumer, supplier),
        Err(FwLinkError::Again) => {}
    }
}
