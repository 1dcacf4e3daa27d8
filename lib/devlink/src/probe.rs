//! Link state transitions driven by probe, unbind and removal of devices.
//!
//! The driver core calls these around every driver binding attempt:
//! - [DeviceLinks::on_probe_start] before probing, and [DeviceLinks::on_probe_success] or
//!   [DeviceLinks::on_probe_fail] after it.
//! - [DeviceLinks::on_unbind_start] before unbinding. If it reports busy consumers,
//!   [DeviceLinks::unbind_consumers] gets rid of them. [DeviceLinks::on_unbind_complete] follows.
//! - [DeviceLinks::on_node_removed] when the device leaves the system.
use crate::{
    config::FwDevlinkMode,
    device::{DevicePtr, ProbeStatus},
    error::ProbeDefer,
    fwnode::{FwLinkTable, FwNodeFlags, FwNodePtr},
    graph::{DeviceLinks, WriteGuard},
    hooks::DeviceHooks,
    link::{LinkFlags, LinkStatus},
};
use alloc::{vec, vec::Vec};

enum UnbindStep {
    WaitForProbe,
    Release(DevicePtr),
}

impl<H: DeviceHooks> DeviceLinks<H> {
    /// Check that every supplier of `dev` is ready and mark its links as probing.
    ///
    /// On deferral the probe status of `dev` is left alone.
    pub fn on_probe_start(&self, dev: &DevicePtr) -> Result<(), ProbeDefer> {
        if self.config.fw_devlink != FwDevlinkMode::Off && !self.config.is_permissive() {
            if let Some(fw) = dev.fwnode() {
                if self.fw.lock().has_suppliers(fw) {
                    dev_dbg!(dev, "probe deferral - waiting for firmware suppliers");
                    return Err(ProbeDefer::WaitingForSupplier);
                }
            }
        }

        let w = self.write();
        for link in dev.suppliers(&w) {
            if !link.is_managed() {
                continue;
            }
            if link.status() != LinkStatus::Available
                && !link.flags().contains(LinkFlags::SYNC_STATE_ONLY)
            {
                self.links_missing_supplier(&w, dev);
                dev_dbg!(dev, "probe deferral - supplier {} not ready", link.supplier().name());
                return Err(ProbeDefer::SupplierNotReady);
            }
            link.set_status(LinkStatus::ConsumerProbe);
        }
        dev.set_probe_status(ProbeStatus::Probing);
        Ok(())
    }

    /// Undo the probing state of supplier links after a deferral.
    fn links_missing_supplier(&self, w: &WriteGuard<'_>, dev: &DevicePtr) {
        for link in dev.suppliers(w) {
            if link.status() != LinkStatus::ConsumerProbe {
                continue;
            }
            if link.supplier().probe_status() == ProbeStatus::DriverBound {
                link.set_status(LinkStatus::Available);
            } else {
                if !link.flags().contains(LinkFlags::SYNC_STATE_ONLY) {
                    dev_warn!(dev, "probing link to unbound supplier {}", link.supplier().name());
                }
                link.set_status(LinkStatus::Dormant);
            }
        }
    }

    /// Prepare `dev` for a driver bound without waiting for its suppliers.
    ///
    /// Managed links to suppliers that are not ready are dropped.
    pub fn on_force_bind(&self, dev: &DevicePtr) {
        let mut w = self.write();
        for link in dev.suppliers(&w).to_vec() {
            if !link.is_managed() {
                continue;
            }
            if link.status() != LinkStatus::Available {
                self.drop_managed(&mut w, &link);
                continue;
            }
            link.set_status(LinkStatus::ConsumerProbe);
        }
        dev.set_probe_status(ProbeStatus::Probing);
    }

    /// `dev` has a driver now: release waiting consumers, activate supplier links and run any
    /// sync-state callbacks that became due.
    pub fn on_probe_success(&self, dev: &DevicePtr) {
        if let Some(fw) = dev.fwnode() {
            if fw.is_device(dev) {
                let mut table = self.fw.lock();
                table.purge_suppliers(fw);
                for child in fw.children() {
                    purge_absent_locked(&mut table, &child);
                }
            }
        }

        {
            let mut w = self.write();
            for link in dev.consumers(&w) {
                if !link.is_managed() {
                    continue;
                }
                let status = link.status();
                if matches!(status, LinkStatus::ConsumerProbe | LinkStatus::Active) {
                    continue;
                }
                if status != LinkStatus::Dormant {
                    dev_warn!(
                        link.consumer(),
                        "link to {} in state {:?} while supplier binds",
                        dev.name(),
                        status
                    );
                }
                link.set_status(LinkStatus::Available);
                if link.flags().contains(LinkFlags::AUTOPROBE_CONSUMER) {
                    self.hooks.request_probe_retry(link.consumer());
                }
            }

            self.queue_or_defer_sync(&mut w, dev);

            for link in dev.suppliers(&w).to_vec() {
                if !link.is_managed() {
                    continue;
                }
                if link.flags().contains(LinkFlags::SYNC_STATE_ONLY) {
                    self.drop_managed(&mut w, &link);
                } else {
                    if link.status() != LinkStatus::ConsumerProbe {
                        dev_warn!(
                            dev,
                            "link to {} in state {:?} at bind",
                            link.supplier().name(),
                            link.status()
                        );
                    }
                    link.set_status(LinkStatus::Active);
                }
                self.queue_or_defer_sync(&mut w, link.supplier());
            }

            dev.set_probe_status(ProbeStatus::DriverBound);
        }
        self.flush_sync_queue();
    }

    /// Probing `dev` failed.
    pub fn on_probe_fail(&self, dev: &DevicePtr) {
        let mut w = self.write();
        // Consumers linked while `dev` was probing saw it as bound.
        for link in dev.consumers(&w) {
            if link.is_managed()
                && matches!(link.status(), LinkStatus::ConsumerProbe | LinkStatus::Active)
            {
                link.set_status(LinkStatus::Dormant);
            }
        }
        self.links_no_driver(&mut w, dev);
    }

    /// Supplier links of a device that lost (or never got) its driver.
    fn links_no_driver(&self, w: &mut WriteGuard<'_>, dev: &DevicePtr) {
        let suppliers: Vec<_> = dev.suppliers(&*w).iter().rev().cloned().collect();
        for link in suppliers {
            if !link.is_managed() {
                continue;
            }
            if link.flags().contains(LinkFlags::AUTOREMOVE_CONSUMER) {
                self.drop_managed(w, &link);
                continue;
            }
            if !matches!(link.status(), LinkStatus::ConsumerProbe | LinkStatus::Active) {
                continue;
            }
            if link.supplier().probe_status() == ProbeStatus::DriverBound {
                link.set_status(LinkStatus::Available);
            } else {
                if !link.flags().contains(LinkFlags::SYNC_STATE_ONLY) {
                    dev_warn!(dev, "active link to unbound supplier {}", link.supplier().name());
                }
                link.set_status(LinkStatus::Dormant);
            }
        }
        dev.set_probe_status(ProbeStatus::NoDriver);
    }

    /// Start unbinding `dev`. Returns whether some consumer still probes or is bound.
    ///
    /// Idle consumer links move to [LinkStatus::SupplierUnbind]; busy ones are left for
    /// [DeviceLinks::unbind_consumers].
    pub fn on_unbind_start(&self, dev: &DevicePtr) -> bool {
        let w = self.write();
        let mut busy = false;
        for link in dev.consumers(&w) {
            if !link.is_managed() {
                continue;
            }
            if matches!(link.status(), LinkStatus::ConsumerProbe | LinkStatus::Active) {
                busy = true;
                continue;
            }
            link.set_status(LinkStatus::SupplierUnbind);
        }
        dev.set_probe_status(ProbeStatus::Unbinding);
        busy
    }

    /// Unbind every consumer of `dev`.
    ///
    /// Consumers still probing are waited for. The writer section is released around each wait
    /// and each driver release, and the scan starts over afterwards.
    pub fn unbind_consumers(&self, dev: &DevicePtr) {
        loop {
            let step = {
                let w = self.write();
                let mut step = None;
                for link in dev.consumers(&w) {
                    let flags = link.flags();
                    if !flags.contains(LinkFlags::MANAGED)
                        || flags.contains(LinkFlags::SYNC_STATE_ONLY)
                    {
                        continue;
                    }
                    let status = link.status();
                    if status == LinkStatus::ConsumerProbe {
                        step = Some(UnbindStep::WaitForProbe);
                        break;
                    }
                    link.set_status(LinkStatus::SupplierUnbind);
                    if status == LinkStatus::Active {
                        step = Some(UnbindStep::Release(link.consumer().clone()));
                        break;
                    }
                }
                step
            };
            match step {
                None => break,
                Some(UnbindStep::WaitForProbe) => self.hooks.wait_for_device_probe(),
                Some(UnbindStep::Release(consumer)) => {
                    dev_dbg!(dev, "unbinding consumer {}", consumer.name());
                    self.hooks.release_driver(&consumer);
                }
            }
        }
    }

    /// `dev` has lost its driver.
    pub fn on_unbind_complete(&self, dev: &DevicePtr) {
        let mut w = self.write();
        for link in dev.consumers(&w).to_vec() {
            if !link.is_managed() {
                continue;
            }
            let status = link.status();
            if link.flags().contains(LinkFlags::AUTOREMOVE_CONSUMER) {
                dev_warn!(
                    link.consumer(),
                    "autoremove-consumer link to {} outlived its consumer",
                    dev.name()
                );
            }
            if status != LinkStatus::SupplierUnbind {
                dev_warn!(
                    link.consumer(),
                    "link to {} in state {:?} after unbind",
                    dev.name(),
                    status
                );
            }
            if status == LinkStatus::SupplierUnbind
                && link.flags().contains(LinkFlags::AUTOREMOVE_SUPPLIER)
            {
                self.drop_managed(&mut w, &link);
                continue;
            }
            link.set_status(LinkStatus::Dormant);
        }
        self.undefer_sync(&mut w, dev);
        self.links_no_driver(&mut w, dev);
    }

    /// `dev` is leaving the system: delete every link touching it.
    pub fn on_node_removed(&self, dev: &DevicePtr) {
        {
            let mut w = self.write();
            let suppliers: Vec<_> = dev.suppliers(&w).iter().rev().cloned().collect();
            for link in suppliers {
                if link.status() == LinkStatus::Active {
                    dev_warn!(dev, "removed with an active link to {}", link.supplier().name());
                }
                self.link_del(&mut w, &link);
            }
            let consumers: Vec<_> = dev.consumers(&w).iter().rev().cloned().collect();
            for link in consumers {
                if !matches!(link.status(), LinkStatus::Dormant | LinkStatus::None) {
                    dev_warn!(
                        dev,
                        "removed while consumer {} is in state {:?}",
                        link.consumer().name(),
                        link.status()
                    );
                }
                self.link_del(&mut w, &link);
            }
            self.undefer_sync(&mut w, dev);
            w.sync_queue.retain(|d| d != dev);
        }
        if let Some(fw) = dev.fwnode() {
            if fw.is_device(dev) {
                fw.set_device(None);
            }
        }
        dev.set_parent(None);
    }

    /// Force every active link whose consumer has no driver back to [LinkStatus::Dormant].
    ///
    /// Returns the number of links repaired.
    pub fn audit(&self, dev: &DevicePtr) -> usize {
        let w = self.write();
        let mut repaired = 0;
        for link in dev.suppliers(&w).iter().chain(dev.consumers(&w)) {
            if link.status() != LinkStatus::Active {
                continue;
            }
            let consumer = link.consumer();
            if matches!(
                consumer.probe_status(),
                ProbeStatus::DriverBound | ProbeStatus::Unbinding
            ) {
                continue;
            }
            dev_warn!(
                consumer,
                "active link to {} without a bound driver",
                link.supplier().name()
            );
            link.set_status(LinkStatus::Dormant);
            repaired += 1;
        }
        repaired
    }
}

/// Mark `fw` and its descendants without devices as never getting one, dropping the pending
/// edges that name them as suppliers.
pub(crate) fn purge_absent_locked(table: &mut FwLinkTable, fw: &FwNodePtr) {
    let mut stack = vec![fw.clone()];
    while let Some(node) = stack.pop() {
        if node.device().is_some() {
            continue;
        }
        node.insert_flags(FwNodeFlags::NOT_DEVICE);
        table.purge_consumers(&node);
        stack.extend(node.children());
    }
}
