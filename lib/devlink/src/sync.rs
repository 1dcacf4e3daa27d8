//! Deferred sync-state dispatch.
//!
//! A supplier's sync-state callback runs once all of its managed consumers are active, so that
//! it can drop resources kept on for them by the boot firmware. Callbacks are collected inside
//! the writer section and invoked after it is released, so they may add or remove links.
use crate::{
    device::DevicePtr,
    graph::{DeviceLinks, WriteGuard},
    hooks::DeviceHooks,
    link::LinkStatus,
};
use core::mem::take;

impl<H: DeviceHooks> DeviceLinks<H> {
    /// Queue `dev` for its sync-state callback if it is due.
    pub(crate) fn queue_sync_state(&self, w: &mut WriteGuard<'_>, dev: &DevicePtr) {
        if !self.hooks.has_sync_state(dev) || dev.state_synced() {
            return;
        }
        if dev
            .consumers(&*w)
            .iter()
            .any(|l| l.is_managed() && l.status() != LinkStatus::Active)
        {
            return;
        }
        dev.set_state_synced();
        if dev.defer_sync() {
            dev_warn!(dev, "queued for sync-state while parked");
            return;
        }
        w.sync_queue.push(dev.clone());
    }

    /// Park `dev` until sync-state is resumed.
    pub(crate) fn defer_sync(&self, w: &mut WriteGuard<'_>, dev: &DevicePtr) {
        if !dev.defer_sync() && self.hooks.has_sync_state(dev) {
            dev.set_defer_sync(true);
            w.deferred_sync.push(dev.clone());
        }
    }

    /// Queue or park `dev`, depending on whether sync-state is paused.
    pub(crate) fn queue_or_defer_sync(&self, w: &mut WriteGuard<'_>, dev: &DevicePtr) {
        if w.sync_pause > 0 {
            self.defer_sync(w, dev);
        } else {
            self.queue_sync_state(w, dev);
        }
    }

    pub(crate) fn undefer_sync(&self, w: &mut WriteGuard<'_>, dev: &DevicePtr) {
        if dev.defer_sync() {
            w.deferred_sync.retain(|d| d != dev);
            dev.set_defer_sync(false);
        }
    }

    /// Run the callbacks queued so far. Must be called without the writer section.
    pub(crate) fn flush_sync_queue(&self) {
        let queue = take(&mut self.write().sync_queue);
        for dev in queue {
            if self.hooks.has_sync_state(&dev) {
                dev_dbg!(dev, "sync state");
                self.hooks.sync_state(&dev);
            }
        }
    }

    /// Hold back sync-state callbacks until the matching [DeviceLinks::resume_sync_state].
    ///
    /// Pauses nest.
    pub fn pause_sync_state(&self) {
        self.write().sync_pause += 1;
    }

    /// Undo one [DeviceLinks::pause_sync_state]. The last resume queues every parked device that
    /// is due and runs the callbacks.
    pub fn resume_sync_state(&self) {
        {
            let mut w = self.write();
            if w.sync_pause == 0 {
                log::warn!(target: "devlink", "unmatched sync_state pause/resume");
                return;
            }
            w.sync_pause -= 1;
            if w.sync_pause > 0 {
                return;
            }
            for dev in take(&mut w.deferred_sync) {
                dev.set_defer_sync(false);
                self.queue_sync_state(&mut w, &dev);
            }
        }
        self.flush_sync_queue();
    }

    pub fn sync_state_paused(&self) -> bool {
        self.write().sync_pause > 0
    }
}
