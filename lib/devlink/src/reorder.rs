//! Keeping the registration and PM lists consistent with links.
//!
//! Both lists must have every supplier before its consumers and every parent before its
//! children. Whenever a device gains a supplier it is moved to the tail of both lists together
//! with everything that depends on it.
use crate::{
    device::DevicePtr,
    error::LinkError,
    graph::DeviceLinks,
    hooks::{DeviceHooks, DeviceList, DpmOrder},
    link::is_managed_sync_state_only,
};
use alloc::{collections::BTreeSet, vec::Vec};
use utils::rcu::RcuGuard;

struct Frame {
    dev: DevicePtr,
    /// Unvisited successors, next one last.
    succ: Vec<DevicePtr>,
}

fn successors<G: RcuGuard>(guard: &G, dev: &DevicePtr) -> Vec<DevicePtr> {
    let mut succ = dev.children();
    succ.extend(
        dev.consumers(guard)
            .iter()
            .filter(|l| !is_managed_sync_state_only(l.flags()))
            .map(|l| l.consumer().clone()),
    );
    succ.reverse();
    succ
}

/// `dev` and everything depending on it, each device once, suppliers before consumers.
///
/// Reverse DFS post-order over children and non-sync-state-only consumer links.
pub(crate) fn tail_order<G: RcuGuard>(guard: &G, dev: &DevicePtr) -> Vec<DevicePtr> {
    let mut visited = BTreeSet::new();
    let mut post = Vec::new();
    visited.insert(dev.key());
    let mut stack = alloc::vec![Frame {
        dev: dev.clone(),
        succ: successors(guard, dev),
    }];
    while let Some(top) = stack.last_mut() {
        match top.succ.pop() {
            Some(next) => {
                if visited.insert(next.key()) {
                    let succ = successors(guard, &next);
                    stack.push(Frame { dev: next, succ });
                }
            }
            None => {
                if let Some(frame) = stack.pop() {
                    post.push(frame.dev);
                }
            }
        }
    }
    post.reverse();
    post
}

/// Move `dev` and its dependents to the tail of both lists.
pub(crate) fn reorder_to_tail<H: DeviceHooks, G: RcuGuard>(
    hooks: &H,
    guard: &G,
    dev: &DevicePtr,
) {
    for d in tail_order(guard, dev) {
        if hooks.is_registered(&d) {
            hooks.move_last(DeviceList::Kset, &d);
        }
        if hooks.is_pm_initialized(&d) {
            hooks.move_last(DeviceList::Dpm, &d);
        }
    }
}

impl<H: DeviceHooks> DeviceLinks<H> {
    /// Move `dev` and everything depending on it to the end of both lists.
    pub fn move_to_tail(&self, dev: &DevicePtr) {
        let w = self.write();
        reorder_to_tail(&self.hooks, &w, dev);
    }

    /// Re-parent `dev` and fix up the PM list as requested.
    ///
    /// Moving a device below one of its own descendants is refused.
    pub fn move_device(
        &self,
        dev: &DevicePtr,
        new_parent: Option<&DevicePtr>,
        order: DpmOrder,
    ) -> Result<(), LinkError> {
        let w = self.write();
        if new_parent.is_some_and(|p| dev.is_ancestor_of(p)) {
            return Err(LinkError::Cycle);
        }
        dev.set_parent(new_parent);
        dev_dbg!(
            dev,
            "moved to {}",
            new_parent.map(|p| p.name()).unwrap_or("<none>")
        );

        match (order, new_parent) {
            (DpmOrder::None, _) => {}
            (DpmOrder::DevAfterParent, Some(parent)) => {
                self.hooks.move_after(DeviceList::Dpm, dev, parent);
                self.hooks.move_after(DeviceList::Kset, dev, parent);
            }
            (DpmOrder::ParentBeforeDev, Some(parent)) => {
                self.hooks.move_before(DeviceList::Dpm, parent, dev);
                self.hooks.move_before(DeviceList::Kset, parent, dev);
            }
            (DpmOrder::DevAfterParent | DpmOrder::ParentBeforeDev, None) => {}
            (DpmOrder::DevLast, _) => reorder_to_tail(&self.hooks, &w, dev),
        }
        Ok(())
    }
}
