//! Sleepable-RCU style read epochs for read-mostly linked structures.
//!
//! An [RcuDomain] pairs a writer-exclusive section with a lock-free read path:
//! - Writers call [RcuDomain::write] and get an [RcuWriteGuard]. Only one writer runs at a time
//!   and the section may be held across a whole cascading update.
//! - Readers call [RcuDomain::read_lock] and get an [RcuReadGuard] ticket. Taking a ticket never
//!   waits for a writer; it is two atomic operations on one of two reader counters.
//! - Data published through an [RcuCell] is replaced, never mutated in place. The superseded value
//!   is handed to the domain's retirement list and dropped only after every reader that could still
//!   see it has released its ticket (a grace period).
//!
//! Grace periods use the classic two-slot scheme: readers count themselves in the slot selected by
//! the current index; a writer flips the index and waits for the old slot to drain. Everything
//! retired before the flip is then unreachable. [RcuDomain::write] reclaims opportunistically when
//! the guard is dropped and never blocks on readers; [RcuDomain::synchronize] blocks until the
//! retirement list is empty.
use alloc::{boxed::Box, vec::Vec};
use core::{
    fmt::Debug,
    hint::spin_loop,
    marker::PhantomData,
    mem::take,
    ops::{Deref, DerefMut},
    ptr,
    sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};
use spin::{Mutex, MutexGuard};

/// A writer section plus the read epochs protecting data published under it.
pub struct RcuDomain<W> {
    writer: Mutex<W>,
    index: AtomicUsize,
    readers: [AtomicUsize; 2],
    retired: Mutex<RetireList>,
}

struct RetireList {
    /// Incremented on every index flip.
    gp_seq: usize,
    /// Reader slot that must drain before entries older than `gp_seq` can go.
    draining: Option<usize>,
    entries: Vec<Retired>,
}

struct Retired {
    gp_seq: usize,
    _item: Box<dyn Send>,
}

impl<W> RcuDomain<W> {
    pub const fn new(value: W) -> RcuDomain<W> {
        RcuDomain {
            writer: Mutex::new(value),
            index: AtomicUsize::new(0),
            readers: [AtomicUsize::new(0), AtomicUsize::new(0)],
            retired: Mutex::new(RetireList {
                gp_seq: 0,
                draining: None,
                entries: Vec::new(),
            }),
        }
    }

    /// Enter the writer-exclusive section.
    pub fn write(&self) -> RcuWriteGuard<'_, W> {
        RcuWriteGuard {
            domain: self,
            guard: self.writer.lock(),
        }
    }

    /// Take a reader ticket. Never blocks on the writer section.
    pub fn read_lock(&self) -> RcuReadGuard<'_, W> {
        loop {
            let slot = self.index.load(Ordering::SeqCst) & 1;
            self.readers[slot].fetch_add(1, Ordering::SeqCst);
            // A flip between the load and the increment means the writer may already have
            // checked this slot; count ourselves in the new one instead.
            if self.index.load(Ordering::SeqCst) & 1 == slot {
                return RcuReadGuard { domain: self, slot };
            }
            self.readers[slot].fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Number of reader tickets currently held.
    pub fn readers(&self) -> usize {
        self.readers[0].load(Ordering::SeqCst) + self.readers[1].load(Ordering::SeqCst)
    }

    /// Number of retired items still waiting for their grace period.
    pub fn pending(&self) -> usize {
        self.retired.lock().entries.len()
    }

    /// Block until everything retired so far has been dropped.
    ///
    /// **Calling this while holding a reader ticket of the same domain deadlocks.**
    pub fn synchronize(&self) {
        let _writer = self.writer.lock();
        loop {
            self.reclaim();
            if self.retired.lock().entries.is_empty() {
                break;
            }
            spin_loop();
        }
    }

    fn retire(&self, item: Box<dyn Send>) {
        let mut list = self.retired.lock();
        let gp_seq = list.gp_seq;
        list.entries.push(Retired {
            gp_seq,
            _item: item,
        });
    }

    /// Advance grace periods as far as possible without waiting.
    ///
    /// Must only run while the writer mutex is held, so that no writer is holding a reference
    /// obtained through [RcuCell::get] on a value it has just retired.
    fn reclaim(&self) -> usize {
        let mut expired = Vec::new();
        {
            let mut list = self.retired.lock();
            loop {
                if let Some(slot) = list.draining {
                    if self.readers[slot].load(Ordering::SeqCst) != 0 {
                        break;
                    }
                    list.draining = None;
                    let done = list.gp_seq;
                    let (old, young): (Vec<Retired>, Vec<Retired>) =
                        take(&mut list.entries).into_iter().partition(|e| e.gp_seq < done);
                    list.entries = young;
                    expired.extend(old);
                } else if list.entries.iter().any(|e| e.gp_seq == list.gp_seq) {
                    let slot = self.index.fetch_xor(1, Ordering::SeqCst) & 1;
                    list.gp_seq = list.gp_seq.wrapping_add(1);
                    list.draining = Some(slot);
                } else {
                    break;
                }
            }
        }
        // Dropped outside the list lock: retired items may own further RCU-managed data.
        expired.len()
    }
}

impl<W: Debug> Debug for RcuDomain<W> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RcuDomain")
            .field("readers", &self.readers())
            .field("pending", &self.pending())
            .finish()
    }
}

mod private {
    pub trait Sealed {}
}

/// Proof that the caller may dereference data published in an [RcuCell].
///
/// Implemented by [RcuReadGuard] and [RcuWriteGuard] only.
pub trait RcuGuard: private::Sealed {}

/// Reader ticket. Data obtained through it stays valid until the ticket is dropped.
pub struct RcuReadGuard<'a, W> {
    domain: &'a RcuDomain<W>,
    slot: usize,
}

impl<W> Drop for RcuReadGuard<'_, W> {
    fn drop(&mut self) {
        self.domain.readers[self.slot].fetch_sub(1, Ordering::SeqCst);
    }
}

impl<W> private::Sealed for RcuReadGuard<'_, W> {}
impl<W> RcuGuard for RcuReadGuard<'_, W> {}

/// Writer-exclusive section. Dereferences to the writer-side state `W`.
///
/// Dropping the guard reclaims expired retirements before releasing the section.
pub struct RcuWriteGuard<'a, W> {
    domain: &'a RcuDomain<W>,
    guard: MutexGuard<'a, W>,
}

impl<W> RcuWriteGuard<'_, W> {
    /// Hand `item` to the retirement list; it is dropped after the current grace period.
    pub fn retire<T: Send + 'static>(&self, item: T) {
        self.domain.retire(Box::new(item));
    }
}

impl<W> Deref for RcuWriteGuard<'_, W> {
    type Target = W;

    fn deref(&self) -> &W {
        &self.guard
    }
}

impl<W> DerefMut for RcuWriteGuard<'_, W> {
    fn deref_mut(&mut self) -> &mut W {
        &mut self.guard
    }
}

impl<W> Drop for RcuWriteGuard<'_, W> {
    fn drop(&mut self) {
        // Runs before the mutex guard field is released.
        self.domain.reclaim();
    }
}

impl<W> private::Sealed for RcuWriteGuard<'_, W> {}
impl<W> RcuGuard for RcuWriteGuard<'_, W> {}

/// A heap value replaced as a whole under the writer section and read through a guard.
///
/// The guard passed to [RcuCell::get] and [RcuCell::publish] must belong to the domain that
/// protects this cell.
pub struct RcuCell<T: Send + 'static> {
    ptr: AtomicPtr<T>,
    _marker: PhantomData<Box<T>>,
}

impl<T: Send + 'static> RcuCell<T> {
    pub fn new(value: T) -> RcuCell<T> {
        RcuCell {
            ptr: AtomicPtr::new(Box::into_raw(Box::new(value))),
            _marker: PhantomData,
        }
    }

    /// Borrow the current value for as long as the guard is held.
    pub fn get<'a, G: RcuGuard>(&'a self, _guard: &'a G) -> &'a T {
        // SAFETY: the pointer is never null, and a replaced value is only freed after a grace
        // period that the guard's holder either delays (reader ticket) or cannot overlap
        // (writer section, which reclaims only on drop).
        unsafe { &*self.ptr.load(Ordering::Acquire) }
    }

    /// Replace the value, retiring the old one.
    pub fn publish<W>(&self, guard: &RcuWriteGuard<'_, W>, value: T) {
        let new = Box::into_raw(Box::new(value));
        let old = self.ptr.swap(new, Ordering::AcqRel);
        // SAFETY: `old` came from `Box::into_raw` and is no longer reachable through the cell.
        guard.retire(unsafe { Box::from_raw(old) });
    }
}

impl<T: Send + 'static> Drop for RcuCell<T> {
    fn drop(&mut self) {
        let cur = core::mem::replace(self.ptr.get_mut(), ptr::null_mut());
        if !cur.is_null() {
            // SAFETY: exclusive access; nobody can hold a guard-scoped borrow of a dropped cell.
            drop(unsafe { Box::from_raw(cur) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::{sync::Arc, vec};
    use std::{sync::Barrier, thread};

    #[test]
    fn reader_delays_reclaim() {
        let domain = RcuDomain::new(());
        let cell = RcuCell::new(Arc::new(1u32));
        let first = cell.get(&domain.read_lock()).clone();

        let reader = domain.read_lock();
        let seen = cell.get(&reader);
        {
            let w = domain.write();
            cell.publish(&w, Arc::new(2));
        }
        // The superseded value is retired, but our ticket predates the retirement.
        assert_eq!(**seen, 1);
        assert_eq!(Arc::strong_count(&first), 2);
        assert_eq!(domain.pending(), 1);
        drop(reader);

        drop(domain.write());
        assert_eq!(domain.pending(), 0);
        assert_eq!(Arc::strong_count(&first), 1);
        assert_eq!(**cell.get(&domain.read_lock()), 2);
    }

    #[test]
    fn retirement_during_drain_waits_for_next_grace_period() {
        let domain = RcuDomain::new(());
        let cell = RcuCell::new(1u32);
        let a = domain.read_lock();
        {
            let w = domain.write();
            cell.publish(&w, 2);
        }
        assert_eq!(domain.pending(), 1);
        drop(a);

        let b = domain.read_lock();
        {
            let w = domain.write();
            cell.publish(&w, 3);
        }
        // The first retirement drained; the second waits on `b`.
        assert_eq!(domain.pending(), 1);
        assert_eq!(*cell.get(&b), 3);
        drop(b);

        drop(domain.write());
        assert_eq!(domain.pending(), 0);
    }

    #[test]
    fn writer_state_is_exclusive() {
        let domain = RcuDomain::new(0usize);
        *domain.write() += 5;
        *domain.write() += 1;
        assert_eq!(*domain.write(), 6);
    }

    #[test]
    fn synchronize_waits_for_readers() {
        let domain = Arc::new(RcuDomain::new(()));
        let cell = Arc::new(RcuCell::new(Arc::new(0usize)));
        let old = cell.get(&domain.read_lock()).clone();
        let barrier = Arc::new(Barrier::new(2));

        let reader = {
            let (domain, cell, barrier) = (domain.clone(), cell.clone(), barrier.clone());
            thread::spawn(move || {
                let guard = domain.read_lock();
                let value = **cell.get(&guard);
                barrier.wait();
                thread::sleep(std::time::Duration::from_millis(20));
                value
            })
        };
        barrier.wait();
        {
            let w = domain.write();
            cell.publish(&w, Arc::new(1));
        }
        domain.synchronize();
        assert_eq!(domain.pending(), 0);
        assert_eq!(Arc::strong_count(&old), 1);
        assert_eq!(reader.join().unwrap(), 0);
        assert_eq!(domain.readers(), 0);
    }

    #[test]
    fn concurrent_readers_always_see_a_complete_value() {
        let domain = Arc::new(RcuDomain::new(()));
        let cell = Arc::new(RcuCell::new(vec![0usize; 8]));
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let (domain, cell) = (domain.clone(), cell.clone());
                thread::spawn(move || {
                    for _ in 0..2000 {
                        let guard = domain.read_lock();
                        let v = cell.get(&guard);
                        assert!(v.iter().all(|x| *x == v[0]));
                    }
                })
            })
            .collect();
        for round in 1..500 {
            let w = domain.write();
            cell.publish(&w, vec![round; 8]);
        }
        for r in readers {
            r.join().unwrap();
        }
        domain.synchronize();
        assert_eq!(domain.pending(), 0);
    }
}
