// SPDX-License-Identifier: MPL-2.0

//! Per-processor slots written concurrently, one writer per slot.

use alloc::boxed::Box;
use core::{
    cell::UnsafeCell,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::cpu::CpuId;

/// An array of slots indexed by processor handle.
///
/// While a dispatch is running, each processor may mutate only the slot of
/// its own handle through [`SlotArena::slot_mut`]. Once the dispatch has
/// returned, the owner reads all slots through `&mut self`.
pub struct SlotArena<T> {
    slots: Box<[UnsafeCell<T>]>,
}

// SAFETY: Concurrent access goes through `slot_mut`, whose callers guarantee
// that no two processors touch the same slot. Moving `T` across processors
// requires `T: Send`.
unsafe impl<T: Send> Sync for SlotArena<T> {}

impl<T> SlotArena<T> {
    /// Creates an arena of `len` slots initialized by `init`.
    pub fn new(len: usize, mut init: impl FnMut() -> T) -> Self {
        Self {
            slots: (0..len).map(|_| UnsafeCell::new(init())).collect(),
        }
    }

    /// Returns the number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns `true` if the arena has no slot.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Returns the slot of a processor for mutation from that processor.
    ///
    /// # Safety
    ///
    /// The caller must be the only one accessing the slot of `cpu` until the
    /// returned reference is dropped. In practice this means that `cpu` is
    /// the handle of the calling processor.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slot_mut(&self, cpu: CpuId) -> Option<&mut T> {
        let slot = self.slots.get(cpu.as_usize())?;
        // SAFETY: The caller guarantees exclusive access to this slot.
        Some(unsafe { &mut *slot.get() })
    }

    /// Returns the slot of a processor.
    pub fn get_mut(&mut self, cpu: CpuId) -> Option<&mut T> {
        self.slots.get_mut(cpu.as_usize()).map(UnsafeCell::get_mut)
    }

    /// Iterates over all slots in ascending handle order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (CpuId, &mut T)> + '_ {
        self.slots
            .iter_mut()
            .enumerate()
            .map(|(index, slot)| (CpuId::new(index as u32), slot.get_mut()))
    }
}

/// A counted rendezvous.
///
/// Every participant of a round arrives once, whether or not its part of the
/// round succeeded. Once the round is over, the coordinator compares the
/// count with the number of participants it expected.
#[derive(Debug, Default)]
pub struct Rendezvous {
    arrived: AtomicUsize,
}

impl Rendezvous {
    /// Creates a rendezvous nobody has arrived at.
    pub const fn new() -> Self {
        Self {
            arrived: AtomicUsize::new(0),
        }
    }

    /// Marks the calling participant as arrived.
    pub fn arrive(&self) {
        self.arrived.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns the number of participants arrived so far.
    pub fn arrived(&self) -> usize {
        self.arrived.load(Ordering::Acquire)
    }

    /// Starts a new round.
    pub fn reset(&self) {
        self.arrived.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod test {
    use std::thread;

    use super::*;

    #[test]
    fn each_thread_writes_its_own_slot() {
        let mut arena = SlotArena::new(8, || 0usize);
        let rendezvous = Rendezvous::new();

        thread::scope(|s| {
            for index in 0..8u32 {
                let arena = &arena;
                let rendezvous = &rendezvous;
                s.spawn(move || {
                    // SAFETY: Every thread owns a distinct index.
                    let slot = unsafe { arena.slot_mut(CpuId::new(index)) }.unwrap();
                    *slot = index as usize * 10;
                    rendezvous.arrive();
                });
            }
        });

        assert_eq!(rendezvous.arrived(), 8);
        let sum: usize = arena.iter_mut().map(|(_, slot)| *slot).sum();
        assert_eq!(sum, 280);
        assert_eq!(arena.get_mut(CpuId::new(3)), Some(&mut 30));
        assert_eq!(arena.get_mut(CpuId::new(8)), None);
    }

    #[test]
    fn rendezvous_counts_each_round() {
        let rendezvous = Rendezvous::new();
        rendezvous.arrive();
        rendezvous.arrive();
        assert_eq!(rendezvous.arrived(), 2);
        rendezvous.reset();
        assert_eq!(rendezvous.arrived(), 0);
    }
}
