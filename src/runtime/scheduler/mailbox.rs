// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    topology::{
        window::{
            self,
            SymmetricWindow,
        },
        Rank,
        Topology,
    },
};
use ::std::{
    marker::PhantomData,
    mem,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Slot states.
const SLOT_EMPTY: i32 = 0;
const SLOT_WRITING: i32 = 1;
const SLOT_FULL: i32 = 2;

//======================================================================================================================
// Structures
//======================================================================================================================

#[repr(C)]
struct Slot<T: Copy> {
    state: i32,
    _pad: i32,
    payload: T,
}

/// A single-slot mailbox per rank, remotely writable.
///
/// Producers claim the recipient's slot with a one-sided compare-and-swap and
/// publish the payload with a release of the full state. In practice a
/// recipient has a single producer at a time; concurrent producers serialize
/// on the claim. [OneslotMailbox::arrived] is a lower bound, and
/// [OneslotMailbox::pop] may return `None` spuriously while a producer is
/// mid-write.
pub struct OneslotMailbox<T: Copy> {
    win: SymmetricWindow,
    my_rank: Rank,
    _marker: PhantomData<T>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl<T: Copy> OneslotMailbox<T> {
    /// Collectively creates one mailbox slot per rank.
    pub fn create(topo: &Topology, tag: &str) -> Result<Self, Fail> {
        let win: SymmetricWindow = SymmetricWindow::create(topo, tag, mem::size_of::<Slot<T>>())?;
        Ok(Self {
            win,
            my_rank: topo.my_rank(),
            _marker: PhantomData,
        })
    }

    /// Posts `entry` into `target`'s mailbox, spinning while the slot is
    /// occupied.
    pub fn put(&self, entry: T, target: Rank) {
        let slot: *mut Slot<T> = self.win.rank_ptr(target) as *mut Slot<T>;
        let state: *mut i32 = unsafe { &mut (*slot).state };
        loop {
            if window::atomic_cas_i32(state, SLOT_EMPTY, SLOT_WRITING) == SLOT_EMPTY {
                break;
            }
            unsafe { libc::sched_yield() };
        }
        window::put_value(unsafe { &mut (*slot).payload }, entry);
        window::atomic_put_i32(state, SLOT_FULL);
    }

    /// Takes the entry out of the local mailbox, if one has fully arrived.
    pub fn pop(&self) -> Option<T> {
        let slot: *mut Slot<T> = self.win.rank_ptr(self.my_rank) as *mut Slot<T>;
        let state: *mut i32 = unsafe { &mut (*slot).state };
        if window::atomic_get_i32(state) != SLOT_FULL {
            return None;
        }
        let entry: T = window::get_value(unsafe { &(*slot).payload });
        window::atomic_put_i32(state, SLOT_EMPTY);
        Some(entry)
    }

    /// Whether an entry has arrived in the local mailbox.
    pub fn arrived(&self) -> bool {
        let slot: *mut Slot<T> = self.win.rank_ptr(self.my_rank) as *mut Slot<T>;
        window::atomic_get_i32(unsafe { &(*slot).state }) == SLOT_FULL
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::OneslotMailbox;
    use crate::runtime::topology::Topology;
    use ::anyhow::Result;

    /// Tests put/arrived/pop on a single-rank mailbox.
    #[test]
    fn put_pop() -> Result<()> {
        let session: String = format!("spindle-test-mbox-{}", std::process::id());
        let topo: Topology = Topology::attach(0, 1, &session)?;
        let mbox: OneslotMailbox<(u64, u64)> = OneslotMailbox::create(&topo, "mbox")?;

        crate::ensure_eq!(mbox.arrived(), false);
        crate::ensure_eq!(mbox.pop().is_none(), true);

        mbox.put((11, 22), 0);
        crate::ensure_eq!(mbox.arrived(), true);
        crate::ensure_eq!(mbox.pop(), Some((11, 22)));
        crate::ensure_eq!(mbox.arrived(), false);

        // The slot is reusable after a pop.
        mbox.put((33, 44), 0);
        crate::ensure_eq!(mbox.pop(), Some((33, 44)));
        Ok(())
    }
}
