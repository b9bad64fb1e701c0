// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Uni-address call stack. Every rank reserves the same virtual address range
//! for its user-level call stack and maps its own shared-memory object there.
//! All ranks additionally map every peer's stack object into a window, so a
//! frame can be copied byte-wise from a victim's stack into the identical
//! address on the thief's stack.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    pal::SharedMemory,
    runtime::{
        fail::Fail,
        topology::{
            page_align,
            window::{
                self,
                SymmetricWindow,
            },
            Rank,
            Topology,
        },
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Per-worker call stack with the uni-address property.
pub struct CallStack {
    /// Base (lowest) address; identical on every rank.
    base: *mut u8,
    /// Stack size in bytes.
    size: usize,
    /// This rank's stack object, mapped at `base`.
    #[allow(unused)]
    own: SharedMemory,
    /// Peer view: every rank's stack object, mapped side by side.
    peers: SymmetricWindow,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl CallStack {
    /// Collectively creates the call stacks of all ranks.
    pub fn create(topo: &Topology, size: usize) -> Result<Self, Fail> {
        let size: usize = page_align(size);

        // The window creates and maps every rank's backing object once; the
        // active stack is a second mapping of our own object at the address
        // range all ranks agreed on.
        let peers: SymmetricWindow = SymmetricWindow::create(topo, "stack", size)?;
        let base: *mut u8 = topo.reserve_same_va(size)?;
        let mut own: SharedMemory =
            SharedMemory::open(&topo.segment_name("stack", topo.my_rank()), size)?;
        own.map_at(base)?;
        topo.barrier();

        debug!("call stack at [{:p}, {:p})", base, unsafe { base.add(size) });

        Ok(Self {
            base,
            size,
            own,
            peers,
        })
    }

    /// Lowest address of the stack.
    pub fn top(&self) -> *mut u8 {
        self.base
    }

    /// One-past-highest address of the stack. Stacks grow downwards, so this
    /// is where execution starts.
    pub fn bottom(&self) -> *mut u8 {
        unsafe { self.base.add(self.size) }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether `addr` points into the (uni-address) stack range.
    pub fn contains(&self, addr: *const u8) -> bool {
        let addr: usize = addr as usize;
        addr >= self.base as usize && addr < self.base as usize + self.size
    }

    /// Copies `size` bytes of `target`'s stack, starting at the uni-address
    /// `frame_base`, into the same local address.
    pub fn direct_copy_from(&self, frame_base: *mut u8, size: usize, target: Rank) {
        debug_assert!(self.contains(frame_base));
        let offset: usize = frame_base as usize - self.base as usize;
        debug_assert!(offset + size <= self.size);
        let src: *const u8 = unsafe { self.peers.rank_ptr(target).add(offset) };
        window::get_bytes(frame_base, src, size);
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::CallStack;
    use crate::runtime::topology::Topology;
    use ::anyhow::Result;

    /// Tests that the active mapping and the peer view alias the same pages.
    #[test]
    fn peer_view_aliases_active_mapping() -> Result<()> {
        let session: String = format!("spindle-test-stack-{}", std::process::id());
        let topo: Topology = Topology::attach(0, 1, &session)?;
        let stack: CallStack = CallStack::create(&topo, 1 << 20)?;

        unsafe {
            let p: *mut u8 = stack.top().add(128);
            p.write(0x7e);
            // Reading our own slice through the peer view must observe the
            // write made through the active mapping.
            let peer: *const u8 = stack.peers.rank_ptr(0).add(128);
            crate::ensure_eq!(peer.read(), 0x7e);
        }

        // Self-copy of a frame-sized region is a no-op.
        stack.direct_copy_from(unsafe { stack.top().add(64) }, 256, 0);
        Ok(())
    }
}
