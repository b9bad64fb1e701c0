// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Remotable heap. Each rank owns a pool inside a symmetric window and is the
//! only rank that allocates from it, but *any* rank may deallocate a block
//! one-sidedly: a remote free flags the block header through the shared
//! mapping, and the owner reclaims flagged blocks lazily when it next runs
//! out of space. The flag doubles as a liveness signal through
//! [RemotableHeap::is_remotely_freed].

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    scheduler::wsqueue::align_up,
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
    cell::RefCell,
    mem,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Allocation granularity and alignment, in bytes.
const ALLOC_ALIGN: usize = 16;

/// Block header flag values.
const BLOCK_LIVE: i32 = 0;
const BLOCK_REMOTELY_FREED: i32 = 1;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Header preceding every allocated block, resident in window memory so that
/// remote workers can flag it.
#[repr(C)]
struct BlockHeader {
    /// Total extent of the block, header included.
    extent: usize,
    /// Set to [BLOCK_REMOTELY_FREED] by a one-sided deallocation.
    remote_free: i32,
    _pad: i32,
}

/// Owner-side bookkeeping. Addresses are window addresses; only the owning
/// worker touches this, so plain cells suffice.
struct HeapState {
    /// Free extents `(addr, size)`, unordered, first fit.
    free: Vec<(usize, usize)>,
    /// Live blocks handed out by this owner `(header_addr, extent)`.
    outstanding: Vec<(usize, usize)>,
}

/// A pool of memory that is allocated locally and may be freed from any rank.
pub struct RemotableHeap {
    win: SymmetricWindow,
    state: RefCell<HeapState>,
    name: String,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl RemotableHeap {
    /// Collectively creates a heap with `pool_size` bytes per rank.
    pub fn create(topo: &Topology, tag: &str, pool_size: usize) -> Result<Self, Fail> {
        let win: SymmetricWindow = SymmetricWindow::create(topo, tag, pool_size)?;
        let state: HeapState = HeapState {
            free: vec![(win.local_ptr() as usize, win.slice_size())],
            outstanding: Vec::new(),
        };
        Ok(Self {
            win,
            state: RefCell::new(state),
            name: tag.to_string(),
        })
    }

    /// Allocates `size` bytes from the local pool. Aborts the process when the
    /// pool is exhausted even after reclaiming remotely freed blocks.
    pub fn allocate(&self, size: usize) -> *mut u8 {
        let extent: usize = align_up(size, ALLOC_ALIGN) + mem::size_of::<BlockHeader>();

        if let Some(addr) = self.try_carve(extent) {
            return self.commit(addr, extent);
        }

        // Out of space: reclaim blocks that peers freed one-sidedly, then
        // retry once.
        self.sweep_remotely_freed();
        if let Some(addr) = self.try_carve(extent) {
            return self.commit(addr, extent);
        }

        panic!(
            "remotable heap '{}' exhausted (requested {} bytes of {})",
            self.name,
            size,
            self.win.slice_size()
        );
    }

    /// Deallocates a block. The owner frees locally; any other rank flags the
    /// block header through the window.
    pub fn deallocate(&self, ptr: *mut u8, _size: usize) {
        let header: *mut BlockHeader = Self::header_of(ptr);
        if self.win.owner_of(header as *const u8) == self.my_rank() {
            let addr: usize = header as usize;
            let mut state = self.state.borrow_mut();
            let idx: usize = state
                .outstanding
                .iter()
                .position(|&(a, _)| a == addr)
                .expect("freeing a block this heap never allocated");
            let (_, extent): (usize, usize) = state.outstanding.swap_remove(idx);
            state.free.push((addr, extent));
        } else {
            window::atomic_put_i32(unsafe { &mut (*header).remote_free }, BLOCK_REMOTELY_FREED);
        }
    }

    /// Whether a block allocated by this rank has been freed by a remote one.
    pub fn is_remotely_freed(&self, ptr: *mut u8) -> bool {
        let header: *mut BlockHeader = Self::header_of(ptr);
        window::atomic_get_i32(unsafe { &(*header).remote_free }) == BLOCK_REMOTELY_FREED
    }

    /// Whether `ptr` points into this heap's window.
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.win.contains(ptr)
    }

    fn my_rank(&self) -> Rank {
        self.win.owner_of(self.win.local_ptr())
    }

    fn header_of(ptr: *mut u8) -> *mut BlockHeader {
        unsafe { (ptr as *mut BlockHeader).sub(1) }
    }

    fn try_carve(&self, extent: usize) -> Option<usize> {
        let mut state = self.state.borrow_mut();
        let idx: usize = state.free.iter().position(|&(_, size)| size >= extent)?;
        let (addr, size): (usize, usize) = state.free.swap_remove(idx);
        if size > extent {
            state.free.push((addr + extent, size - extent));
        }
        Some(addr)
    }

    fn commit(&self, addr: usize, extent: usize) -> *mut u8 {
        let header: *mut BlockHeader = addr as *mut BlockHeader;
        unsafe {
            (*header).extent = extent;
            (*header).remote_free = BLOCK_LIVE;
        }
        self.state.borrow_mut().outstanding.push((addr, extent));
        unsafe { (header as *mut u8).add(mem::size_of::<BlockHeader>()) }
    }

    fn sweep_remotely_freed(&self) {
        let mut state = self.state.borrow_mut();
        let mut reclaimed: usize = 0;
        let mut i: usize = 0;
        while i < state.outstanding.len() {
            let (addr, extent): (usize, usize) = state.outstanding[i];
            let header: *mut BlockHeader = addr as *mut BlockHeader;
            if window::atomic_get_i32(unsafe { &(*header).remote_free }) == BLOCK_REMOTELY_FREED {
                state.outstanding.swap_remove(i);
                state.free.push((addr, extent));
                reclaimed += extent;
            } else {
                i += 1;
            }
        }
        debug!("heap '{}': swept {} remotely freed bytes", self.name, reclaimed);
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        RemotableHeap,
        BLOCK_REMOTELY_FREED,
    };
    use crate::runtime::topology::{
        window,
        Topology,
    };
    use ::anyhow::Result;

    fn heap(tag: &str, pool: usize) -> Result<(Topology, RemotableHeap)> {
        let session: String = format!("spindle-test-heap-{}-{}", tag, std::process::id());
        let topo: Topology = Topology::attach(0, 1, &session)?;
        let heap: RemotableHeap = RemotableHeap::create(&topo, "h", pool)?;
        Ok((topo, heap))
    }

    /// Tests allocate/deallocate round trips and reuse.
    #[test]
    fn allocate_deallocate() -> Result<()> {
        let (_topo, heap): (Topology, RemotableHeap) = heap("alloc", 64 * 1024)?;

        let a: *mut u8 = heap.allocate(100);
        let b: *mut u8 = heap.allocate(100);
        crate::ensure_neq!(a, b);
        crate::ensure_eq!(heap.contains(a), true);
        crate::ensure_eq!(heap.is_remotely_freed(a), false);

        heap.deallocate(a, 100);
        heap.deallocate(b, 100);

        // Freed space must be reusable.
        let c: *mut u8 = heap.allocate(100);
        heap.deallocate(c, 100);
        Ok(())
    }

    /// Tests that blocks flagged as remotely freed are reclaimed when the
    /// pool runs dry.
    #[test]
    fn sweep_reclaims_flagged_blocks() -> Result<()> {
        let (_topo, heap): (Topology, RemotableHeap) = heap("sweep", 4096)?;

        // Exhaust the pool: 9 blocks of extent 432 leave less than one extent.
        let mut blocks: Vec<*mut u8> = Vec::new();
        for _ in 0..9 {
            blocks.push(heap.allocate(400));
        }

        // Flag every block the way a remote free would.
        for &ptr in blocks.iter() {
            let header: *mut super::BlockHeader = RemotableHeap::header_of(ptr);
            window::atomic_put_i32(unsafe { &mut (*header).remote_free }, BLOCK_REMOTELY_FREED);
            crate::ensure_eq!(heap.is_remotely_freed(ptr), true);
        }

        // The next allocation must succeed by sweeping.
        let ptr: *mut u8 = heap.allocate(400);
        heap.deallocate(ptr, 400);
        Ok(())
    }
}
