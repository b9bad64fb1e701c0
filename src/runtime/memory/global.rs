// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Global heap. A window-backed arena for user data containers: every rank
//! contributes a segment, all segments are mapped at identical addresses on
//! every rank, and a [GlobalPtr] is therefore dereferenceable anywhere in the
//! launch. The scheduler never interprets global pointers; only containers
//! and patterns do.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    topology::{
        window::SymmetricWindow,
        Rank,
        Topology,
    },
};
use ::std::{
    cell::Cell,
    marker::PhantomData,
    mem,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// A pointer into the global heap, valid on every rank.
pub struct GlobalPtr<T> {
    addr: *mut T,
    _marker: PhantomData<T>,
}

/// Arena allocator over the global window. Collective allocations live in
/// rank 0's segment and grow upwards; rank-local allocations grow downwards
/// from the top of the caller's own segment. There is no deallocation: the
/// heap is an arena tied to the lifetime of the runtime.
pub struct GlobalHeap {
    win: SymmetricWindow,
    /// Bytes consumed by collective allocations (mirrored on every rank by
    /// the collective call discipline).
    coll_bump: Cell<usize>,
    /// Downward floor of rank-local allocations within the own segment.
    local_floor: Cell<usize>,
    my_rank: Rank,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl<T> GlobalPtr<T> {
    pub fn null() -> Self {
        Self {
            addr: ::std::ptr::null_mut(),
            _marker: PhantomData,
        }
    }

    pub fn is_null(&self) -> bool {
        self.addr.is_null()
    }

    pub fn as_ptr(&self) -> *mut T {
        self.addr
    }

    /// Pointer to the `n`-th element.
    pub fn add(&self, n: usize) -> GlobalPtr<T> {
        Self {
            addr: unsafe { self.addr.add(n) },
            _marker: PhantomData,
        }
    }
}

impl GlobalHeap {
    /// Collectively creates the heap with `segment_size` bytes per rank.
    pub fn create(topo: &Topology, segment_size: usize) -> Result<Self, Fail> {
        let win: SymmetricWindow = SymmetricWindow::create(topo, "global-heap", segment_size)?;
        let local_floor: usize = win.slice_size();
        Ok(Self {
            win,
            coll_bump: Cell::new(0),
            local_floor: Cell::new(local_floor),
            my_rank: topo.my_rank(),
        })
    }

    /// Allocates `n` elements of `T` in the caller's own segment.
    pub fn alloc<T>(&self, n: usize) -> GlobalPtr<T> {
        let bytes: usize = n * mem::size_of::<T>();
        let align: usize = mem::align_of::<T>().max(8);
        let floor: usize = self.local_floor.get();
        let new_floor: usize = floor
            .checked_sub(bytes)
            .map(|f| f & !(align - 1))
            .unwrap_or_else(|| self.die(bytes));
        let limit: usize = if self.my_rank == 0 { self.coll_bump.get() } else { 0 };
        if new_floor < limit {
            self.die(bytes);
        }
        self.local_floor.set(new_floor);
        GlobalPtr {
            addr: unsafe { self.win.local_ptr().add(new_floor) as *mut T },
            _marker: PhantomData,
        }
    }

    /// Allocates `n` elements of `T` collectively: the storage lives in rank
    /// 0's segment, and every rank that performs the same allocation sequence
    /// computes the same address.
    pub fn alloc_coll<T>(&self, n: usize) -> GlobalPtr<T> {
        let bytes: usize = n * mem::size_of::<T>();
        let align: usize = mem::align_of::<T>().max(8);
        let offset: usize = (self.coll_bump.get() + align - 1) & !(align - 1);
        if offset + bytes > self.win.slice_size() {
            self.die(bytes);
        }
        self.coll_bump.set(offset + bytes);
        GlobalPtr {
            addr: unsafe { self.win.rank_ptr(0).add(offset) as *mut T },
            _marker: PhantomData,
        }
    }

    /// The rank whose segment holds `ptr`.
    pub fn owner_of<T>(&self, ptr: GlobalPtr<T>) -> Rank {
        self.win.owner_of(ptr.as_ptr() as *const u8)
    }

    fn die(&self, bytes: usize) -> ! {
        panic!(
            "global heap exhausted (requested {} bytes of {})",
            bytes,
            self.win.slice_size()
        );
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl<T> Clone for GlobalPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for GlobalPtr<T> {}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::GlobalHeap;
    use crate::runtime::topology::Topology;
    use ::anyhow::Result;

    /// Tests local and collective allocations at world size one.
    #[test]
    fn alloc_local_and_coll() -> Result<()> {
        let session: String = format!("spindle-test-gheap-{}", std::process::id());
        let topo: Topology = Topology::attach(0, 1, &session)?;
        let heap: GlobalHeap = GlobalHeap::create(&topo, 1 << 16)?;

        let a = heap.alloc::<u64>(16);
        let b = heap.alloc::<u64>(16);
        crate::ensure_neq!(a.as_ptr(), b.as_ptr());
        crate::ensure_eq!(heap.owner_of(a), 0);

        let c = heap.alloc_coll::<u32>(10);
        crate::ensure_eq!(heap.owner_of(c), 0);
        unsafe {
            c.as_ptr().write(77);
            crate::ensure_eq!(c.as_ptr().read(), 77);
        }
        // Element addressing.
        crate::ensure_eq!(c.add(3).as_ptr() as usize - c.as_ptr() as usize, 12);
        Ok(())
    }
}
