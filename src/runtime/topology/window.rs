// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    pal::SharedMemory,
    runtime::{
        fail::Fail,
        topology::{
            page_align,
            Rank,
            Topology,
        },
    },
};
use ::std::sync::atomic::{
    fence,
    AtomicI32,
    AtomicI64,
    Ordering,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Number of open attempts made while waiting for a peer's segment to appear.
const OPEN_RETRY_ATTEMPTS: usize = 10000;

//======================================================================================================================
// Structures
//======================================================================================================================

/// A symmetric shared-memory window.
///
/// Every rank contributes one slice of `slice_size` bytes, backed by its own
/// shared-memory object, and all slices are mapped contiguously at the *same*
/// base address on every rank. A pointer into the window is therefore valid on
/// any rank and addresses the same physical bytes, which is what makes
/// one-sided operations plain loads and stores.
pub struct SymmetricWindow {
    base: *mut u8,
    slice_size: usize,
    n_ranks: Rank,
    my_rank: Rank,
    /// Keeps every slice mapping alive; drop order unmaps them.
    #[allow(unused)]
    segments: Vec<SharedMemory>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl SymmetricWindow {
    /// Collectively creates a window with `slice_bytes` bytes per rank. Must
    /// be called by every rank of the topology with identical arguments. The
    /// backing objects are zero-filled.
    pub fn create(topo: &Topology, tag: &str, slice_bytes: usize) -> Result<Self, Fail> {
        let slice_size: usize = page_align(slice_bytes);
        let n_ranks: Rank = topo.n_ranks();
        let my_rank: Rank = topo.my_rank();
        let base: *mut u8 = topo.reserve_same_va(slice_size * n_ranks as usize)?;

        let mut segments: Vec<SharedMemory> = Vec::with_capacity(n_ranks as usize);
        let mut own: SharedMemory = SharedMemory::create(&topo.segment_name(tag, my_rank), slice_size)?;
        own.map_at(unsafe { base.add(my_rank as usize * slice_size) })?;
        segments.push(own);

        // Everyone has created its slice before anyone opens a peer's.
        topo.barrier();

        for rank in 0..n_ranks {
            if rank == my_rank {
                continue;
            }
            let mut seg: SharedMemory =
                SharedMemory::open_retry(&topo.segment_name(tag, rank), slice_size, OPEN_RETRY_ATTEMPTS)?;
            seg.map_at(unsafe { base.add(rank as usize * slice_size) })?;
            segments.push(seg);
        }

        // No rank proceeds until every rank has the full window mapped;
        // otherwise an early one-sided access could hit an unmapped slice.
        topo.barrier();

        trace!(
            "window created (tag={}, base={:p}, slice={}, ranks={})",
            tag,
            base,
            slice_size,
            n_ranks
        );

        Ok(Self {
            base,
            slice_size,
            n_ranks,
            my_rank,
            segments,
        })
    }

    /// Base address of the window (identical on every rank).
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// Bytes per rank.
    pub fn slice_size(&self) -> usize {
        self.slice_size
    }

    /// Pointer to the start of this rank's slice.
    pub fn local_ptr(&self) -> *mut u8 {
        self.rank_ptr(self.my_rank)
    }

    /// Pointer to the start of `rank`'s slice.
    pub fn rank_ptr(&self, rank: Rank) -> *mut u8 {
        debug_assert!(0 <= rank && rank < self.n_ranks);
        unsafe { self.base.add(rank as usize * self.slice_size) }
    }

    /// Rank whose slice contains `addr`.
    pub fn owner_of(&self, addr: *const u8) -> Rank {
        debug_assert!(self.contains(addr));
        ((addr as usize - self.base as usize) / self.slice_size) as Rank
    }

    /// Whether `addr` falls inside the window.
    pub fn contains(&self, addr: *const u8) -> bool {
        let addr: usize = addr as usize;
        let base: usize = self.base as usize;
        addr >= base && addr < base + self.slice_size * self.n_ranks as usize
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// The window is only handed between contexts of the same single-threaded
/// worker; peers access it through their own mapping.
unsafe impl Send for SymmetricWindow {}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

// One-sided operations. All of these take raw window pointers, which are
// valid on every rank under the uni-address scheme.

/// One-sided atomic read of an `i32`.
pub fn atomic_get_i32(addr: *const i32) -> i32 {
    unsafe { (*(addr as *const AtomicI32)).load(Ordering::SeqCst) }
}

/// One-sided atomic write of an `i32`.
pub fn atomic_put_i32(addr: *mut i32, value: i32) {
    unsafe { (*(addr as *const AtomicI32)).store(value, Ordering::SeqCst) }
}

/// One-sided atomic compare-and-swap of an `i32`. Returns the previous value.
pub fn atomic_cas_i32(addr: *mut i32, current: i32, new: i32) -> i32 {
    match unsafe { (*(addr as *const AtomicI32)).compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst) } {
        Ok(prev) => prev,
        Err(prev) => prev,
    }
}

/// One-sided atomic fetch-and-add of an `i32`. Returns the previous value.
pub fn atomic_faa_i32(addr: *mut i32, value: i32) -> i32 {
    unsafe { (*(addr as *const AtomicI32)).fetch_add(value, Ordering::SeqCst) }
}

/// One-sided atomic read of an `i64`.
pub fn atomic_get_i64(addr: *const i64) -> i64 {
    unsafe { (*(addr as *const AtomicI64)).load(Ordering::SeqCst) }
}

/// One-sided atomic write of an `i64`.
pub fn atomic_put_i64(addr: *mut i64, value: i64) {
    unsafe { (*(addr as *const AtomicI64)).store(value, Ordering::SeqCst) }
}

/// One-sided bulk read of `len` bytes from window memory.
pub fn get_bytes(dst: *mut u8, src: *const u8, len: usize) {
    fence(Ordering::SeqCst);
    unsafe { std::ptr::copy_nonoverlapping(src, dst, len) };
    fence(Ordering::SeqCst);
}

/// One-sided bulk write of `len` bytes into window memory.
pub fn put_bytes(dst: *mut u8, src: *const u8, len: usize) {
    fence(Ordering::SeqCst);
    unsafe { std::ptr::copy_nonoverlapping(src, dst, len) };
    fence(Ordering::SeqCst);
}

/// One-sided typed read.
pub fn get_value<T: Copy>(src: *const T) -> T {
    fence(Ordering::SeqCst);
    let value: T = unsafe { std::ptr::read_volatile(src) };
    fence(Ordering::SeqCst);
    value
}

/// One-sided typed write.
pub fn put_value<T: Copy>(dst: *mut T, value: T) {
    fence(Ordering::SeqCst);
    unsafe { std::ptr::write_volatile(dst, value) };
    fence(Ordering::SeqCst);
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        atomic_cas_i32,
        atomic_faa_i32,
        atomic_get_i32,
        atomic_put_i32,
        SymmetricWindow,
    };
    use crate::runtime::topology::Topology;
    use ::anyhow::Result;

    fn solo(tag: &str) -> Result<Topology> {
        let session: String = format!("spindle-test-win-{}-{}", tag, std::process::id());
        Ok(Topology::attach(0, 1, &session)?)
    }

    /// Tests geometry of a single-rank window.
    #[test]
    fn geometry() -> Result<()> {
        let topo: Topology = solo("geom")?;
        let win: SymmetricWindow = SymmetricWindow::create(&topo, "w", 8192)?;
        crate::ensure_eq!(win.local_ptr(), win.base());
        crate::ensure_eq!(win.owner_of(win.local_ptr()), 0);
        crate::ensure_eq!(win.contains(win.base()), true);
        Ok(())
    }

    /// Tests the one-sided atomic operations on window memory.
    #[test]
    fn atomics() -> Result<()> {
        let topo: Topology = solo("atomics")?;
        let win: SymmetricWindow = SymmetricWindow::create(&topo, "w", 4096)?;
        let p: *mut i32 = win.local_ptr() as *mut i32;

        crate::ensure_eq!(atomic_get_i32(p), 0);
        atomic_put_i32(p, 41);
        crate::ensure_eq!(atomic_faa_i32(p, 1), 41);
        crate::ensure_eq!(atomic_cas_i32(p, 42, 7), 42);
        crate::ensure_eq!(atomic_cas_i32(p, 42, 9), 7);
        crate::ensure_eq!(atomic_get_i32(p), 7);
        Ok(())
    }
}
