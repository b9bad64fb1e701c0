// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Multi-level work-stealing queues. Each rank owns one bounded deque per
//! distribution-tree depth, laid out in a symmetric window so that thieves
//! operate on a victim's levels one-sidedly. The owner pushes and pops at the
//! base end (LIFO); thieves take from the top end (FIFO) under a per-level
//! try-lock; `pass` prepends an entry onto a *remote* level, which is how
//! non-cross-worker tasks migrate to their owners.

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
    sync::atomic::{
        fence,
        Ordering,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Byte size of a per-level header (one cache line).
const LEVEL_HEADER_SIZE: usize = 64;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Per-level deque state. Indices are monotonic (and may go negative through
/// `pass`); the live entries are `[top, base)`.
#[repr(C)]
struct LevelHeader {
    top: i64,
    base: i64,
    lock: i32,
    _pad: [u8; LEVEL_HEADER_SIZE - 20],
}

/// A set of per-depth work-stealing deques, one set per rank.
pub struct WsQueue<T: Copy> {
    win: SymmetricWindow,
    n_levels: usize,
    capacity: usize,
    level_stride: usize,
    my_rank: Rank,
    _marker: PhantomData<T>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl<T: Copy> WsQueue<T> {
    /// Collectively creates the queues: `n_levels` deques of `capacity`
    /// entries per rank.
    pub fn create(topo: &Topology, tag: &str, capacity: usize, n_levels: usize) -> Result<Self, Fail> {
        let entries_bytes: usize = capacity * mem::size_of::<T>();
        let level_stride: usize = LEVEL_HEADER_SIZE + align_up(entries_bytes, LEVEL_HEADER_SIZE);
        let win: SymmetricWindow = SymmetricWindow::create(topo, tag, n_levels * level_stride)?;
        Ok(Self {
            win,
            n_levels,
            capacity,
            level_stride,
            my_rank: topo.my_rank(),
            _marker: PhantomData,
        })
    }

    pub fn n_levels(&self) -> usize {
        self.n_levels
    }

    /// Pushes an entry onto the owner's deque at `depth`.
    pub fn push(&self, entry: T, depth: usize) {
        let h: *mut LevelHeader = self.header(self.my_rank, depth);
        let top: i64 = window::atomic_get_i64(unsafe { &(*h).top });
        let base: i64 = window::atomic_get_i64(unsafe { &(*h).base });
        if base - top >= self.capacity as i64 {
            panic!(
                "work-stealing queue overflow (depth={}, capacity={}); raise the queue capacity",
                depth, self.capacity
            );
        }
        unsafe { self.entry(self.my_rank, depth, base).write(entry) };
        window::atomic_put_i64(unsafe { &mut (*h).base }, base + 1);
    }

    /// Pops the most recently pushed entry at `depth`, if any.
    pub fn pop(&self, depth: usize) -> Option<T> {
        let h: *mut LevelHeader = self.header(self.my_rank, depth);
        let base: i64 = window::atomic_get_i64(unsafe { &(*h).base }) - 1;
        window::atomic_put_i64(unsafe { &mut (*h).base }, base);
        fence(Ordering::SeqCst);
        let top: i64 = window::atomic_get_i64(unsafe { &(*h).top });

        if top < base {
            // More than one entry: no thief can reach this one.
            return Some(unsafe { self.entry(self.my_rank, depth, base).read() });
        }
        if top > base {
            // Empty: undo the claim.
            window::atomic_put_i64(unsafe { &mut (*h).base }, base + 1);
            return None;
        }

        // Single entry: settle the race with thieves under the level lock.
        self.lock_level(self.my_rank, depth);
        let top: i64 = window::atomic_get_i64(unsafe { &(*h).top });
        let entry: Option<T> = if top <= base {
            Some(unsafe { self.entry(self.my_rank, depth, base).read() })
        } else {
            window::atomic_put_i64(unsafe { &mut (*h).base }, base + 1);
            None
        };
        self.unlock(self.my_rank, depth);
        entry
    }

    /// Steals the oldest entry of `rank`'s deque at `depth`. The caller must
    /// hold the level lock (see [WsQueue::trylock]).
    pub fn steal_nolock(&self, rank: Rank, depth: usize) -> Option<T> {
        let h: *mut LevelHeader = self.header(rank, depth);
        let top: i64 = window::atomic_get_i64(unsafe { &(*h).top });
        fence(Ordering::SeqCst);
        let base: i64 = window::atomic_get_i64(unsafe { &(*h).base });
        if top >= base {
            return None;
        }
        let entry: T = unsafe { self.entry(rank, depth, top).read() };
        window::atomic_put_i64(unsafe { &mut (*h).top }, top + 1);
        Some(entry)
    }

    /// Returns the last stolen entry to `rank`'s deque at `depth`. The caller
    /// must still hold the level lock of the matching [WsQueue::steal_nolock].
    pub fn abort_steal(&self, rank: Rank, depth: usize) {
        let h: *mut LevelHeader = self.header(rank, depth);
        let top: i64 = window::atomic_get_i64(unsafe { &(*h).top });
        window::atomic_put_i64(unsafe { &mut (*h).top }, top - 1);
    }

    /// Prepends an entry onto `rank`'s deque at `depth` from the outside.
    /// Prepended entries are the first to be stolen and the last to be
    /// popped.
    pub fn pass(&self, entry: T, rank: Rank, depth: usize) {
        self.lock_level(rank, depth);
        let h: *mut LevelHeader = self.header(rank, depth);
        let top: i64 = window::atomic_get_i64(unsafe { &(*h).top }) - 1;
        let base: i64 = window::atomic_get_i64(unsafe { &(*h).base });
        if base - top > self.capacity as i64 {
            self.unlock(rank, depth);
            panic!(
                "work-stealing queue overflow on pass (target={}, depth={}, capacity={})",
                rank, depth, self.capacity
            );
        }
        unsafe { self.entry(rank, depth, top).write(entry) };
        window::atomic_put_i64(unsafe { &mut (*h).top }, top);
        self.unlock(rank, depth);
    }

    /// Tries to take the steal lock of `rank`'s level at `depth`.
    pub fn trylock(&self, rank: Rank, depth: usize) -> bool {
        let h: *mut LevelHeader = self.header(rank, depth);
        window::atomic_cas_i32(unsafe { &mut (*h).lock }, 0, 1) == 0
    }

    /// Releases the steal lock.
    pub fn unlock(&self, rank: Rank, depth: usize) {
        let h: *mut LevelHeader = self.header(rank, depth);
        window::atomic_put_i32(unsafe { &mut (*h).lock }, 0);
    }

    /// Whether `rank`'s deque at `depth` currently holds entries.
    pub fn is_nonempty(&self, rank: Rank, depth: usize) -> bool {
        let h: *mut LevelHeader = self.header(rank, depth);
        window::atomic_get_i64(unsafe { &(*h).top }) < window::atomic_get_i64(unsafe { &(*h).base })
    }

    /// Scans `rank`'s depths in `[min_depth, max_depth)` and invokes `f` once
    /// per non-empty level, stopping when `f` returns true. `shallow_first`
    /// selects the scan direction.
    pub fn for_each_nonempty_queue<F>(&self, rank: Rank, min_depth: usize, max_depth: usize, shallow_first: bool, mut f: F)
    where
        F: FnMut(usize) -> bool,
    {
        if shallow_first {
            for d in min_depth..max_depth {
                if self.is_nonempty(rank, d) && f(d) {
                    return;
                }
            }
        } else {
            for d in (min_depth..max_depth).rev() {
                if self.is_nonempty(rank, d) && f(d) {
                    return;
                }
            }
        }
    }

    /// Iterates over the owner's live entries at `depth`, allowing in-place
    /// fixups (used when on-stack continuations are evacuated).
    pub fn for_each_entry<F>(&self, depth: usize, mut f: F)
    where
        F: FnMut(&mut T),
    {
        self.lock_level(self.my_rank, depth);
        let h: *mut LevelHeader = self.header(self.my_rank, depth);
        let top: i64 = window::atomic_get_i64(unsafe { &(*h).top });
        let base: i64 = window::atomic_get_i64(unsafe { &(*h).base });
        for i in top..base {
            f(unsafe { &mut *self.entry(self.my_rank, depth, i) });
        }
        self.unlock(self.my_rank, depth);
    }

    fn lock_level(&self, rank: Rank, depth: usize) {
        while !self.trylock(rank, depth) {
            unsafe { libc::sched_yield() };
        }
    }

    fn header(&self, rank: Rank, depth: usize) -> *mut LevelHeader {
        debug_assert!(depth < self.n_levels);
        unsafe { self.win.rank_ptr(rank).add(depth * self.level_stride) as *mut LevelHeader }
    }

    fn entry(&self, rank: Rank, depth: usize, index: i64) -> *mut T {
        let slot: usize = index.rem_euclid(self.capacity as i64) as usize;
        unsafe {
            (self.win.rank_ptr(rank).add(depth * self.level_stride + LEVEL_HEADER_SIZE) as *mut T).add(slot)
        }
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

pub(crate) fn align_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::WsQueue;
    use crate::runtime::topology::Topology;
    use ::anyhow::Result;

    fn queue(tag: &str, capacity: usize, levels: usize) -> Result<(Topology, WsQueue<u64>)> {
        let session: String = format!("spindle-test-wsq-{}-{}", tag, std::process::id());
        let topo: Topology = Topology::attach(0, 1, &session)?;
        let q: WsQueue<u64> = WsQueue::create(&topo, "q", capacity, levels)?;
        Ok((topo, q))
    }

    /// Owner-side pops are LIFO.
    #[test]
    fn pop_is_lifo() -> Result<()> {
        let (_topo, q): (Topology, WsQueue<u64>) = queue("lifo", 16, 2)?;
        for v in 0..4u64 {
            q.push(v, 0);
        }
        for v in (0..4u64).rev() {
            crate::ensure_eq!(q.pop(0), Some(v));
        }
        crate::ensure_eq!(q.pop(0), None);
        Ok(())
    }

    /// Thief-side steals are FIFO and respect abort.
    #[test]
    fn steal_is_fifo() -> Result<()> {
        let (_topo, q): (Topology, WsQueue<u64>) = queue("fifo", 16, 1)?;
        for v in 10..14u64 {
            q.push(v, 0);
        }

        crate::ensure_eq!(q.trylock(0, 0), true);
        crate::ensure_eq!(q.steal_nolock(0, 0), Some(10));
        crate::ensure_eq!(q.steal_nolock(0, 0), Some(11));
        // A rejected steal goes back to the top end.
        q.abort_steal(0, 0);
        crate::ensure_eq!(q.steal_nolock(0, 0), Some(11));
        q.unlock(0, 0);

        crate::ensure_eq!(q.pop(0), Some(13));
        crate::ensure_eq!(q.pop(0), Some(12));
        crate::ensure_eq!(q.pop(0), None);
        Ok(())
    }

    /// Passed entries are stolen first and popped last.
    #[test]
    fn pass_prepends() -> Result<()> {
        let (_topo, q): (Topology, WsQueue<u64>) = queue("pass", 16, 1)?;
        q.push(1, 0);
        q.pass(99, 0, 0);

        crate::ensure_eq!(q.pop(0), Some(1));
        crate::ensure_eq!(q.pop(0), Some(99));
        crate::ensure_eq!(q.pop(0), None);

        q.push(1, 0);
        q.pass(99, 0, 0);
        crate::ensure_eq!(q.trylock(0, 0), true);
        crate::ensure_eq!(q.steal_nolock(0, 0), Some(99));
        crate::ensure_eq!(q.steal_nolock(0, 0), Some(1));
        q.unlock(0, 0);
        Ok(())
    }

    /// Non-empty level scans visit depths in the requested order.
    #[test]
    fn nonempty_scan_order() -> Result<()> {
        let (_topo, q): (Topology, WsQueue<u64>) = queue("scan", 16, 4)?;
        q.push(7, 1);
        q.push(8, 3);

        let mut seen: Vec<usize> = Vec::new();
        q.for_each_nonempty_queue(0, 0, 4, true, |d| {
            seen.push(d);
            false
        });
        crate::ensure_eq!(seen.clone(), vec![1, 3]);

        seen.clear();
        q.for_each_nonempty_queue(0, 0, 4, false, |d| {
            seen.push(d);
            true
        });
        crate::ensure_eq!(seen, vec![3]);
        Ok(())
    }

    /// Entry fixups observe every live entry.
    #[test]
    fn for_each_entry_visits_all() -> Result<()> {
        let (_topo, q): (Topology, WsQueue<u64>) = queue("fixup", 16, 1)?;
        for v in 0..5u64 {
            q.push(v, 0);
        }
        q.for_each_entry(0, |e: &mut u64| *e += 100);
        for v in (100..105u64).rev() {
            crate::ensure_eq!(q.pop(0), Some(v));
        }
        Ok(())
    }

    /// Overflow is fatal with a specific diagnostic.
    #[test]
    #[should_panic(expected = "work-stealing queue overflow")]
    fn overflow_panics() {
        let session: String = format!("spindle-test-wsq-ovf-{}", std::process::id());
        let topo: Topology = Topology::attach(0, 1, &session).unwrap();
        let q: WsQueue<u64> = WsQueue::create(&topo, "q", 4, 1).unwrap();
        for v in 0..5u64 {
            q.push(v, 0);
        }
    }
}
