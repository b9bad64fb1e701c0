// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Process topology. Each worker of a launch is a separate process; the
//! topology layer discovers the worker's rank and the world size, attaches a
//! control segment in shared memory, and provides the collective primitives
//! everything else is built on: barriers (blocking and non-blocking), value
//! broadcast, and the collective reservation of identical virtual-address
//! ranges on every rank.

pub mod window;

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    pal::SharedMemory,
    runtime::fail::Fail,
};
use ::std::{
    cell::{
        Cell,
        RefCell,
    },
    env,
    mem,
    ptr,
    sync::atomic::{
        AtomicI64,
        AtomicU64,
        AtomicUsize,
        Ordering,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Value stored in the control segment once the leader has initialized it.
const CTRL_MAGIC: u64 = 0x5350494e444c4531;

/// Number of attempts made when collectively probing for a free address range.
const VA_PROBE_ATTEMPTS: usize = 64;

/// Capacity of the broadcast bounce buffer, in bytes.
pub const BCAST_CAPACITY: usize = 256;

/// Number of open attempts made while waiting for a peer's segment to appear.
const OPEN_RETRY_ATTEMPTS: usize = 10000;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Worker rank. Ranks are dense in `[0, n_ranks)`.
pub type Rank = i32;

/// Shared control segment. One per launch, created by rank 0.
#[repr(C)]
struct ControlSegment {
    magic: AtomicU64,
    barrier_arrivals: AtomicI64,
    ibarrier_arrivals: AtomicI64,
    probe_addr: AtomicUsize,
    probe_votes: AtomicI64,
    aslr_anchor: AtomicUsize,
    bcast_buf: [u8; BCAST_CAPACITY],
}

/// An outstanding non-blocking barrier.
///
/// Arrival counters are monotonic, so a request is just the arrival count at
/// which the barrier completes. All ranks must enter the same sequence of
/// non-blocking barriers.
#[derive(Clone, Copy)]
pub struct BarrierRequest {
    target: i64,
    arrivals: *const AtomicI64,
}

/// Process topology of one worker.
pub struct Topology {
    my_rank: Rank,
    n_ranks: Rank,
    session: String,
    /// Keeps the control mapping alive.
    #[allow(unused)]
    ctrl_shm: SharedMemory,
    ctrl: *mut ControlSegment,
    barrier_epoch: Cell<i64>,
    ibarrier_epoch: Cell<i64>,
    /// Failed probe reservations of rank 0, kept mapped so that the next
    /// probe returns a different address. Released once probing succeeds.
    probe_graveyard: RefCell<Vec<(*mut libc::c_void, usize)>>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Topology {
    /// Discovers the topology from the environment (`SPINDLE_RANK`,
    /// `SPINDLE_NRANKS`, `SPINDLE_SESSION`) and attaches the control segment.
    /// With no environment set, the worker forms a single-rank world.
    pub fn from_env() -> Result<Self, Fail> {
        let my_rank: Rank = parse_env_i32("SPINDLE_RANK", 0);
        let n_ranks: Rank = parse_env_i32("SPINDLE_NRANKS", 1);
        let session: String = match env::var("SPINDLE_SESSION") {
            Ok(s) => s,
            Err(_) => format!("solo{}", std::process::id()),
        };
        Self::attach(my_rank, n_ranks, &session)
    }

    /// Attaches to (or creates) the control segment of the given session.
    pub fn attach(my_rank: Rank, n_ranks: Rank, session: &str) -> Result<Self, Fail> {
        if n_ranks <= 0 || my_rank < 0 || my_rank >= n_ranks {
            return Err(Fail::new(
                libc::EINVAL,
                &format!("invalid topology (rank={}, n_ranks={})", my_rank, n_ranks),
            ));
        }

        let name: String = format!("/{}-ctrl", session);
        let size: usize = page_align(mem::size_of::<ControlSegment>());
        let mut ctrl_shm: SharedMemory = if my_rank == 0 {
            SharedMemory::create(&name, size)?
        } else {
            SharedMemory::open_retry(&name, size, OPEN_RETRY_ATTEMPTS)?
        };
        let ctrl: *mut ControlSegment = ctrl_shm.map()? as *mut ControlSegment;

        // The segment is zero-filled on creation; the leader publishes the
        // magic last so that peers observe a fully initialized segment.
        if my_rank == 0 {
            unsafe { (*ctrl).magic.store(CTRL_MAGIC, Ordering::Release) };
        } else {
            while unsafe { (*ctrl).magic.load(Ordering::Acquire) } != CTRL_MAGIC {
                std::hint::spin_loop();
            }
        }

        let topo: Topology = Self {
            my_rank,
            n_ranks,
            session: session.to_string(),
            ctrl_shm,
            ctrl,
            barrier_epoch: Cell::new(0),
            ibarrier_epoch: Cell::new(0),
            probe_graveyard: RefCell::new(Vec::new()),
        };

        topo.barrier();
        topo.check_aslr()?;

        info!("topology attached (rank={}, n_ranks={}, session={})", my_rank, n_ranks, session);
        Ok(topo)
    }

    pub fn my_rank(&self) -> Rank {
        self.my_rank
    }

    pub fn n_ranks(&self) -> Rank {
        self.n_ranks
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Builds the shared-memory object name for a per-rank resource.
    pub fn segment_name(&self, tag: &str, rank: Rank) -> String {
        format!("/{}-{}-{}", self.session, tag, rank)
    }

    /// Blocking barrier over all ranks.
    pub fn barrier(&self) {
        let epoch: i64 = self.barrier_epoch.get() + 1;
        self.barrier_epoch.set(epoch);
        let arrivals: &AtomicI64 = unsafe { &(*self.ctrl).barrier_arrivals };
        arrivals.fetch_add(1, Ordering::AcqRel);
        let target: i64 = epoch * self.n_ranks as i64;
        while arrivals.load(Ordering::Acquire) < target {
            unsafe { libc::sched_yield() };
        }
    }

    /// Enters a non-blocking barrier. Completion is observed with
    /// [BarrierRequest::test].
    pub fn barrier_arrive(&self) -> BarrierRequest {
        let epoch: i64 = self.ibarrier_epoch.get() + 1;
        self.ibarrier_epoch.set(epoch);
        let arrivals: &AtomicI64 = unsafe { &(*self.ctrl).ibarrier_arrivals };
        arrivals.fetch_add(1, Ordering::AcqRel);
        BarrierRequest {
            target: epoch * self.n_ranks as i64,
            arrivals: arrivals as *const AtomicI64,
        }
    }

    /// Broadcasts a plain-old-data value from `root` to every rank.
    pub fn broadcast_value<T: Copy>(&self, value: T, root: Rank) -> T {
        let size: usize = mem::size_of::<T>();
        assert!(
            size <= BCAST_CAPACITY,
            "broadcast value too large ({} > {} bytes)",
            size,
            BCAST_CAPACITY
        );
        let buf: *mut u8 = unsafe { (*self.ctrl).bcast_buf.as_ptr() as *mut u8 };
        if self.my_rank == root {
            unsafe { ptr::copy_nonoverlapping(&value as *const T as *const u8, buf, size) };
        }
        self.barrier();
        let out: T = unsafe { ptr::read_unaligned(buf as *const T) };
        // Keep the buffer owned by the broadcast until every rank has read it.
        self.barrier();
        out
    }

    /// Collectively reserves a virtual-address range of `size` bytes at the
    /// same address on every rank. The returned range is mapped `PROT_NONE`;
    /// callers carve it up with `MAP_FIXED` shared mappings.
    pub fn reserve_same_va(&self, size: usize) -> Result<*mut u8, Fail> {
        let size: usize = page_align(size);
        let probe_addr: &AtomicUsize = unsafe { &(*self.ctrl).probe_addr };
        let probe_votes: &AtomicI64 = unsafe { &(*self.ctrl).probe_votes };

        for _attempt in 0..VA_PROBE_ATTEMPTS {
            // The leader probes for a candidate range; peers try to pin the
            // same range without replacing anything they already hold.
            if self.my_rank == 0 {
                let addr: *mut libc::c_void = unsafe {
                    libc::mmap(
                        ptr::null_mut(),
                        size,
                        libc::PROT_NONE,
                        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                        -1,
                        0,
                    )
                };
                if addr == libc::MAP_FAILED {
                    return Err(Fail::new(libc::ENOMEM, "failed to probe for an address range"));
                }
                probe_addr.store(addr as usize, Ordering::Release);
            }
            self.barrier();

            let addr: *mut libc::c_void = probe_addr.load(Ordering::Acquire) as *mut libc::c_void;
            let pinned: bool = if self.my_rank == 0 {
                true
            } else {
                let ret: *mut libc::c_void = unsafe {
                    libc::mmap(
                        addr,
                        size,
                        libc::PROT_NONE,
                        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
                        -1,
                        0,
                    )
                };
                ret == addr
            };
            probe_votes.fetch_add(pinned as i64, Ordering::AcqRel);
            self.barrier();

            let votes: i64 = probe_votes.load(Ordering::Acquire);
            self.barrier();
            if self.my_rank == 0 {
                probe_votes.store(0, Ordering::Release);
            }
            self.barrier();

            if votes == self.n_ranks as i64 {
                if self.my_rank == 0 {
                    for (dead, dead_size) in self.probe_graveyard.borrow_mut().drain(..) {
                        unsafe { libc::munmap(dead, dead_size) };
                    }
                }
                trace!("reserve_same_va(): agreed on [{:p}, {:p})", addr, unsafe {
                    (addr as *mut u8).add(size)
                });
                return Ok(addr as *mut u8);
            }

            // Disagreement: release what we pinned. The leader parks its probe
            // mapping so the next probe lands somewhere else.
            if self.my_rank == 0 {
                self.probe_graveyard.borrow_mut().push((addr, size));
            } else if pinned {
                unsafe { libc::munmap(addr, size) };
            }
        }

        Err(Fail::new(
            libc::ENOMEM,
            "could not agree on a common virtual address range; disable ASLR and retry",
        ))
    }

    /// Yields the processor. Shared-memory transport needs no software
    /// progress engine, but oversubscribed launches benefit from yielding.
    pub fn make_progress(&self) {
        unsafe { libc::sched_yield() };
    }

    /// Verifies that the text segment sits at the same address on every rank.
    /// Frame migration copies code pointers verbatim, so address-space layout
    /// must be identical across the launch.
    fn check_aslr(&self) -> Result<(), Fail> {
        let anchor: usize = aslr_anchor as usize;
        let shared: &AtomicUsize = unsafe { &(*self.ctrl).aslr_anchor };
        if self.my_rank == 0 {
            shared.store(anchor, Ordering::Release);
        }
        self.barrier();
        if shared.load(Ordering::Acquire) != anchor {
            let cause: &str = "address-space layout differs between ranks; disable ASLR \
                               (e.g. run under `setarch $(uname -m) -R` or set \
                               /proc/sys/kernel/randomize_va_space to 0)";
            error!("check_aslr(): {}", cause);
            return Err(Fail::new(libc::EFAULT, cause));
        }
        self.barrier();
        Ok(())
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl BarrierRequest {
    /// Tests whether the barrier has completed. Never blocks.
    pub fn test(&self) -> bool {
        unsafe { (*self.arrivals).load(Ordering::Acquire) >= self.target }
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Address anchor used by the ASLR check.
#[inline(never)]
fn aslr_anchor() {}

/// Rounds `size` up to a multiple of the page size.
pub fn page_align(size: usize) -> usize {
    let page: usize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
    (size + page - 1) & !(page - 1)
}

fn parse_env_i32(name: &str, default: i32) -> i32 {
    match env::var(name) {
        Ok(s) => s
            .parse()
            .unwrap_or_else(|_| panic!("malformed value for {} (got {:?})", name, s)),
        Err(_) => default,
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::Topology;
    use ::anyhow::Result;

    fn solo(tag: &str) -> Result<Topology> {
        let session: String = format!("spindle-test-topo-{}-{}", tag, std::process::id());
        Ok(Topology::attach(0, 1, &session)?)
    }

    /// Tests attaching a single-rank world.
    #[test]
    fn attach_solo() -> Result<()> {
        let topo: Topology = solo("attach")?;
        crate::ensure_eq!(topo.my_rank(), 0);
        crate::ensure_eq!(topo.n_ranks(), 1);
        Ok(())
    }

    /// Tests that barriers and broadcast complete trivially at world size one.
    #[test]
    fn collectives_solo() -> Result<()> {
        let topo: Topology = solo("coll")?;
        topo.barrier();
        let req = topo.barrier_arrive();
        crate::ensure_eq!(req.test(), true);
        let v: u64 = topo.broadcast_value(0xabcd_u64, 0);
        crate::ensure_eq!(v, 0xabcd_u64);
        Ok(())
    }

    /// Tests that the reserved range is usable and page aligned.
    #[test]
    fn reserve_va() -> Result<()> {
        let topo: Topology = solo("va")?;
        let size: usize = 1 << 20;
        let base: *mut u8 = topo.reserve_same_va(size)?;
        crate::ensure_eq!((base as usize) % 4096, 0);
        unsafe { libc::munmap(base as *mut libc::c_void, size) };
        Ok(())
    }
}
