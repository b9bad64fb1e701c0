// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Runtime context. All process-wide state lives in a single [Runtime]
//! object placed in static storage: initialization follows the order
//! topology → call stack → allocators and queues → worker → global heap, and
//! teardown is the reverse. Static placement is load-bearing, not a
//! convenience: frames captured on one rank resume on another, so every
//! pointer to runtime state embedded in a frame must resolve to the same
//! address in every process (all workers run identical binaries with layout
//! randomization disabled).

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod context;
pub mod fail;
pub mod logging;
pub mod memory;
pub mod options;
pub mod scheduler;
pub mod stack;
pub mod topology;

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    memory::GlobalHeap,
    options::Options,
    scheduler::{
        TaskGroupData,
        Worker,
    },
    topology::{
        Rank,
        Topology,
    },
};
use ::std::{
    cell::UnsafeCell,
    rc::Rc,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// The per-process runtime instance.
pub struct Runtime {
    // Field order is teardown order (reverse of initialization): the
    // topology must outlive everything that holds windows in it.
    worker: Worker,
    global_heap: GlobalHeap,
    topo: Rc<Topology>,
}

/// Static home of the runtime. The worker is single-threaded and
/// cooperative; accesses re-enter only at scheduler suspension points.
struct RuntimeCell {
    inner: UnsafeCell<Option<Runtime>>,
}

unsafe impl Sync for RuntimeCell {}

static RUNTIME: RuntimeCell = RuntimeCell {
    inner: UnsafeCell::new(None),
};

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Initializes the runtime from the environment. Collective: every rank of
/// the launch must call it.
pub fn init() {
    logging::initialize();
    let topo: Topology = Topology::from_env().unwrap_or_else(|e| panic!("failed to attach topology: {}", e));
    init_with_topology(topo);
}

/// Initializes the runtime with an explicitly constructed topology (used by
/// multi-process test harnesses).
pub fn init_with(my_rank: Rank, n_ranks: Rank, session: &str) {
    logging::initialize();
    let topo: Topology =
        Topology::attach(my_rank, n_ranks, session).unwrap_or_else(|e| panic!("failed to attach topology: {}", e));
    init_with_topology(topo);
}

fn init_with_topology(topo: Topology) {
    let cell: &mut Option<Runtime> = unsafe { &mut *RUNTIME.inner.get() };
    assert!(cell.is_none(), "spindle runtime is already initialized");

    let options: Options = Options::from_env();
    let topo: Rc<Topology> = Rc::new(topo);
    let worker: Worker =
        Worker::create(topo.clone(), options.clone()).unwrap_or_else(|e| panic!("failed to create worker: {}", e));
    let global_heap: GlobalHeap = GlobalHeap::create(&topo, options.global_heap_size)
        .unwrap_or_else(|e| panic!("failed to create global heap: {}", e));

    *cell = Some(Runtime {
        worker,
        global_heap,
        topo,
    });
}

/// Tears the runtime down. Collective; requires no outstanding threads.
pub fn fini() {
    let cell: &mut Option<Runtime> = unsafe { &mut *RUNTIME.inner.get() };
    let rt: Runtime = cell.take().expect("spindle runtime is not initialized");
    assert!(rt.worker.is_spmd(), "fini() requires no outstanding threads");
    // Keep every rank attached until all have stopped touching shared
    // segments.
    rt.topo.barrier();
    drop(rt);
}

fn runtime() -> &'static mut Runtime {
    unsafe { (*RUNTIME.inner.get()).as_mut().expect("spindle runtime is not initialized") }
}

/// The per-process worker. Cooperative single-threaded access only.
pub(crate) fn worker_mut() -> &'static mut Worker {
    &mut runtime().worker
}

/// The global heap of the running instance.
pub(crate) fn global_heap() -> &'static GlobalHeap {
    &runtime().global_heap
}

/// Rank of this worker.
pub fn my_rank() -> Rank {
    runtime().topo.my_rank()
}

/// Number of workers in the launch.
pub fn n_ranks() -> Rank {
    runtime().topo.n_ranks()
}

/// Blocking barrier over all ranks. Collective; SPMD context only.
pub fn barrier() {
    runtime().topo.barrier()
}

/// Whether the current context is the SPMD region (the symmetric outermost
/// context of every worker), as opposed to a task spawned via [root_exec].
pub fn is_spmd() -> bool {
    runtime().worker.is_spmd()
}

/// Collective: runs `f` as the root of a task tree distributed over all
/// workers and returns its value on every rank.
pub fn root_exec<T, F>(f: F) -> T
where
    T: Copy + 'static,
    F: FnOnce() -> T + Copy + 'static,
{
    worker_mut().root_exec(f)
}

/// Runs `f` once on every rank; only the calling rank receives the value.
/// Callable from the SPMD region or the root thread.
pub fn coll_exec<T, F>(f: F) -> T
where
    T: Copy + 'static,
    F: FnOnce() -> T + Copy + 'static,
{
    worker_mut().coll_exec(f)
}

/// Opens a task group in the current thread.
pub fn task_group_begin() -> TaskGroupData {
    worker_mut().task_group_begin()
}

/// Closes a task group, migrating the continuation back to the owner of the
/// group's distribution range if necessary.
pub fn task_group_end(tgdata: &mut TaskGroupData) {
    worker_mut().task_group_end(tgdata)
}

/// Cooperative scheduling point inside long-running user code.
pub fn poll() {
    worker_mut().poll()
}
