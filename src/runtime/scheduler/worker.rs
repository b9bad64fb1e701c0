// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The worker: one per process, owning the scheduler machinery. Execution
//! alternates between user code on the uni-address call stack and the
//! scheduler loop on the native process stack. Forks either descend into the
//! child immediately (work-first, continuation pushed onto a local deque) or
//! pass the child to the owner of its distribution sub-range
//! (continuation-passing). Joins race the child for the continuation through
//! a fetch-and-add on the shared thread state.
//!
//! Concurrency discipline: the worker is single-threaded and cooperative.
//! Control only transfers at the suspension points (fork, the join race,
//! task-group end migration, poll, and the scheduler loop's resume paths).
//! Worker methods re-enter through raw pointers across stack switches; the
//! worker itself lives in static storage so that its address is identical on
//! every rank (frames captured on one rank resume on another).

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    context::{
        self,
        ContextFrame,
        FRAME_RESERVED,
    },
    fail::Fail,
    memory::RemotableHeap,
    options::Options,
    scheduler::{
        dag_prof::DagProfiler,
        drange::DistRange,
        dtree::{
            DistTree,
            NodeRef,
        },
        flipper::Flipper,
        mailbox::OneslotMailbox,
        task::{
            self,
            CallableTask,
            CollTask,
            CrossWorkerTask,
            MigrationEntry,
            PrimaryEntry,
            SuspendedState,
            TaskHeader,
            ThreadRetval,
            ThreadState,
            MAX_CALLABLE_TASK_SIZE,
        },
        thread::Thread,
        wsqueue::WsQueue,
    },
    stack::CallStack,
    topology::{
        window,
        BarrierRequest,
        Rank,
        Topology,
    },
    worker_mut,
};
use ::rand::{
    rngs::SmallRng,
    Rng,
    SeedableRng,
};
use ::std::{
    ffi::c_void,
    mem::{
        self,
        MaybeUninit,
    },
    ptr,
    rc::Rc,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Per-thread scheduler state. Lives on the user stack of the running thread
/// (it is a local of the frame that started the thread), so it migrates with
/// the thread and is swapped on suspend/resume.
pub struct ThreadLocalStorage {
    /// Distribution range of this thread.
    pub drange: DistRange,
    /// Distribution-tree node of the cross-worker task group this thread
    /// belongs to.
    pub dtree_node_ref: NodeRef,
    pub tg_version: Flipper,
    /// Whether this thread has not yet distributed child cross-worker tasks.
    pub undistributed: bool,
    pub dag_prof: DagProfiler,
}

/// Snapshot taken by `task_group_begin`, restored by `task_group_end`.
pub struct TaskGroupData {
    drange: DistRange,
    owns_dtree_node: bool,
    dag_prof: DagProfiler,
}

/// The per-process worker.
pub struct Worker {
    topo: Rc<Topology>,
    options: Options,
    max_depth: usize,
    stack: CallStack,
    coll_task_mailbox: OneslotMailbox<CollTask>,
    cross_worker_mailbox: OneslotMailbox<CrossWorkerTask>,
    primary_wsq: WsQueue<PrimaryEntry>,
    migration_wsq: WsQueue<MigrationEntry>,
    thread_state_heap: RemotableHeap,
    suspended_heap: RemotableHeap,
    dtree: DistTree,
    cf_top: *mut ContextFrame,
    sched_cf: *mut ContextFrame,
    tls: *mut ThreadLocalStorage,
    exit_request: Option<BarrierRequest>,
    use_primary_wsq: bool,
    dtree_local_bottom_ref: NodeRef,
    is_spmd: bool,
    rng: SmallRng,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Worker {
    /// Collectively creates the worker. Every rank must call this with
    /// identical options; the shared segments below are created in lockstep.
    pub fn create(topo: Rc<Topology>, options: Options) -> Result<Self, Fail> {
        let max_depth: usize = options.adws_max_depth;
        let n_levels: usize = max_depth + 1;

        let stack: CallStack = CallStack::create(&topo, options.stack_size)?;
        let coll_task_mailbox: OneslotMailbox<CollTask> = OneslotMailbox::create(&topo, "coll-mbox")?;
        let cross_worker_mailbox: OneslotMailbox<CrossWorkerTask> = OneslotMailbox::create(&topo, "cross-mbox")?;
        let primary_wsq: WsQueue<PrimaryEntry> =
            WsQueue::create(&topo, "primary-wsq", options.adws_wsqueue_capacity, n_levels)?;
        let migration_wsq: WsQueue<MigrationEntry> =
            WsQueue::create(&topo, "migration-wsq", options.adws_wsqueue_capacity, n_levels)?;
        let thread_state_heap: RemotableHeap =
            RemotableHeap::create(&topo, "thread-state", options.thread_state_allocator_size)?;
        let suspended_heap: RemotableHeap =
            RemotableHeap::create(&topo, "suspended-thread", options.suspended_thread_allocator_size)?;
        let dtree: DistTree = DistTree::create(&topo, max_depth)?;

        let my_rank: Rank = topo.my_rank();
        Ok(Self {
            topo,
            options,
            max_depth,
            stack,
            coll_task_mailbox,
            cross_worker_mailbox,
            primary_wsq,
            migration_wsq,
            thread_state_heap,
            suspended_heap,
            dtree,
            cf_top: ptr::null_mut(),
            sched_cf: ptr::null_mut(),
            tls: ptr::null_mut(),
            exit_request: None,
            use_primary_wsq: true,
            dtree_local_bottom_ref: NodeRef::default(),
            is_spmd: true,
            rng: SmallRng::seed_from_u64(0x737067 + my_rank as u64),
        })
    }

    pub fn is_spmd(&self) -> bool {
        self.is_spmd
    }

    /// Whether the current context is the root thread of a `root_exec`.
    pub fn is_executing_root(&self) -> bool {
        !self.cf_top.is_null() && self.cf_top == self.stack_top()
    }

    //==================================================================================================================
    // Root execution
    //==================================================================================================================

    /// Collective entry point: rank 0 runs `f` as the root thread of a task
    /// tree; every other rank serves its scheduler loop until the root thread
    /// completes. The result is broadcast, so every rank returns it.
    pub fn root_exec<T, F>(&mut self, f: F) -> T
    where
        T: Copy + 'static,
        F: FnOnce() -> T + Copy + 'static,
    {
        assert!(self.is_spmd, "root_exec() must be called from the SPMD region");
        self.is_spmd = false;

        let value: MaybeUninit<T> = if self.topo.my_rank() == 0 {
            MaybeUninit::new(self.root_exec_master(f))
        } else {
            self.sched_loop(|| {}, || true);
            MaybeUninit::uninit()
        };

        self.is_spmd = true;
        let value: MaybeUninit<T> = self.topo.broadcast_value(value, 0);
        unsafe { value.assume_init() }
    }

    fn root_exec_master<T, F>(&mut self, f: F) -> T
    where
        T: Copy + 'static,
        F: FnOnce() -> T + Copy + 'static,
    {
        let ts: *mut ThreadState<T> = self.thread_state_heap.allocate(mem::size_of::<ThreadState<T>>()) as *mut ThreadState<T>;
        unsafe { ThreadState::init(ts) };
        trace!("starting root thread {:p}", ts);

        let n_ranks: Rank = self.topo.n_ranks();
        unsafe {
            self.suspend(move |w: &mut Worker, cf: *mut ContextFrame| {
                w.sched_cf = cf;
                w.root_on_stack(move || {
                    let w: &mut Worker = worker_mut();
                    let mut tls: ThreadLocalStorage = ThreadLocalStorage {
                        drange: DistRange::new(n_ranks),
                        dtree_node_ref: NodeRef::default(),
                        tg_version: Flipper::default(),
                        undistributed: true,
                        dag_prof: DagProfiler::default(),
                    };
                    w.tls = &mut tls;
                    tls.dag_prof.start();
                    tls.dag_prof.increment_thread_count();
                    tls.dag_prof.increment_strand_count();

                    let ret: T = f();

                    let w: &mut Worker = worker_mut();
                    trace!("root thread {:p} completed", ts);
                    unsafe { (*w.tls).dag_prof.stop() };
                    w.on_root_die(ts, ret);
                });
            });
        }

        self.sched_loop(|| {}, move || window::atomic_get_i32(unsafe { &(*ts).resume_flag }) >= 1);

        let retval: ThreadRetval<T> = unsafe { window::get_value(&(*ts).retval).assume_init() };
        self.thread_state_heap.deallocate(ts as *mut u8, mem::size_of::<ThreadState<T>>());
        retval.value
    }

    fn on_root_die<T: Copy>(&mut self, ts: *mut ThreadState<T>, ret: T) -> ! {
        let retval: ThreadRetval<T> = ThreadRetval {
            value: ret,
            dag_prof: unsafe { (*self.tls).dag_prof },
        };
        window::put_value(unsafe { &mut (*ts).retval }, MaybeUninit::new(retval));
        window::atomic_put_i32(unsafe { &mut (*ts).resume_flag }, 1);
        self.resume_sched()
    }

    //==================================================================================================================
    // Task groups
    //==================================================================================================================

    pub fn task_group_begin(&mut self) -> TaskGroupData {
        let tls: &mut ThreadLocalStorage = unsafe { &mut *self.tls };
        tls.dag_prof.stop();

        let mut tgdata: TaskGroupData = TaskGroupData {
            drange: tls.drange,
            owns_dtree_node: false,
            dag_prof: tls.dag_prof,
        };

        if tls.drange.is_cross_worker() {
            if tls.dtree_node_ref.depth + 1 < self.max_depth as i32 {
                tls.dtree_node_ref = self.dtree.append(tls.dtree_node_ref, tls.drange, tls.tg_version);
                self.dtree_local_bottom_ref = tls.dtree_node_ref;
                tgdata.owns_dtree_node = true;
            }
            tls.undistributed = true;

            debug!(
                "begin cross-worker task group [{}, {}) at depth {}",
                tls.drange.begin(),
                tls.drange.end(),
                tls.dtree_node_ref.depth
            );
        }

        tls.dag_prof.clear();
        tls.dag_prof.start();
        tls.dag_prof.increment_strand_count();

        tgdata
    }

    pub fn task_group_end(&mut self, tgdata: &mut TaskGroupData) {
        // In case no threads were spawned in this task group.
        self.on_task_die();

        // Restore the distribution range this thread had when the group began.
        let tls: &mut ThreadLocalStorage = unsafe { &mut *self.tls };
        tls.drange = tgdata.drange;

        if tls.drange.is_cross_worker() {
            debug!(
                "end cross-worker task group [{}, {}) at depth {}",
                tls.drange.begin(),
                tls.drange.end(),
                tls.dtree_node_ref.depth
            );

            // Migrate the cross-worker task back to the owner of its range.
            let target_rank: Rank = tls.drange.owner();
            if target_rank != self.topo.my_rank() {
                unsafe {
                    self.suspend(move |w: &mut Worker, cf: *mut ContextFrame| {
                        let ss: SuspendedState = w.evacuate(cf);
                        debug!("migrating cross-worker continuation to rank {}", target_rank);
                        w.cross_worker_mailbox.put(
                            CrossWorkerTask {
                                evacuation_ptr: ss.evacuation_ptr,
                                frame_base: ss.frame_base,
                                frame_size: ss.frame_size,
                            },
                            target_rank,
                        );
                        w.evacuate_all();
                        w.resume_sched();
                    });
                }
            }

            let tls: &mut ThreadLocalStorage = unsafe { &mut *self.tls };
            if tgdata.owns_dtree_node {
                // Retire the completed task group to divert steals elsewhere.
                self.dtree.set_dominant(tls.dtree_node_ref, false);

                let node = self.dtree.get_local_node(tls.dtree_node_ref);
                tls.dtree_node_ref = node.parent;
                self.dtree_local_bottom_ref = node.parent;

                // The next sibling group reusing this depth gets a distinct
                // generation.
                tls.tg_version.flip(node.depth() as usize);
            }

            tls.undistributed = false;
        }

        let tls: &mut ThreadLocalStorage = unsafe { &mut *self.tls };
        tls.dag_prof.merge_serial(tgdata.dag_prof);
        tls.dag_prof.start();
        tls.dag_prof.increment_strand_count();
    }

    //==================================================================================================================
    // Fork and join
    //==================================================================================================================

    pub fn fork<T, F, CbF, CbD>(&mut self, th: &mut Thread<T>, on_drift_fork: CbF, on_drift_die: CbD, w_new: f64, w_rest: f64, f: F)
    where
        T: Copy + 'static,
        F: FnOnce() -> T + Copy + 'static,
        CbF: FnOnce() + Copy + 'static,
        CbD: FnOnce() + Copy + 'static,
    {
        assert!(!self.is_spmd, "fork() must be called inside root_exec");

        let my_rank: Rank = self.topo.my_rank();
        let ts: *mut ThreadState<T> = self.thread_state_heap.allocate(mem::size_of::<ThreadState<T>>()) as *mut ThreadState<T>;
        unsafe { ThreadState::init(ts) };
        th.state = ts;
        th.serialized = false;

        let tls: &mut ThreadLocalStorage = unsafe { &mut *self.tls };
        let new_drange: DistRange;
        let target_rank: Rank;
        if tls.drange.is_cross_worker() {
            // Avoid too fine-grained task migration.
            if tls.drange.is_sufficiently_small(self.options.adws_min_drange_size) {
                tls.drange.move_to_end_boundary();
            }

            let (dr_rest, dr_new): (DistRange, DistRange) = tls.drange.divide(w_rest, w_new);
            trace!(
                "range [{}, {}) divided into [{}, {}) and [{}, {})",
                tls.drange.begin(),
                tls.drange.end(),
                dr_rest.begin(),
                dr_rest.end(),
                dr_new.begin(),
                dr_new.end()
            );

            tls.drange = dr_rest;
            new_drange = dr_new;
            target_rank = dr_new.owner();
        } else {
            // Quick path for non-cross-worker tasks: no range division. This
            // task may have been stolen by a worker outside its task group,
            // so the target is the executing rank, not the range owner.
            new_drange = tls.drange;
            target_rank = my_rank;
        }

        if target_rank == my_rank {
            // Work-first: push the continuation, execute the new task now.
            let th_ptr: *mut Thread<T> = th;
            unsafe {
                self.suspend(move |w: &mut Worker, cf: *mut ContextFrame| {
                    let (node_ref, tg_version): (NodeRef, Flipper) = {
                        let parent_tls: &ThreadLocalStorage = &*w.tls;
                        (parent_tls.dtree_node_ref, parent_tls.tg_version)
                    };

                    let mut tls: ThreadLocalStorage = ThreadLocalStorage {
                        drange: new_drange,
                        dtree_node_ref: node_ref,
                        tg_version,
                        undistributed: true,
                        dag_prof: DagProfiler::default(),
                    };
                    w.tls = &mut tls;

                    let cf_size: usize = (*cf).parent as usize - cf as usize;
                    let level: usize = Self::level(node_ref.depth);
                    if w.use_primary_wsq {
                        w.primary_wsq.push(
                            PrimaryEntry {
                                evacuation_ptr: ptr::null_mut(),
                                frame_base: cf as *mut u8,
                                frame_size: cf_size,
                                tg_version,
                            },
                            level,
                        );
                    } else {
                        w.migration_wsq.push(
                            MigrationEntry {
                                is_continuation: true,
                                evacuation_ptr: ptr::null_mut(),
                                frame_base: cf as *mut u8,
                                frame_size: cf_size,
                                tg_version,
                            },
                            level,
                        );
                    }

                    tls.dag_prof.start();
                    tls.dag_prof.increment_thread_count();
                    tls.dag_prof.increment_strand_count();

                    let ret: T = f();

                    let w: &mut Worker = worker_mut();
                    w.on_task_die();
                    w.on_die_workfirst(ts, ret, on_drift_die);

                    // Reached only when the thread was serialized: nobody
                    // stole the continuation, so the fork degrades to a call.
                    w.thread_state_heap.deallocate(ts as *mut u8, mem::size_of::<ThreadState<T>>());
                    (*th_ptr).state = ptr::null_mut();
                    (*th_ptr).serialized = true;
                    (*th_ptr).retval_ser = MaybeUninit::new(ThreadRetval {
                        value: ret,
                        dag_prof: (*w.tls).dag_prof,
                    });
                });
            }

            // Reload the rank: this continuation may have been stolen and
            // resumed on another worker.
            if self.topo.my_rank() != my_rank {
                on_drift_fork();
            }
        } else {
            // Continuation-passing: hand the new task to the owner of its
            // sub-range and keep executing the continuation here.
            let node_ref: NodeRef = tls.dtree_node_ref;
            let tg_version: Flipper = tls.tg_version;

            let task_fn = move || {
                let w: &mut Worker = worker_mut();
                trace!("starting migrated thread {:p} [{}, {})", ts, new_drange.begin(), new_drange.end());

                let mut tls: ThreadLocalStorage = ThreadLocalStorage {
                    drange: new_drange,
                    dtree_node_ref: node_ref,
                    tg_version,
                    undistributed: true,
                    dag_prof: DagProfiler::default(),
                };
                w.tls = &mut tls;

                if new_drange.is_cross_worker() {
                    // This worker may never have seen the ancestor task
                    // groups of this thread.
                    w.dtree.copy_parents(node_ref);
                    w.dtree_local_bottom_ref = node_ref;
                }

                tls.dag_prof.start();
                tls.dag_prof.increment_thread_count();
                tls.dag_prof.increment_strand_count();

                if w.topo.my_rank() != my_rank {
                    on_drift_fork();
                }

                let ret: T = f();

                let w: &mut Worker = worker_mut();
                trace!("migrated thread {:p} completed", ts);
                w.on_task_die();
                w.on_die_drifted(ts, ret, on_drift_die);
            };

            let task_size: usize = CallableTask::<_>::size_of_val(&task_fn);
            let task_ptr: *mut u8 = self.suspended_heap.allocate(task_size);
            unsafe { CallableTask::write_to(task_ptr, task_fn) };

            if new_drange.is_cross_worker() {
                debug!("migrating cross-worker task {:p} to rank {}", ts, target_rank);
                self.cross_worker_mailbox.put(
                    CrossWorkerTask {
                        evacuation_ptr: ptr::null_mut(),
                        frame_base: task_ptr,
                        frame_size: task_size,
                    },
                    target_rank,
                );
            } else {
                debug!("migrating non-cross-worker task {:p} to rank {}", ts, target_rank);
                self.migration_wsq.pass(
                    MigrationEntry {
                        is_continuation: false,
                        evacuation_ptr: ptr::null_mut(),
                        frame_base: task_ptr,
                        frame_size: task_size,
                        tg_version,
                    },
                    target_rank,
                    Self::level(node_ref.depth),
                );
            }
        }

        // Restart so the profile only tracks the last task of the group.
        let tls: &mut ThreadLocalStorage = unsafe { &mut *self.tls };
        tls.dag_prof.clear();
        tls.dag_prof.start();
        tls.dag_prof.increment_strand_count();
    }

    pub fn join<T: Copy + 'static>(&mut self, th: &mut Thread<T>) -> T {
        // This point is also the end of the last task of a task group (which
        // may not have been spawned as a thread).
        self.on_task_die();

        let retval: ThreadRetval<T>;
        if th.serialized {
            // Fast path: the thread state was already reclaimed at the fork;
            // no shared memory is touched.
            retval = unsafe { th.retval_ser.assume_init() };
        } else {
            let ts: *mut ThreadState<T> = th.state;
            assert!(!ts.is_null());

            if window::atomic_get_i32(unsafe { &(*ts).resume_flag }) >= 1 {
                trace!("thread {:p} already joined", ts);
                retval = unsafe { window::get_value(&(*ts).retval).assume_init() };
            } else {
                let mut migrated: bool = true;
                let migrated_ptr: *mut bool = &mut migrated;
                unsafe {
                    self.suspend(move |w: &mut Worker, cf: *mut ContextFrame| {
                        let ss: SuspendedState = w.evacuate(cf);
                        window::put_value(&mut (*ts).suspended, ss);

                        // The race: exactly one of joiner and child observes 0.
                        if window::atomic_faa_i32(&mut (*ts).resume_flag, 1) == 0 {
                            trace!("won the join race for thread {:p} (joining side)", ts);
                            w.evacuate_all();
                            w.resume_sched();
                        } else {
                            trace!("lost the join race for thread {:p} (joining side)", ts);
                            w.suspended_heap.deallocate(ss.evacuation_ptr, ss.frame_size);
                            *migrated_ptr = false;
                            // Fall through: the on-stack frame resumes here.
                        }
                    });
                }
                trace!("resumed continuation of join (migrated={})", migrated);
                retval = unsafe { window::get_value(&(*ts).retval).assume_init() };
            }

            self.thread_state_heap.deallocate(ts as *mut u8, mem::size_of::<ThreadState<T>>());
            th.state = ptr::null_mut();
        }

        unsafe { (*self.tls).dag_prof.merge_parallel(retval.dag_prof) };
        retval.value
    }

    //==================================================================================================================
    // Task death
    //==================================================================================================================

    /// Invoked at every task termination point.
    fn on_task_die(&mut self) {
        let tls: &mut ThreadLocalStorage = unsafe { &mut *self.tls };
        if !tls.dag_prof.is_stopped() {
            tls.dag_prof.stop();
        }

        if tls.drange.is_cross_worker() {
            if tls.dtree_node_ref.depth >= 0 {
                // The parent task group becomes the dominant steal target
                // within its range of workers.
                debug!(
                    "dtree node (owner={}, depth={}) becomes dominant",
                    tls.dtree_node_ref.owner_rank, tls.dtree_node_ref.depth
                );
                self.dtree.set_dominant(tls.dtree_node_ref, true);

                if tls.undistributed && tls.drange.begin_rank() + 1 < tls.drange.end_rank() {
                    self.distribute_dtree_reference();
                }
            }

            // Leave the cross-worker scope so that the next join of the same
            // task group does not re-enter it. The group's range is restored
            // at task_group_end anyway.
            let tls: &mut ThreadLocalStorage = unsafe { &mut *self.tls };
            tls.drange.make_non_cross_worker();
        }
    }

    /// A cross-worker task completed without distributing child tasks to the
    /// inner workers of its range; send each a dummy task that copies the
    /// dtree path so they can steal under it.
    fn distribute_dtree_reference(&mut self) {
        let tls: &ThreadLocalStorage = unsafe { &*self.tls };
        let node_ref: NodeRef = tls.dtree_node_ref;
        let begin_rank: Rank = tls.drange.begin_rank();
        let end_rank: Rank = tls.drange.end_rank();

        let mut tasks: Vec<(CrossWorkerTask, Rank)> = Vec::new();
        for target_rank in (begin_rank + 1)..end_rank {
            let dummy_fn = move || {
                let w: &mut Worker = worker_mut();
                w.dtree.copy_parents(node_ref);
                w.dtree_local_bottom_ref = node_ref;
                w.resume_sched();
            };
            let task_size: usize = CallableTask::<_>::size_of_val(&dummy_fn);
            let task_ptr: *mut u8 = self.suspended_heap.allocate(task_size);
            unsafe { CallableTask::write_to(task_ptr, dummy_fn) };
            tasks.push((
                CrossWorkerTask {
                    evacuation_ptr: ptr::null_mut(),
                    frame_base: task_ptr,
                    frame_size: task_size,
                },
                target_rank,
            ));
        }

        for (t, target_rank) in tasks.iter() {
            self.cross_worker_mailbox.put(*t, *target_rank);
        }

        // Wait until every dummy task has been picked up (it is deallocated
        // on arrival). A barrier would avoid this spin, but would change the
        // collective surface of task death.
        for (t, _) in tasks.iter() {
            while !self.suspended_heap.is_remotely_freed(t.frame_base) {
                self.topo.make_progress();
            }
        }
    }

    fn on_die_workfirst<T, CbD>(&mut self, ts: *mut ThreadState<T>, ret: T, on_drift_die: CbD)
    where
        T: Copy + 'static,
        CbD: FnOnce() + Copy + 'static,
    {
        let level: usize = Self::level(unsafe { (*self.tls).dtree_node_ref.depth });
        if self.use_primary_wsq {
            if let Some(qe) = self.primary_wsq.pop(level) {
                if qe.evacuation_ptr.is_null() {
                    // The parent was popped back: serialized fast path. The
                    // uni-address scheme can alias frame_base across thread
                    // generations, but an on-stack entry on top of our own
                    // queue can only be our immediate parent.
                    debug_assert_eq!(qe.frame_base, self.cf_top as *mut u8);
                    return;
                }
                // Evacuated entries are not provably our parent: conservatively
                // give the entry back.
                self.primary_wsq.push(qe, level);
            }
        } else if let Some(qe) = self.migration_wsq.pop(level) {
            if qe.is_continuation && qe.evacuation_ptr.is_null() {
                debug_assert_eq!(qe.frame_base, self.cf_top as *mut u8);
                return;
            }
            self.migration_wsq.push(qe, level);
        }

        self.on_die_drifted(ts, ret, on_drift_die);
    }

    fn on_die_drifted<T, CbD>(&mut self, ts: *mut ThreadState<T>, ret: T, on_drift_die: CbD) -> !
    where
        T: Copy + 'static,
        CbD: FnOnce() + Copy + 'static,
    {
        on_drift_die();

        let retval: ThreadRetval<T> = ThreadRetval {
            value: ret,
            dag_prof: unsafe { (*self.tls).dag_prof },
        };
        window::put_value(unsafe { &mut (*ts).retval }, MaybeUninit::new(retval));

        // The race: exactly one of joiner and child observes 0.
        if window::atomic_faa_i32(unsafe { &mut (*ts).resume_flag }, 1) == 0 {
            trace!("won the join race for thread {:p} (dying side)", ts);
            // Ancestors can remain on the stack since ADWS does not strictly
            // follow work-first: mid-stack threads are stealable under depth
            // management, so evacuate them before leaving this stack.
            self.evacuate_all();
            self.resume_sched()
        } else {
            trace!("lost the join race for thread {:p} (dying side)", ts);
            let ss: SuspendedState = window::get_value(unsafe { &(*ts).suspended });
            self.resume_suspended(ss)
        }
    }

    //==================================================================================================================
    // Scheduler loop
    //==================================================================================================================

    pub fn sched_loop<Cb, Cond>(&mut self, mut cb: Cb, mut cond: Cond)
    where
        Cb: FnMut(),
        Cond: FnMut() -> bool,
    {
        trace!("entering scheduler loop");

        while !self.should_exit_sched_loop(&mut cond) {
            if let Some(cwt) = self.cross_worker_mailbox.pop() {
                self.execute_cross_worker_task(cwt);
                continue;
            }

            if let Some(pwe) = self.pop_from_primary_queues() {
                // No on-stack thread can exist while the scheduler runs.
                assert!(
                    !pwe.evacuation_ptr.is_null(),
                    "popped an on-stack frame from the scheduler loop"
                );
                unsafe {
                    self.suspend(move |w: &mut Worker, cf: *mut ContextFrame| {
                        w.sched_cf = cf;
                        w.resume_suspended(SuspendedState {
                            evacuation_ptr: pwe.evacuation_ptr,
                            frame_base: pwe.frame_base,
                            frame_size: pwe.frame_size,
                        });
                    });
                }
                continue;
            }

            if let Some(mwe) = self.pop_from_migration_queues() {
                self.use_primary_wsq = false;
                self.execute_migrated_task(mwe);
                self.use_primary_wsq = true;
                continue;
            }

            if self.options.adws_enable_steal {
                self.steal();
            }

            cb();
        }

        self.dtree_local_bottom_ref = NodeRef::default();
        trace!("exiting scheduler loop");
    }

    fn should_exit_sched_loop<Cond: FnMut() -> bool>(&mut self, cond: &mut Cond) -> bool {
        if self.options.sched_loop_make_progress {
            self.topo.make_progress();
        }

        self.execute_coll_task_if_arrived();

        if self.exit_request.is_none() && cond() {
            // The exit condition holds locally; the loop keeps serving work
            // until every rank has entered the termination barrier.
            self.exit_request = Some(self.topo.barrier_arrive());
        }
        if let Some(req) = self.exit_request {
            if req.test() {
                self.exit_request = None;
                return true;
            }
        }
        false
    }

    /// Cooperative check inside user code: migrated cross-worker tasks must
    /// not starve behind long-running local work.
    pub fn poll(&mut self) {
        if self.tls.is_null() || !self.cross_worker_mailbox.arrived() {
            return;
        }

        unsafe { (*self.tls).dag_prof.stop() };
        self.evacuate_all();
        unsafe {
            self.suspend(move |w: &mut Worker, cf: *mut ContextFrame| {
                let ss: SuspendedState = w.evacuate(cf);
                let tls: &ThreadLocalStorage = &*w.tls;
                let level: usize = Self::level(tls.dtree_node_ref.depth);
                if w.use_primary_wsq {
                    w.primary_wsq.push(
                        PrimaryEntry {
                            evacuation_ptr: ss.evacuation_ptr,
                            frame_base: ss.frame_base,
                            frame_size: ss.frame_size,
                            tg_version: tls.tg_version,
                        },
                        level,
                    );
                } else {
                    w.migration_wsq.push(
                        MigrationEntry {
                            is_continuation: true,
                            evacuation_ptr: ss.evacuation_ptr,
                            frame_base: ss.frame_base,
                            frame_size: ss.frame_size,
                            tg_version: tls.tg_version,
                        },
                        level,
                    );
                }
                w.resume_sched();
            });
        }
        unsafe { (*self.tls).dag_prof.start() };
    }

    //==================================================================================================================
    // Stealing
    //==================================================================================================================

    fn steal(&mut self) {
        let node = match self.dtree.get_topmost_dominant(self.dtree_local_bottom_ref) {
            Some(node) => node,
            None => return,
        };
        let steal_range: DistRange = node.drange;
        let tg_version: Flipper = node.tg_version;
        let depth: i32 = node.depth();

        let begin_rank: Rank = steal_range.begin_rank();
        let mut end_rank: Rank = steal_range.end_rank();
        if steal_range.is_at_end_boundary() {
            end_rank -= 1;
        }
        if begin_rank == end_rank {
            return;
        }

        trace!(
            "stealing within dominant task group [{}, {}) at depth {}",
            steal_range.begin(),
            steal_range.end(),
            depth
        );

        // Reuse the dtree lookup for several attempts.
        let max_reuse: usize = self.options.adws_max_dtree_reuse.max(1);
        for _ in 0..max_reuse {
            let target_rank: Rank = self.rng.gen_range(begin_rank..=end_rank);

            if target_rank != begin_rank {
                let cond = move |mwe: &MigrationEntry| mwe.tg_version.matches(tg_version, depth as usize);
                if self.steal_from_migration_queues(target_rank, depth, cond) {
                    return;
                }
            }

            // The owner of the range end may still be running the sequential
            // tail of the group on its stack; only steal from its primary
            // queue when the range ends on a boundary.
            if target_rank != end_rank || steal_range.is_at_end_boundary() {
                let cond = move |pwe: &PrimaryEntry| pwe.tg_version.matches(tg_version, depth as usize);
                if self.steal_from_primary_queues(target_rank, depth, cond) {
                    return;
                }
            }

            // A cross-worker task is always more important than a steal.
            if let Some(cwt) = self.cross_worker_mailbox.pop() {
                self.execute_cross_worker_task(cwt);
                return;
            }
        }
    }

    fn steal_from_primary_queues<C>(&mut self, target_rank: Rank, min_dtree_depth: i32, cond: C) -> bool
    where
        C: Fn(&PrimaryEntry) -> bool,
    {
        let w: *mut Worker = self;
        let mut steal_success: bool = false;

        let min_level: usize = Self::level(min_dtree_depth);
        let n_levels: usize = self.primary_wsq.n_levels();
        self.primary_wsq
            .for_each_nonempty_queue(target_rank, min_level, n_levels, false, |d: usize| unsafe {
                let q: &WsQueue<PrimaryEntry> = &(*w).primary_wsq;
                if !q.trylock(target_rank, d) {
                    return false;
                }
                let pwe: PrimaryEntry = match q.steal_nolock(target_rank, d) {
                    Some(pwe) => pwe,
                    None => {
                        q.unlock(target_rank, d);
                        return false;
                    },
                };
                if !cond(&pwe) {
                    q.abort_steal(target_rank, d);
                    q.unlock(target_rank, d);
                    return false;
                }

                if !pwe.evacuation_ptr.is_null() {
                    // An evacuated continuation.
                    debug!("stole evacuated frame [{:p}, {} bytes) from rank {}", pwe.frame_base, pwe.frame_size, target_rank);
                    q.unlock(target_rank, d);
                    (*w).suspend(move |w: &mut Worker, cf: *mut ContextFrame| {
                        w.sched_cf = cf;
                        w.resume_suspended(SuspendedState {
                            evacuation_ptr: pwe.evacuation_ptr,
                            frame_base: pwe.frame_base,
                            frame_size: pwe.frame_size,
                        });
                    });
                } else {
                    // A frame still on the victim's stack: copy it into the
                    // same address here.
                    debug!("stole on-stack frame [{:p}, {} bytes) from rank {}", pwe.frame_base, pwe.frame_size, target_rank);
                    (*w).stack.direct_copy_from(pwe.frame_base, pwe.frame_size, target_rank);
                    q.unlock(target_rank, d);

                    let next_cf: *mut ContextFrame = pwe.frame_base as *mut ContextFrame;
                    (*w).suspend(move |w: &mut Worker, cf: *mut ContextFrame| {
                        w.sched_cf = cf;
                        context::clear_parent_frame(next_cf);
                        context::resume(next_cf);
                    });
                }

                steal_success = true;
                true
            });

        steal_success
    }

    fn steal_from_migration_queues<C>(&mut self, target_rank: Rank, min_dtree_depth: i32, cond: C) -> bool
    where
        C: Fn(&MigrationEntry) -> bool,
    {
        let w: *mut Worker = self;
        let mut steal_success: bool = false;

        let min_level: usize = Self::level(min_dtree_depth);
        let n_levels: usize = self.migration_wsq.n_levels();
        self.migration_wsq
            .for_each_nonempty_queue(target_rank, min_level, n_levels, true, |d: usize| unsafe {
                let q: &WsQueue<MigrationEntry> = &(*w).migration_wsq;
                if !q.trylock(target_rank, d) {
                    return false;
                }
                let mwe: MigrationEntry = match q.steal_nolock(target_rank, d) {
                    Some(mwe) => mwe,
                    None => {
                        q.unlock(target_rank, d);
                        return false;
                    },
                };
                if !cond(&mwe) {
                    q.abort_steal(target_rank, d);
                    q.unlock(target_rank, d);
                    return false;
                }

                if !mwe.is_continuation {
                    // A fresh task: run it on a clean stack.
                    debug!("stole a new task from rank {}", target_rank);
                    q.unlock(target_rank, d);
                    (*w).suspend(move |w: &mut Worker, cf: *mut ContextFrame| {
                        w.sched_cf = cf;
                        w.start_new_task(mwe.frame_base, mwe.frame_size);
                    });
                } else if !mwe.evacuation_ptr.is_null() {
                    debug!("stole an evacuated continuation from rank {}", target_rank);
                    q.unlock(target_rank, d);
                    (*w).suspend(move |w: &mut Worker, cf: *mut ContextFrame| {
                        w.sched_cf = cf;
                        w.resume_suspended(SuspendedState {
                            evacuation_ptr: mwe.evacuation_ptr,
                            frame_base: mwe.frame_base,
                            frame_size: mwe.frame_size,
                        });
                    });
                } else {
                    debug!("stole an on-stack continuation from rank {}", target_rank);
                    (*w).stack.direct_copy_from(mwe.frame_base, mwe.frame_size, target_rank);
                    q.unlock(target_rank, d);

                    let next_cf: *mut ContextFrame = mwe.frame_base as *mut ContextFrame;
                    (*w).suspend(move |w: &mut Worker, cf: *mut ContextFrame| {
                        w.sched_cf = cf;
                        context::resume(next_cf);
                    });
                }

                steal_success = true;
                true
            });

        steal_success
    }

    //==================================================================================================================
    // Task execution helpers
    //==================================================================================================================

    fn execute_cross_worker_task(&mut self, cwt: CrossWorkerTask) {
        if cwt.evacuation_ptr.is_null() {
            trace!("received a new cross-worker task");
            unsafe {
                self.suspend(move |w: &mut Worker, cf: *mut ContextFrame| {
                    w.sched_cf = cf;
                    w.start_new_task(cwt.frame_base, cwt.frame_size);
                });
            }
        } else {
            trace!("received a continuation of a cross-worker task");
            unsafe {
                self.suspend(move |w: &mut Worker, cf: *mut ContextFrame| {
                    w.sched_cf = cf;
                    w.resume_suspended(SuspendedState {
                        evacuation_ptr: cwt.evacuation_ptr,
                        frame_base: cwt.frame_base,
                        frame_size: cwt.frame_size,
                    });
                });
            }
        }
    }

    fn execute_migrated_task(&mut self, mwe: MigrationEntry) {
        if !mwe.is_continuation {
            trace!("popped a new task from the local migration queues");
            unsafe {
                self.suspend(move |w: &mut Worker, cf: *mut ContextFrame| {
                    w.sched_cf = cf;
                    w.start_new_task(mwe.frame_base, mwe.frame_size);
                });
            }
        } else if !mwe.evacuation_ptr.is_null() {
            trace!("popped an evacuated continuation from the local migration queues");
            unsafe {
                self.suspend(move |w: &mut Worker, cf: *mut ContextFrame| {
                    w.sched_cf = cf;
                    w.resume_suspended(SuspendedState {
                        evacuation_ptr: mwe.evacuation_ptr,
                        frame_base: mwe.frame_base,
                        frame_size: mwe.frame_size,
                    });
                });
            }
        } else {
            panic!("on-stack threads cannot remain after switching to the scheduler");
        }
    }

    fn pop_from_primary_queues(&mut self) -> Option<PrimaryEntry> {
        for level in (0..self.primary_wsq.n_levels()).rev() {
            if let Some(pwe) = self.primary_wsq.pop(level) {
                return Some(pwe);
            }
        }
        None
    }

    fn pop_from_migration_queues(&mut self) -> Option<MigrationEntry> {
        for level in 0..self.migration_wsq.n_levels() {
            if let Some(mwe) = self.migration_wsq.pop(level) {
                return Some(mwe);
            }
        }
        None
    }

    /// Copies a callable task into a staging buffer at the bottom of a clean
    /// user stack, releases the sender's block (its home rank observes the
    /// free), and runs the task.
    fn start_new_task(&mut self, task_ptr: *mut u8, task_size: usize) -> ! {
        assert!(
            task_size <= MAX_CALLABLE_TASK_SIZE,
            "callable task too large ({} > {} bytes)",
            task_size,
            MAX_CALLABLE_TASK_SIZE
        );
        unsafe {
            self.root_on_stack(move || {
                let w: &mut Worker = worker_mut();
                let mut buf: [u64; MAX_CALLABLE_TASK_SIZE / 8] = [0u64; MAX_CALLABLE_TASK_SIZE / 8];
                window::get_bytes(buf.as_mut_ptr() as *mut u8, task_ptr, task_size);
                w.suspended_heap.deallocate(task_ptr, task_size);
                task::execute_task(buf.as_mut_ptr() as *mut TaskHeader);
                unreachable!("a migrated task must not return");
            })
        }
    }

    //==================================================================================================================
    // Collective execution
    //==================================================================================================================

    /// Runs `f` on every rank. Callable from the SPMD region or from the root
    /// thread; only the initiating rank receives the return value.
    pub fn coll_exec<T, F>(&mut self, f: F) -> T
    where
        T: Copy + 'static,
        F: FnOnce() -> T + Copy + 'static,
    {
        assert!(
            self.is_spmd || self.is_executing_root(),
            "coll_exec() must be called from the SPMD region or the root thread"
        );

        let begin_rank: Rank = self.topo.my_rank();
        let mut retv: MaybeUninit<T> = MaybeUninit::uninit();
        let retv_ptr: *mut T = retv.as_mut_ptr();

        let coll_fn = move || {
            let w: &mut Worker = worker_mut();
            let ret: T = f();
            if w.topo.my_rank() == begin_rank {
                unsafe { retv_ptr.write(ret) };
            }
        };

        let task_size: usize = CallableTask::<_>::size_of_val(&coll_fn);
        let task_ptr: *mut u8 = self.suspended_heap.allocate(task_size);
        unsafe { CallableTask::write_to(task_ptr, coll_fn) };

        let ct: CollTask = CollTask {
            task_ptr,
            task_size,
            begin_rank,
        };
        self.execute_coll_task(task_ptr as *mut TaskHeader, ct);

        self.suspended_heap.deallocate(task_ptr, task_size);
        unsafe { retv.assume_init() }
    }

    /// Disseminates a collective task along a binary tree rooted at the
    /// initiator and executes it, bracketed by two barriers: no rank starts
    /// before all have received it, and no rank deallocates before all have
    /// finished.
    fn execute_coll_task(&mut self, t: *mut TaskHeader, ct: CollTask) {
        let n_ranks: Rank = self.topo.n_ranks();
        let my_rank_shifted: Rank = (self.topo.my_rank() + n_ranks - ct.begin_rank) % n_ranks;

        let mut i: Rank = (n_ranks as u32).next_power_of_two() as Rank;
        while i > 1 {
            if my_rank_shifted % i == 0 {
                let target_rank_shifted: Rank = my_rank_shifted + i / 2;
                if target_rank_shifted < n_ranks {
                    let target_rank: Rank = (target_rank_shifted + ct.begin_rank) % n_ranks;
                    self.coll_task_mailbox.put(
                        CollTask {
                            task_ptr: t as *mut u8,
                            task_size: ct.task_size,
                            begin_rank: ct.begin_rank,
                        },
                        target_rank,
                    );
                }
            }
            i /= 2;
        }

        self.topo.barrier();
        unsafe { task::execute_task(t) };
        self.topo.barrier();
    }

    fn execute_coll_task_if_arrived(&mut self) {
        if let Some(ct) = self.coll_task_mailbox.pop() {
            let local: *mut u8 = self.suspended_heap.allocate(ct.task_size);
            window::get_bytes(local, ct.task_ptr, ct.task_size);
            self.execute_coll_task(
                local as *mut TaskHeader,
                CollTask {
                    task_ptr: local,
                    task_size: ct.task_size,
                    begin_rank: ct.begin_rank,
                },
            );
            self.suspended_heap.deallocate(local, ct.task_size);
        }
    }

    //==================================================================================================================
    // Context plumbing
    //==================================================================================================================

    /// Saves the current context and runs `f` on the fresh top of the stack.
    /// The only place where control can transfer to another task.
    unsafe fn suspend<F>(&mut self, f: F)
    where
        F: FnOnce(&mut Worker, *mut ContextFrame),
    {
        let prev_cf_top: *mut ContextFrame = self.cf_top;
        let prev_tls: *mut ThreadLocalStorage = self.tls;
        let w: *mut Worker = self;

        context::save_context_with_call(prev_cf_top, move |cf: *mut ContextFrame| {
            (*w).cf_top = cf;
            f(&mut *w, cf);
        });

        self.cf_top = prev_cf_top;
        self.tls = prev_tls;
    }

    /// Copies the frame `[cf, cf.parent)` into the remotable allocator.
    fn evacuate(&mut self, cf: *mut ContextFrame) -> SuspendedState {
        let frame_size: usize = unsafe { (*cf).parent as usize - cf as usize };
        let evacuation_ptr: *mut u8 = self.suspended_heap.allocate(frame_size);
        unsafe { ptr::copy_nonoverlapping(cf as *const u8, evacuation_ptr, frame_size) };
        trace!("evacuated frame [{:p}, {} bytes) to {:p}", cf, frame_size, evacuation_ptr);
        SuspendedState {
            evacuation_ptr,
            frame_base: cf as *mut u8,
            frame_size,
        }
    }

    /// Evacuates every on-stack continuation in the active queues. Done
    /// before abandoning the current stack: a thief may otherwise copy a
    /// frame out of a stack region this worker is about to reuse.
    fn evacuate_all(&mut self) {
        let w: *mut Worker = self;
        let depth: i32 = unsafe { (*self.tls).dtree_node_ref.depth };
        if self.use_primary_wsq {
            for level in (0..=Self::level(depth)).rev() {
                self.primary_wsq.for_each_entry(level, |pwe: &mut PrimaryEntry| {
                    if pwe.evacuation_ptr.is_null() {
                        let ss: SuspendedState =
                            unsafe { (*w).evacuate(pwe.frame_base as *mut ContextFrame) };
                        *pwe = PrimaryEntry {
                            evacuation_ptr: ss.evacuation_ptr,
                            frame_base: ss.frame_base,
                            frame_size: ss.frame_size,
                            tg_version: pwe.tg_version,
                        };
                    }
                });
            }
        } else {
            self.migration_wsq.for_each_entry(Self::level(depth), |mwe: &mut MigrationEntry| {
                if mwe.is_continuation && mwe.evacuation_ptr.is_null() {
                    let ss: SuspendedState = unsafe { (*w).evacuate(mwe.frame_base as *mut ContextFrame) };
                    *mwe = MigrationEntry {
                        is_continuation: true,
                        evacuation_ptr: ss.evacuation_ptr,
                        frame_base: ss.frame_base,
                        frame_size: ss.frame_size,
                        tg_version: mwe.tg_version,
                    };
                }
            });
        }
    }

    /// Brings an evacuated frame back to its home address and resumes it. The
    /// suspended state travels by value: the locals of this call may be
    /// overwritten by the incoming frame.
    fn resume_suspended(&mut self, ss: SuspendedState) -> ! {
        trace!(
            "resuming frame [{:p}, {} bytes) evacuated at {:p}",
            ss.frame_base,
            ss.frame_size,
            ss.evacuation_ptr
        );

        unsafe extern "C" fn land(evacuation_ptr: *mut c_void, frame_base: *mut c_void, frame_size: *mut c_void) {
            let w: &mut Worker = worker_mut();
            let frame_size: usize = frame_size as usize;
            window::get_bytes(frame_base as *mut u8, evacuation_ptr as *const u8, frame_size);
            w.suspended_heap.deallocate(evacuation_ptr as *mut u8, frame_size);
            context::resume(frame_base as *mut ContextFrame)
        }

        unsafe {
            context::jump_to_stack(
                ss.frame_base,
                land,
                ss.evacuation_ptr as *mut c_void,
                ss.frame_base as *mut c_void,
                ss.frame_size as *mut c_void,
            )
        }
    }

    fn resume_sched(&mut self) -> ! {
        self.cf_top = ptr::null_mut();
        self.tls = ptr::null_mut();
        trace!("resuming scheduler context");
        unsafe { context::resume(self.sched_cf) }
    }

    /// Runs `f` at the bottom of the user call stack, leaving a margin of one
    /// frame save area (written by clear_parent_frame of root frames).
    unsafe fn root_on_stack<F: FnOnce()>(&mut self, f: F) -> ! {
        self.cf_top = self.stack_top();
        context::call_on_stack(self.stack.top(), self.stack.size() - FRAME_RESERVED, f)
    }

    fn stack_top(&self) -> *mut ContextFrame {
        unsafe { self.stack.bottom().sub(FRAME_RESERVED) as *mut ContextFrame }
    }

    /// Queue level of a distribution-tree depth (the root sentinel depth -1
    /// maps to level 0).
    fn level(depth: i32) -> usize {
        debug_assert!(depth >= -1);
        (depth + 1) as usize
    }
}
