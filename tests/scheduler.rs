// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! End-to-end scheduler tests at world size one. Multi-rank variants live in
//! `tests/multirank.rs`.

use ::anyhow::Result;
use ::spindle::{
    execution,
    reduce,
    runtime,
    transform_reduce,
    GlobalVec,
    Thread,
};
use ::std::sync::{
    atomic::{
        AtomicUsize,
        Ordering,
    },
    Mutex,
};

/// The runtime is a process-wide singleton; tests sharing the process take
/// turns.
static RUNTIME_LOCK: Mutex<()> = Mutex::new(());

fn with_runtime<F: FnOnce()>(tag: &str, f: F) {
    let _guard = RUNTIME_LOCK.lock().unwrap();
    let session: String = format!("spindle-test-sched-{}-{}", tag, std::process::id());
    runtime::init_with(0, 1, &session);
    f();
    runtime::fini();
}

fn fib(n: u64) -> u64 {
    if n <= 1 {
        1
    } else {
        let th: Thread<u64> = Thread::fork(move || fib(n - 1));
        let y: u64 = fib(n - 2);
        let x: u64 = th.join();
        x + y
    }
}

/// Recursive two-task fork of fib(10) returns 89.
#[test]
fn fib_via_root_exec() -> Result<()> {
    let mut result: u64 = 0;
    with_runtime("fib", || {
        result = spindle::root_exec(|| fib(10));
    });
    spindle::ensure_eq!(result, 89);
    Ok(())
}

/// A fork whose continuation nobody steals degrades to a call: no thread
/// state is kept and join is a plain value move.
#[test]
fn serialized_fork_fast_path() -> Result<()> {
    let mut observed: (bool, bool, u64) = (false, false, 0);
    with_runtime("serialized", || {
        observed = spindle::root_exec(|| {
            let th: Thread<u64> = Thread::fork(|| 21 + 21);
            let serialized: bool = th.is_serialized();
            let has_state: bool = th.has_state();
            (serialized, has_state, th.join())
        });
    });
    spindle::ensure_eq!(observed.0, true);
    spindle::ensure_eq!(observed.1, false);
    spindle::ensure_eq!(observed.2, 42);
    Ok(())
}

/// A task group begun and ended with no forks is a no-op round trip, and
/// nested fork trees inside task groups complete.
#[test]
fn task_group_round_trip() -> Result<()> {
    let mut result: u64 = 0;
    with_runtime("taskgroup", || {
        result = spindle::root_exec(|| {
            let mut empty = spindle::task_group_begin();
            spindle::task_group_end(&mut empty);

            let mut tg = spindle::task_group_begin();
            let th: Thread<u64> = Thread::fork(|| fib(5));
            let y: u64 = fib(5);
            let x: u64 = th.join();
            spindle::task_group_end(&mut tg);
            x + y
        });
    });
    spindle::ensure_eq!(result, 16);
    Ok(())
}

/// The load-balancing skeleton: leaves enter the barrier once per rank in
/// aggregate (trivially once at world size one).
#[test]
fn lb_enters_barrier() -> Result<()> {
    fn lb(n: i32) {
        if n == 0 {
        } else if n == 1 {
            runtime::barrier();
        } else {
            let th: Thread<i32> = Thread::fork(move || {
                lb(n / 2);
                0
            });
            lb(n - n / 2);
            th.join();
        }
    }

    with_runtime("lb", || {
        spindle::root_exec(|| {
            lb(runtime::n_ranks());
            0
        });
    });
    Ok(())
}

/// coll_exec runs the closure exactly once per rank and returns the captured
/// environment's value to the initiator.
#[test]
fn coll_exec_captures_environment() -> Result<()> {
    static HITS: AtomicUsize = AtomicUsize::new(0);

    let mut result: i32 = 0;
    with_runtime("coll", || {
        HITS.store(0, Ordering::SeqCst);
        let x: i32 = 42;
        result = spindle::coll_exec(move || {
            HITS.fetch_add(1, Ordering::SeqCst);
            x
        });
    });
    spindle::ensure_eq!(result, 42);
    spindle::ensure_eq!(HITS.load(Ordering::SeqCst), 1);
    Ok(())
}

/// coll_exec is also legal from inside the root thread.
#[test]
fn coll_exec_from_root_thread() -> Result<()> {
    let mut result: i32 = 0;
    with_runtime("collroot", || {
        result = spindle::root_exec(|| spindle::coll_exec(|| 7) + 1);
    });
    spindle::ensure_eq!(result, 8);
    Ok(())
}

/// Dot product of a collective and a non-collective vector under the
/// parallel policy.
#[test]
fn dot_product() -> Result<()> {
    let mut result: i64 = 0;
    with_runtime("dot", || {
        result = spindle::root_exec(|| {
            let v_coll: GlobalVec<i64> = GlobalVec::new_coll(5, 0);
            let v_noncoll: GlobalVec<i64> = GlobalVec::new(5, 0);
            for i in 0..5 {
                v_coll.put(i, (i + 1) as i64).unwrap();
                v_noncoll.put(i, (i + 2) as i64).unwrap();
            }
            transform_reduce(
                execution::PAR,
                &v_coll,
                &v_noncoll,
                0,
                |acc: i64, x: i64| acc + x,
                |a: i64, b: i64| a * b,
            )
        });
    });
    spindle::ensure_eq!(result, 70);
    Ok(())
}

/// The sequenced policy computes the same dot product without forking.
#[test]
fn dot_product_sequenced() -> Result<()> {
    let mut result: i64 = 0;
    with_runtime("dotseq", || {
        result = spindle::root_exec(|| {
            let a: GlobalVec<i64> = GlobalVec::new(5, 0);
            let b: GlobalVec<i64> = GlobalVec::new(5, 0);
            for i in 0..5 {
                a.put(i, (i + 1) as i64).unwrap();
                b.put(i, (i + 2) as i64).unwrap();
            }
            transform_reduce(
                execution::SEQ,
                &a,
                &b,
                0,
                |acc: i64, x: i64| acc + x,
                |x: i64, y: i64| x * y,
            )
        });
    });
    spindle::ensure_eq!(result, 70);
    Ok(())
}

/// Resize of a collective vector from 10000 to 100000 with fill 3, then a
/// parallel reduce.
#[test]
fn resize_and_reduce() -> Result<()> {
    let mut result: i64 = 0;
    with_runtime("resize", || {
        result = spindle::root_exec(|| {
            let mut v: GlobalVec<i64> = GlobalVec::new_coll(10000, 0);
            for i in 0..10000 {
                v.put(i, i as i64).unwrap();
            }
            v.resize(100000, 3);
            reduce(
                execution::ParallelPolicy::with_cutoff(1000),
                &v,
                0,
                |a: i64, b: i64| a + b,
            )
        });
    });
    spindle::ensure_eq!(result, 10000 * 9999 / 2 + 90000 * 3);
    Ok(())
}

/// for_each_index touches every index exactly once.
#[test]
fn for_each_visits_every_index() -> Result<()> {
    let mut ok: bool = false;
    with_runtime("foreach", || {
        ok = spindle::root_exec(|| {
            let v: GlobalVec<u64> = GlobalVec::new(256, 0);
            spindle::pattern::for_each_index(execution::ParallelPolicy::with_cutoff(16), 0..256, move |i: usize| {
                v.put(i, (i * 2) as u64).unwrap();
            });
            (0..256).all(|i| v.get(i).unwrap() == (i * 2) as u64)
        });
    });
    spindle::ensure_eq!(ok, true);
    Ok(())
}

/// poll() inside user code is a no-op when no cross-worker task is pending.
#[test]
fn poll_is_cooperative_noop() -> Result<()> {
    let mut result: u64 = 0;
    with_runtime("poll", || {
        result = spindle::root_exec(|| {
            let mut acc: u64 = 0;
            for i in 0..100u64 {
                acc += i;
                spindle::poll();
            }
            acc
        });
    });
    spindle::ensure_eq!(result, 4950);
    Ok(())
}

/// The SPMD flag flips around root_exec.
#[test]
fn spmd_detection() -> Result<()> {
    with_runtime("spmd", || {
        assert!(spindle::is_spmd());
        let inside: bool = spindle::root_exec(|| spindle::is_spmd());
        assert!(!inside);
        assert!(spindle::is_spmd());
    });
    Ok(())
}
