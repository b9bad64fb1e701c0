// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Spindle is a distributed task-parallel runtime. It executes nested
//! fork-join task trees across a fixed set of processes (one worker per
//! process) under an almost-deterministic, locality-aware work-stealing
//! scheduler. Workers cooperate through one-sided operations on
//! process-shared memory: call-stack frames are migrated byte-wise between
//! identical virtual addresses, and steal targets are directed by a
//! distribution tree that maps subtrees of the task graph onto intervals
//! of workers.

#[macro_use]
extern crate log;

mod pal;

pub mod container;
pub mod pattern;
pub mod runtime;

pub use crate::{
    container::global_vec::GlobalVec,
    pattern::{
        execution,
        reduce,
        transform_reduce,
    },
    runtime::{
        coll_exec,
        fail::Fail,
        fini,
        init,
        is_spmd,
        poll,
        root_exec,
        scheduler::thread::Thread,
        task_group_begin,
        task_group_end,
    },
};

/// Ensures that two expressions are equal, bailing out otherwise.
#[macro_export]
macro_rules! ensure_eq {
    ($lhs:expr, $rhs:expr) => {{
        let lhs = $lhs;
        let rhs = $rhs;
        if lhs != rhs {
            anyhow::bail!(
                "ensure_eq failed: `{}` == `{}` ({:?} != {:?})",
                stringify!($lhs),
                stringify!($rhs),
                lhs,
                rhs
            );
        }
    }};
}

/// Ensures that two expressions are not equal, bailing out otherwise.
#[macro_export]
macro_rules! ensure_neq {
    ($lhs:expr, $rhs:expr) => {{
        let lhs = $lhs;
        let rhs = $rhs;
        if lhs == rhs {
            anyhow::bail!(
                "ensure_neq failed: `{}` != `{}` (both {:?})",
                stringify!($lhs),
                stringify!($rhs),
                lhs
            );
        }
    }};
}
