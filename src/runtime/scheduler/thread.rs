// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    scheduler::task::{
        ThreadRetval,
        ThreadState,
    },
    worker_mut,
};
use ::std::{
    mem::MaybeUninit,
    ptr,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Handle of a forked thread. Forking either descends into the child
/// immediately (work-first) or passes it to the owner of its distribution
/// sub-range; joining returns the child's value either through the serialized
/// fast path (a plain value move, no shared memory touched) or through the
/// join race on the shared thread state.
///
/// The handle lives in the forking thread's frame and migrates with it.
pub struct Thread<T: Copy + 'static> {
    pub(crate) state: *mut ThreadState<T>,
    pub(crate) serialized: bool,
    pub(crate) retval_ser: MaybeUninit<ThreadRetval<T>>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl<T: Copy + 'static> Thread<T> {
    /// Forks `f` as a new thread with equal work hints.
    pub fn fork<F>(f: F) -> Self
    where
        F: FnOnce() -> T + Copy + 'static,
    {
        Self::fork_with_hints(1.0, 1.0, f)
    }

    /// Forks `f` as a new thread. `w_new` and `w_rest` are opaque work
    /// weights for the spawned thread and the continuation; only their ratio
    /// matters.
    pub fn fork_with_hints<F>(w_new: f64, w_rest: f64, f: F) -> Self
    where
        F: FnOnce() -> T + Copy + 'static,
    {
        let mut th: Thread<T> = Thread {
            state: ptr::null_mut(),
            serialized: false,
            retval_ser: MaybeUninit::uninit(),
        };
        worker_mut().fork(&mut th, || {}, || {}, w_new, w_rest, f);
        th
    }

    /// Waits for the thread and returns its value.
    pub fn join(mut self) -> T {
        worker_mut().join(&mut self)
    }

    /// Whether the fork degenerated to a plain call (nobody stole the
    /// continuation). A serialized thread holds no shared state.
    pub fn is_serialized(&self) -> bool {
        self.serialized
    }

    /// Whether the thread still holds a shared state block.
    pub fn has_state(&self) -> bool {
        !self.state.is_null()
    }
}
